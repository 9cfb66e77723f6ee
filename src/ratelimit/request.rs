//! The per-request facts the admission layer consumes.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Client IP used when no source address can be determined.
pub const UNKNOWN_IP: &str = "unknown";

/// Caller identity supplied by the surrounding authentication layer.
///
/// Inserted into request extensions by upstream middleware; the admission
/// layer never authenticates anything itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    #[serde(default)]
    pub role: Option<String>,
}

/// Everything an admission decision needs to know about one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub client_ip: String,
    pub user_id: Option<String>,
    pub role: Option<String>,
    pub path: String,
    pub method: String,
    pub user_agent: Option<String>,
}

impl RequestContext {
    /// Create an anonymous GET request from `client_ip` to `path`.
    pub fn new(client_ip: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            client_ip: client_ip.into(),
            user_id: None,
            role: None,
            path: path.into(),
            method: "GET".to_string(),
            user_agent: None,
        }
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.user_id = Some(identity.user_id);
        self.role = identity.role;
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// True when the request carries an authenticated identity.
    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }
}

/// Resolve the client IP from forwarding headers and the peer address.
///
/// Precedence is the first `X-Forwarded-For` hop, then `X-Real-IP`, then the
/// transport peer, then [`UNKNOWN_IP`]. Addresses are returned in canonical
/// form so they key the same state as admin calls; a value that does not
/// parse as an IP is kept verbatim.
pub fn resolve_client_ip(
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    peer: Option<&str>,
) -> String {
    let first_hop = forwarded_for
        .and_then(|xff| xff.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty());

    first_hop
        .or_else(|| real_ip.map(str::trim).filter(|s| !s.is_empty()))
        .or_else(|| peer.map(str::trim).filter(|s| !s.is_empty()))
        .map(canonical_ip)
        .unwrap_or_else(|| UNKNOWN_IP.to_string())
}

/// Canonical text form of `raw`, or `raw` itself when it is not an IP.
fn canonical_ip(raw: &str) -> String {
    raw.parse::<IpAddr>()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| raw.to_string())
}
