//! Counter key generation and handling.

use std::fmt;

/// A key that uniquely identifies one counted dimension.
///
/// Every limiter layer shares the same window store, so the key carries the
/// dimension as a prefix. Geo and rule keys embed the client IP so they
/// compose with, rather than collide with, per-IP counting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LimitKey {
    /// The single service-wide counter
    Global,
    /// Per client IP
    Ip(String),
    /// Per authenticated user id
    User(String),
    /// Per country, further split by client IP
    Geo { country: String, ip: String },
    /// Per custom rule, further split by client IP
    Rule { id: String, ip: String },
}

impl LimitKey {
    /// The IP this key is scoped to, if any.
    pub fn ip(&self) -> Option<&str> {
        match self {
            LimitKey::Ip(ip) | LimitKey::Geo { ip, .. } | LimitKey::Rule { ip, .. } => Some(ip),
            LimitKey::Global | LimitKey::User(_) => None,
        }
    }

    /// Convert the key to its string representation.
    pub fn to_string_key(&self) -> String {
        match self {
            LimitKey::Global => "global".to_string(),
            LimitKey::Ip(ip) => format!("ip:{}", ip),
            LimitKey::User(id) => format!("user:{}", id),
            LimitKey::Geo { country, ip } => format!("geo:{}:{}", country, ip),
            LimitKey::Rule { id, ip } => format!("rule:{}:{}", id, ip),
        }
    }
}

impl fmt::Display for LimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}
