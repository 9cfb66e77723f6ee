//! IP to country resolution.
//!
//! The per-geography limiter only needs a country code for an IP. The
//! resolver is a trait so deployments can plug in a GeoIP database; the
//! built-in [`StaticGeoResolver`] serves a CIDR table from configuration.

use std::net::IpAddr;

use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::access::parse_network;

/// Failure reported by a [`GeoResolver`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct GeoError(pub String);

/// Resolves client IPs to ISO country codes.
///
/// Implementations must be in-memory or answer quickly; callers bound every
/// lookup with a short timeout.
#[async_trait]
pub trait GeoResolver: Send + Sync {
    /// Resolve `ip` to an upper-case country code, or `None` if unknown.
    async fn resolve(&self, ip: &str) -> std::result::Result<Option<String>, GeoError>;
}

/// One row of a static geo table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoRange {
    pub cidr: String,
    pub country: String,
}

/// Longest-prefix CIDR table.
#[derive(Debug, Default)]
pub struct StaticGeoResolver {
    ranges: RwLock<Vec<(IpNet, String)>>,
}

impl StaticGeoResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configured ranges.
    pub fn from_ranges(ranges: &[GeoRange]) -> Result<Self> {
        let resolver = Self::new();
        for range in ranges {
            let net = parse_network(&range.cidr).ok_or_else(|| {
                GatekeeperError::Config(format!("geo range '{}' is not a valid CIDR", range.cidr))
            })?;
            resolver.insert(net, &range.country);
        }
        Ok(resolver)
    }

    pub fn insert(&self, net: IpNet, country: &str) {
        self.ranges.write().push((net, country.to_ascii_uppercase()));
    }

    pub fn len(&self) -> usize {
        self.ranges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.read().is_empty()
    }

    /// Most specific match for `addr`.
    pub fn lookup(&self, addr: IpAddr) -> Option<String> {
        self.ranges
            .read()
            .iter()
            .filter(|(net, _)| net.contains(&addr))
            .max_by_key(|(net, _)| net.prefix_len())
            .map(|(_, country)| country.clone())
    }
}

#[async_trait]
impl GeoResolver for StaticGeoResolver {
    async fn resolve(&self, ip: &str) -> std::result::Result<Option<String>, GeoError> {
        match ip.trim().parse::<IpAddr>() {
            Ok(addr) => Ok(self.lookup(addr)),
            Err(_) => Ok(None),
        }
    }
}
