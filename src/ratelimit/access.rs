//! IP allowlist / blocklist matching.

use std::net::IpAddr;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use crate::error::{GatekeeperError, Result};

/// Parse a CIDR range or a bare address into a network.
///
/// Bare addresses become single-host networks.
pub fn parse_network(s: &str) -> Option<IpNet> {
    let s = s.trim();
    if let Ok(net) = s.parse::<IpNet>() {
        return Some(net);
    }
    match s.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => Ipv4Net::new(v4, 32).ok().map(IpNet::V4),
        Ok(IpAddr::V6(v6)) => Ipv6Net::new(v6, 128).ok().map(IpNet::V6),
        Err(_) => None,
    }
}

/// A set of networks a client IP is checked against.
#[derive(Debug, Clone, Default)]
pub struct IpList {
    nets: Vec<IpNet>,
}

impl IpList {
    /// Parse every entry, failing on the first one that is not a CIDR or IP.
    pub fn parse(name: &str, entries: &[String]) -> Result<Self> {
        let nets = entries
            .iter()
            .map(|entry| {
                parse_network(entry).ok_or_else(|| {
                    GatekeeperError::Config(format!(
                        "{}: '{}' is not a valid CIDR range or IP address",
                        name, entry
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { nets })
    }

    /// Whether `ip` falls in any network. Unparseable IPs never match.
    pub fn contains(&self, ip: &str) -> bool {
        if self.nets.is_empty() {
            return false;
        }
        match ip.trim().parse::<IpAddr>() {
            Ok(addr) => self.nets.iter().any(|net| net.contains(&addr)),
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.nets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nets.is_empty()
    }
}
