//! Client identity resolution.
//!
//! Turns the raw client address handed over by the HTTP layer into an
//! [`Identity`]: a stable key used for every downstream lookup plus a trust
//! classification. Resolution never fails. Anything that cannot be parsed is
//! treated as suspicious and shares a single key.

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

use crate::config::IdentityConfig;
use crate::error::{Result, WardenError};

/// Key shared by every address that failed to parse.
pub const UNRESOLVED_KEY: &str = "unresolved";

/// Trust classification of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trust {
    Trusted,
    Neutral,
    Suspicious,
}

/// A resolved client reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Parsed address, if the raw input was valid
    pub address: Option<IpAddr>,
    /// The raw input as received
    pub raw: String,
    /// Trust classification
    pub trust: Trust,
    /// Stable key for counter and violation lookups
    pub key: String,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)
    }
}

/// Resolves raw addresses into identities.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    allow: Vec<IpNet>,
    deny: Vec<IpNet>,
    trust_private_ranges: bool,
    ipv6_prefix_len: u8,
    trusted_scale: f64,
    suspicious_scale: f64,
}

impl IdentityResolver {
    /// Build a resolver, parsing the override lists.
    pub fn new(config: &IdentityConfig) -> Result<Self> {
        Ok(Self {
            allow: parse_networks(&config.allow, "identity.allow")?,
            deny: parse_networks(&config.deny, "identity.deny")?,
            trust_private_ranges: config.trust_private_ranges,
            ipv6_prefix_len: config.ipv6_prefix_len.clamp(1, 128),
            trusted_scale: config.trusted_limit_scale,
            suspicious_scale: config.suspicious_limit_scale,
        })
    }

    /// Resolve a raw address (`ip`, `ip:port` or `[v6]:port`).
    pub fn resolve(&self, raw: &str) -> Identity {
        let Some(addr) = parse_address(raw) else {
            debug!(raw = %raw, "Unparseable client address, classifying as suspicious");
            return Identity {
                address: None,
                raw: raw.to_string(),
                trust: Trust::Suspicious,
                key: UNRESOLVED_KEY.to_string(),
            };
        };

        Identity {
            address: Some(addr),
            raw: raw.to_string(),
            trust: self.classify(addr),
            key: self.key_for(addr),
        }
    }

    /// Multiplier applied to a policy's limits for the given trust class.
    pub fn limit_scale(&self, trust: Trust) -> f64 {
        match trust {
            Trust::Trusted => self.trusted_scale,
            Trust::Neutral => 1.0,
            Trust::Suspicious => self.suspicious_scale,
        }
    }

    fn classify(&self, addr: IpAddr) -> Trust {
        if self.deny.iter().any(|net| net.contains(&addr)) {
            return Trust::Suspicious;
        }
        if self.allow.iter().any(|net| net.contains(&addr)) {
            return Trust::Trusted;
        }
        if self.trust_private_ranges && is_internal(addr) {
            return Trust::Trusted;
        }
        Trust::Neutral
    }

    fn key_for(&self, addr: IpAddr) -> String {
        match addr {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => Ipv6Net::new(v6, self.ipv6_prefix_len)
                .map(|net| net.trunc().to_string())
                .unwrap_or_else(|_| v6.to_string()),
        }
    }
}

/// Parse a bare address or socket address, unwrapping IPv4-mapped IPv6.
fn parse_address(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    let addr = raw
        .parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<SocketAddr>().ok().map(|s| s.ip()))?;

    Some(match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(addr),
        v4 => v4,
    })
}

fn is_internal(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let segment = v6.segments()[0];
            v6.is_loopback()
                // fc00::/7 unique local
                || (segment & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (segment & 0xffc0) == 0xfe80
        }
    }
}

/// Parse override entries as CIDR ranges, accepting single addresses too.
fn parse_networks(entries: &[String], field: &str) -> Result<Vec<IpNet>> {
    entries
        .iter()
        .map(|entry| {
            let entry = entry.trim();
            entry
                .parse::<IpNet>()
                .ok()
                .or_else(|| entry.parse::<IpAddr>().ok().and_then(host_network))
                .ok_or_else(|| {
                    WardenError::ConfigurationInvalid(format!(
                        "{}: '{}' is not an address or CIDR range",
                        field, entry
                    ))
                })
        })
        .collect()
}

fn host_network(addr: IpAddr) -> Option<IpNet> {
    match addr {
        IpAddr::V4(v4) => Ipv4Net::new(v4, 32).ok().map(IpNet::V4),
        IpAddr::V6(v6) => Ipv6Net::new(v6, 128).ok().map(IpNet::V6),
    }
}
