use crate::config::IpAclConfig;
use ipnetwork::IpNetwork;
use std::net::IpAddr;

/// CIDR allow/deny policy compiled from config.
///
/// Whitelist wins over blacklist; once a whitelist is configured the default
/// flips to deny. Bare IPs parse as /32 (v4) or /128 (v6).
#[derive(Debug)]
pub struct IpAclPolicy {
    whitelist: Vec<IpNetwork>,
    blacklist: Vec<IpNetwork>,
}

/// Why a client was rejected; becomes the `X-Blocked-Reason` header.
#[derive(Debug, PartialEq, Eq)]
pub enum AclDecision {
    Allow,
    Deny(&'static str),
}

/// Parse a CIDR entry, treating a bare address as a host network.
pub fn parse_cidr(entry: &str) -> Result<IpNetwork, ipnetwork::IpNetworkError> {
    if entry.contains('/') {
        entry.parse()
    } else {
        let addr: IpAddr = entry
            .parse()
            .map_err(|_| ipnetwork::IpNetworkError::InvalidAddr(entry.to_string()))?;
        Ok(IpNetwork::from(addr))
    }
}

impl IpAclPolicy {
    /// Compile from config. Entries already validated at snapshot load;
    /// anything that still fails to parse is dropped with a log line rather
    /// than taking the policy down.
    pub fn new(cfg: &IpAclConfig) -> Self {
        let compile = |entries: &[String], kind: &str| -> Vec<IpNetwork> {
            entries
                .iter()
                .filter_map(|e| match parse_cidr(e) {
                    Ok(net) => Some(net),
                    Err(err) => {
                        tracing::error!("ip_acl: {kind} entry '{e}' invalid, dropped: {err}");
                        None
                    }
                })
                .collect()
        };
        Self {
            whitelist: compile(&cfg.whitelist, "whitelist"),
            blacklist: compile(&cfg.blacklist, "blacklist"),
        }
    }

    pub fn evaluate(&self, client_ip: IpAddr) -> AclDecision {
        if self.whitelist.iter().any(|net| net.contains(client_ip)) {
            return AclDecision::Allow;
        }
        if !self.whitelist.is_empty() {
            return AclDecision::Deny("not in whitelist");
        }
        if self.blacklist.iter().any(|net| net.contains(client_ip)) {
            return AclDecision::Deny("blacklisted");
        }
        AclDecision::Allow
    }
}

/// Determine the real client IP. Trust order: `X-Forwarded-For` first entry,
/// then `X-Real-IP`, `CF-Connecting-IP`, `X-Client-IP`, and finally the TCP
/// peer address.
pub fn client_ip(headers: &http::HeaderMap, peer: IpAddr) -> IpAddr {
    if let Some(ip) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
    {
        return ip;
    }
    for header in ["x-real-ip", "cf-connecting-ip", "x-client-ip"] {
        if let Some(ip) = headers
            .get(header)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<IpAddr>().ok())
        {
            return ip;
        }
    }
    peer
}
