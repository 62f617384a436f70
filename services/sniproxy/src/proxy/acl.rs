//! Per-route client access control.
//!
//! Each route carries an allow list and a deny list of subnets. The most
//! specific subnet containing the client decides, and a deny rule wins over
//! an allow rule of the same prefix length.

use std::net::IpAddr;

use ipnet::IpNet;

/// Allow/deny subnet lists for a route.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessList {
    allow: Vec<IpNet>,
    deny: Vec<IpNet>,
}

impl AccessList {
    pub fn new(allow: Vec<IpNet>, deny: Vec<IpNet>) -> Self {
        Self { allow, deny }
    }

    /// Filtering is disabled when both lists are empty.
    pub fn is_enabled(&self) -> bool {
        !self.allow.is_empty() || !self.deny.is_empty()
    }

    /// Check whether a client address may use the route.
    ///
    /// The longest allow prefix containing the address is the baseline (0
    /// when no allow rule matches). Any deny subnet containing the address
    /// with a prefix at least that long rejects it.
    pub fn allows(&self, ip: IpAddr) -> bool {
        if !self.is_enabled() {
            return true;
        }

        // Dual-stack sockets report IPv4 clients as ::ffff:a.b.c.d.
        let ip = ip.to_canonical();

        let best_allow = self
            .allow
            .iter()
            .filter(|net| net.contains(&ip))
            .map(IpNet::prefix_len)
            .max()
            .unwrap_or(0);

        !self
            .deny
            .iter()
            .any(|net| net.contains(&ip) && net.prefix_len() >= best_allow)
    }
}
