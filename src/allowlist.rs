use std::net::IpAddr;

use ipnet::IpNet;

/// Source subnets permitted to wake targets. Empty means everyone.
#[derive(Debug, Clone, Default)]
pub struct SourceAllowlist {
    subnets: Vec<IpNet>,
}

impl SourceAllowlist {
    pub fn new(subnets: impl IntoIterator<Item = IpNet>) -> Self {
        Self { subnets: subnets.into_iter().map(|net| net.trunc()).collect() }
    }

    pub fn is_empty(&self) -> bool {
        self.subnets.is_empty()
    }

    /// Events without a source IP come from the link layer and always pass.
    pub fn allows(&self, source: Option<IpAddr>) -> bool {
        let Some(ip) = source else { return true; };
        if self.subnets.is_empty() { return true; }

        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        self.subnets.iter().any(|net| net.contains(&ip))
    }
}
