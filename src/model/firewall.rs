//! Restricted-IP peer-specific firewall rules (§3 `peer_firewall_rule`,
//! §4.7 "Restricted-IP firewall synthesis").

use ipnet::IpNet;

/// A port restriction on a [`PeerFirewallRule`]. Empty `allowed_ports`
/// (§4.7: "all-ports") is represented as `PortSpec::All`; `Single`
/// produces a bare `--dport`; `Multi` produces `--match multiport
/// --dports`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortSpec {
    All,
    Single(u16),
    Multi(Vec<u16>),
}

impl PortSpec {
    #[must_use]
    pub fn from_ports(ports: &[u16]) -> PortSpec {
        match ports {
            [] => PortSpec::All,
            [one] => PortSpec::Single(*one),
            many => PortSpec::Multi(many.to_vec()),
        }
    }
}

/// One row of `peer_firewall_rule` (§3): a remote's permission to reach
/// `target_ip_cidr` through a specific subnet router on specific ports.
/// CASCADE-deletes with the owning remote.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerFirewallRule {
    pub remote_guid: String,
    pub subnet_router_guid: String,
    pub target_ip_cidr: IpNet,
    pub allowed_ports: PortSpec,
    pub order: i64,
}
