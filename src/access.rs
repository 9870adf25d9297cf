//! The access-level & firewall engine (spec §4.7, component C7): maps a
//! remote's `access_level` to its `AllowedIPs` against the coordination
//! server, and synthesizes peer-specific iptables rules for `restricted_ip`
//! remotes.

use std::net::Ipv4Addr;

use ipnet::IpNet;

use crate::model::{AccessLevel, CoordinationServer, PeerFirewallRule, PortSpec, Remote, SubnetRouter};

/// §4.7's table. Returns `None` for `exit_only` (no CS peer at all).
/// `selected_networks` is consulted only for `LanOnly`/`Custom`:
/// `custom_allowed_ips` on the remote holds, for `LanOnly`, the operator's
/// chosen subset of `subnet_routers`' advertised networks, and for
/// `Custom`, an arbitrary verbatim list (§3: "optional `custom_allowed_ips`").
/// `restricted_rules` is consulted only for `RestrictedIp`, where the
/// actual targets live in `peer_firewall_rule` rows rather than
/// `custom_allowed_ips` (pass whatever was loaded for this remote; an
/// empty slice yields just the CS networks, matching a remote with no
/// rules attached yet).
#[must_use]
pub fn allowed_ips_for_cs_peer(
    remote: &Remote,
    cs: &CoordinationServer,
    subnet_routers: &[SubnetRouter],
    restricted_rules: &[PeerFirewallRule],
) -> Option<Vec<IpNet>> {
    let cs_networks = cs_networks(cs);

    match remote.access_level {
        AccessLevel::ExitOnly => None,
        AccessLevel::VpnOnly => Some(cs_networks),
        AccessLevel::FullAccess => {
            let mut ips = cs_networks;
            for sr in subnet_routers {
                ips.extend(sr.advertised_networks.iter().copied());
            }
            Some(ips)
        }
        AccessLevel::LanOnly => {
            let mut ips = cs_networks;
            if let Some(selected) = &remote.custom_allowed_ips {
                ips.extend(selected.iter().copied());
            }
            Some(ips)
        }
        AccessLevel::RestrictedIp => Some(allowed_ips_for_restricted(cs, restricted_rules)),
        AccessLevel::Custom => remote.custom_allowed_ips.clone(),
    }
}

/// `restricted_ip` variant of the table above, driven by the remote's
/// actual firewall rules rather than `custom_allowed_ips` (used once the
/// store has loaded `peer_firewall_rule` rows for this remote).
#[must_use]
pub fn allowed_ips_for_restricted(cs: &CoordinationServer, rules: &[PeerFirewallRule]) -> Vec<IpNet> {
    let mut ips = cs_networks(cs);
    ips.extend(rules.iter().map(|r| r.target_ip_cidr));
    ips
}

fn cs_networks(cs: &CoordinationServer) -> Vec<IpNet> {
    let mut nets = vec![IpNet::V4(cs.vpn_network_v4)];
    if let Some(v6) = cs.vpn_network_v6 {
        nets.push(IpNet::V6(v6));
    }
    nets
}

/// The default-route `AllowedIPs` for an assigned exit-node peer (§4.6
/// item 3: "`AllowedIPs = 0.0.0.0/0, ::/0` for egress").
#[must_use]
pub fn default_route_allowed_ips() -> Vec<IpNet> {
    vec!["0.0.0.0/0".parse().unwrap(), "::/0".parse().unwrap()]
}

/// Builds one ACCEPT rule's up/down `iptables` line pair (§4.7).
fn accept_lines(remote_vpn4: Ipv4Addr, target: IpNet, ports: &PortSpec) -> (String, String) {
    let port_clause = match ports {
        PortSpec::All => String::new(),
        PortSpec::Single(p) => format!(" -p tcp --dport {p}"),
        PortSpec::Multi(ps) => {
            let list = ps.iter().map(ToString::to_string).collect::<Vec<_>>().join(",");
            format!(" -p tcp --match multiport --dports {list}")
        }
    };
    let up = format!("iptables -I FORWARD -s {remote_vpn4}/32 -d {target}{port_clause} -j ACCEPT");
    let down = format!("iptables -D FORWARD -s {remote_vpn4}/32 -d {target}{port_clause} -j ACCEPT");
    (up, down)
}

/// §4.7 "Restricted-IP firewall synthesis": for one remote's rules
/// targeting a single subnet router, emits the labeled ACCEPT block
/// followed by the DROP terminator, in order, plus the matching
/// `PostDown` lines.
#[must_use]
pub fn synthesize_restricted_ip_block(
    remote_hostname: &str,
    remote_vpn4: Ipv4Addr,
    rules: &[PeerFirewallRule],
) -> (Vec<String>, Vec<String>) {
    let label = format!("# Peer-specific rule for: {remote_hostname}");
    let mut up = vec![label.clone()];
    let mut down = vec![label];

    for rule in rules {
        let (u, d) = accept_lines(remote_vpn4, rule.target_ip_cidr, &rule.allowed_ports);
        up.push(u);
        down.push(d);
    }

    up.push(format!("iptables -I FORWARD -s {remote_vpn4}/32 -j DROP"));
    down.push(format!("iptables -D FORWARD -s {remote_vpn4}/32 -j DROP"));

    (up, down)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_keypair;
    use crate::model::{Identity, PortSpec, SshCoordinates};

    fn rule(target: &str, ports: PortSpec) -> PeerFirewallRule {
        PeerFirewallRule {
            remote_guid: "r".to_string(),
            subnet_router_guid: "sr".to_string(),
            target_ip_cidr: target.parse().unwrap(),
            allowed_ports: ports,
            order: 0,
        }
    }

    fn cs_fixture() -> CoordinationServer {
        let (private, public) = generate_keypair();
        let now = chrono::Utc::now();
        CoordinationServer {
            identity: Identity {
                permanent_guid: public.clone(),
                current_public_key: public,
                current_private_key: private,
                hostname: "hub".to_string(),
                vpn_ipv4: "10.66.0.1".parse().unwrap(),
                vpn_ipv6: None,
                endpoint: None,
                listen_port: Some(51820),
                created_at: now,
                updated_at: now,
            },
            vpn_network_v4: "10.66.0.0/24".parse().unwrap(),
            vpn_network_v6: None,
            ssh: SshCoordinates {
                host: "vps.example.com".to_string(),
                port: 22,
                user: "root".to_string(),
                remote_config_path: "/etc/wireguard/wg0.conf".to_string(),
            },
        }
    }

    fn remote_fixture(access_level: AccessLevel) -> Remote {
        let (private, public) = generate_keypair();
        let now = chrono::Utc::now();
        Remote {
            identity: Identity {
                permanent_guid: public.clone(),
                current_public_key: public,
                current_private_key: private,
                hostname: "kiosk".to_string(),
                vpn_ipv4: "10.66.0.40".parse().unwrap(),
                vpn_ipv6: None,
                endpoint: None,
                listen_port: None,
                created_at: now,
                updated_at: now,
            },
            access_level,
            custom_allowed_ips: None,
            device_type: None,
            exit_node_id: None,
        }
    }

    /// `restricted_ip` draws its targets from `peer_firewall_rule` rows,
    /// never from `custom_allowed_ips` (which is normally unset for this
    /// access level) — a bare CS-networks-only result here would silently
    /// drop every actual restricted target.
    #[test]
    fn restricted_ip_cs_peer_allowed_ips_comes_from_firewall_rules() {
        let cs = cs_fixture();
        let remote = remote_fixture(AccessLevel::RestrictedIp);
        let rules = vec![rule("192.168.10.50/32", PortSpec::Single(22))];

        let allowed = allowed_ips_for_cs_peer(&remote, &cs, &[], &rules).unwrap();
        assert!(allowed.contains(&IpNet::V4(cs.vpn_network_v4)));
        assert!(allowed.contains(&"192.168.10.50/32".parse().unwrap()));

        let without_rules = allowed_ips_for_cs_peer(&remote, &cs, &[], &[]).unwrap();
        assert_eq!(without_rules, vec![IpNet::V4(cs.vpn_network_v4)]);
    }

    #[test]
    fn restricted_ip_block_orders_accept_before_drop() {
        let rules = vec![rule("192.168.10.50/32", PortSpec::Single(22))];
        let (up, down) = synthesize_restricted_ip_block("kiosk", "10.66.0.40".parse().unwrap(), &rules);
        assert_eq!(
            up,
            vec![
                "# Peer-specific rule for: kiosk".to_string(),
                "iptables -I FORWARD -s 10.66.0.40/32 -d 192.168.10.50/32 -p tcp --dport 22 -j ACCEPT"
                    .to_string(),
                "iptables -I FORWARD -s 10.66.0.40/32 -j DROP".to_string(),
            ]
        );
        assert_eq!(
            down,
            vec![
                "# Peer-specific rule for: kiosk".to_string(),
                "iptables -D FORWARD -s 10.66.0.40/32 -d 192.168.10.50/32 -p tcp --dport 22 -j ACCEPT"
                    .to_string(),
                "iptables -D FORWARD -s 10.66.0.40/32 -j DROP".to_string(),
            ]
        );
    }

    #[test]
    fn all_ports_variant_has_no_dash_p() {
        let rules = vec![rule("192.168.10.0/24", PortSpec::All)];
        let (up, _) = synthesize_restricted_ip_block("kiosk", "10.66.0.40".parse().unwrap(), &rules);
        assert!(up[1].contains("-d 192.168.10.0/24 -j ACCEPT"));
        assert!(!up[1].contains("-p tcp"));
    }
}
