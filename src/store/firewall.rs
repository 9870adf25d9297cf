//! CRUD for `peer_firewall_rule` (§3, §4.7 restricted-IP synthesis input).

use ipnet::IpNet;
use rusqlite::params;

use crate::error::MeshResult;
use crate::model::{PeerFirewallRule, PortSpec};

use super::Store;

fn encode_ports(ports: &PortSpec) -> String {
    match ports {
        PortSpec::All => String::new(),
        PortSpec::Single(p) => p.to_string(),
        PortSpec::Multi(ps) => ps.iter().map(ToString::to_string).collect::<Vec<_>>().join(","),
    }
}

fn decode_ports(s: &str) -> rusqlite::Result<PortSpec> {
    if s.is_empty() {
        return Ok(PortSpec::All);
    }
    let ports = s
        .split(',')
        .map(str::parse::<u16>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| bad_col(3))?;
    Ok(PortSpec::from_ports(&ports))
}

fn bad_col(idx: usize) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, "stored value".to_string(), rusqlite::types::Type::Text)
}

fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<PeerFirewallRule> {
    let cidr: String = row.get(2)?;
    let ports: String = row.get(3)?;
    Ok(PeerFirewallRule {
        remote_guid: row.get(0)?,
        subnet_router_guid: row.get(1)?,
        target_ip_cidr: cidr.parse::<IpNet>().map_err(|_| bad_col(2))?,
        allowed_ports: decode_ports(&ports)?,
        order: row.get(4)?,
    })
}

impl Store {
    pub fn list_firewall_rules(&self, remote_guid: &str) -> MeshResult<Vec<PeerFirewallRule>> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT remote_guid, subnet_router_guid, target_ip_cidr, allowed_ports, rule_order
                 FROM peer_firewall_rule WHERE remote_guid = ?1 ORDER BY rule_order",
            )?;
            let rows = stmt
                .query_map(params![remote_guid], row_to_rule)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn list_firewall_rules_for_subnet_router(&self, sr_guid: &str) -> MeshResult<Vec<PeerFirewallRule>> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT remote_guid, subnet_router_guid, target_ip_cidr, allowed_ports, rule_order
                 FROM peer_firewall_rule WHERE subnet_router_guid = ?1 ORDER BY remote_guid, rule_order",
            )?;
            let rows = stmt
                .query_map(params![sr_guid], row_to_rule)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Replaces every rule for one remote (§4.7: the rule set for a
    /// `restricted_ip` remote is edited as a unit).
    pub fn replace_firewall_rules(&self, remote_guid: &str, rules: &[PeerFirewallRule]) -> MeshResult<()> {
        self.with_tx(|tx| {
            tx.execute(
                "DELETE FROM peer_firewall_rule WHERE remote_guid = ?1",
                params![remote_guid],
            )?;
            for rule in rules {
                tx.execute(
                    "INSERT INTO peer_firewall_rule
                     (remote_guid, subnet_router_guid, target_ip_cidr, allowed_ports, rule_order)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        rule.remote_guid,
                        rule.subnet_router_guid,
                        rule.target_ip_cidr.to_string(),
                        encode_ports(&rule.allowed_ports),
                        rule.order,
                    ],
                )?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_then_list_round_trips_ports() {
        let store = Store::open_memory().unwrap();
        store
            .with_tx(|tx| {
                tx.execute_batch(
                    "INSERT INTO coordination_server
                        (permanent_guid, current_public_key, current_private_key, hostname,
                         vpn_ipv4, listen_port, vpn_network_v4, ssh_host, ssh_port, ssh_user,
                         ssh_remote_path, created_at, updated_at)
                     VALUES ('cs1','cspub','cspriv','cs','10.66.0.1',51820,'10.66.0.0/24',
                             'cs.example','22','root','/etc/wireguard/wg0.conf','now','now');
                     INSERT INTO subnet_router
                        (permanent_guid, cs_guid, current_public_key, current_private_key, hostname,
                         vpn_ipv4, advertised_networks, lan_interface, ssh_host, ssh_port, ssh_user,
                         ssh_remote_path, created_at, updated_at)
                     VALUES ('sr1','cs1','srpub','srpriv','sr','10.66.0.2','192.168.1.0/24','eth1',
                             'sr.example','22','root','/etc/wireguard/wg0.conf','now','now');
                     INSERT INTO remote
                        (permanent_guid, cs_guid, current_public_key, current_private_key, hostname,
                         vpn_ipv4, access_level, created_at, updated_at)
                     VALUES ('r1','cs1','rpub','rpriv','r','10.66.0.30','restricted_ip','now','now');",
                )
                .unwrap();
                Ok(())
            })
            .unwrap();
        let rule = PeerFirewallRule {
            remote_guid: "r1".to_string(),
            subnet_router_guid: "sr1".to_string(),
            target_ip_cidr: "192.168.1.10/32".parse().unwrap(),
            allowed_ports: PortSpec::Multi(vec![80, 443]),
            order: 0,
        };
        store.replace_firewall_rules("r1", &[rule.clone()]).unwrap();
        let listed = store.list_firewall_rules("r1").unwrap();
        assert_eq!(listed, vec![rule]);
    }
}
