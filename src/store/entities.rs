//! CRUD for the four WireGuard-speaking entity kinds (§4.3: "typed
//! operations: upsert per entity kind, fetch by `permanent_guid` or
//! hostname, list by kind").

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use rusqlite::{params, OptionalExtension, Transaction};

use crate::error::{MeshError, MeshResult};
use crate::keys::{PrivateKey, PublicKey};
use crate::model::{
    AccessLevel, CoordinationServer, EndpointAddr, EntityKind, ExitNode, Identity, Remote,
    SshCoordinates, SubnetRouter,
};

use super::Store;

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(s: &str) -> MeshResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MeshError::MalformedConfig(format!("bad timestamp `{s}`: {e}")))
}

fn opt_endpoint(host: Option<String>, port: Option<i64>) -> Option<EndpointAddr> {
    match (host, port) {
        (Some(host), Some(port)) => Some(EndpointAddr {
            host,
            port: port as u16,
        }),
        _ => None,
    }
}

impl Store {
    /// Ensures a `permanent_guid` is unique across *every* entity table
    /// and every key column (§3 identity invariant #4). Call before
    /// inserting a brand-new entity.
    pub(super) fn check_unique_identity(
        tx: &Transaction<'_>,
        guid: &str,
        public_key: &str,
        vpn_ipv4: &str,
        vpn_ipv6: Option<&str>,
        skip_table: &str,
    ) -> MeshResult<()> {
        for table in ["coordination_server", "subnet_router", "remote", "exit_node"] {
            if table == skip_table {
                continue;
            }
            let count: i64 = tx.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {table} WHERE permanent_guid = ?1 OR current_public_key = ?2 OR vpn_ipv4 = ?3{}",
                    if vpn_ipv6.is_some() { " OR vpn_ipv6 = ?4" } else { "" }
                ),
                rusqlite::params_from_iter(
                    std::iter::once(guid.to_string())
                        .chain(std::iter::once(public_key.to_string()))
                        .chain(std::iter::once(vpn_ipv4.to_string()))
                        .chain(vpn_ipv6.map(str::to_string)),
                ),
                |row| row.get(0),
            )?;
            if count > 0 {
                return Err(MeshError::DuplicateIdentity {
                    field: "permanent_guid/current_public_key/vpn address",
                    value: guid.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Runs [`Store::check_unique_identity`] for `id` against every table
    /// except `skip_table` (the one the caller is about to upsert into —
    /// its own `UNIQUE`/`PRIMARY KEY` columns already guard intra-table
    /// collisions, see `schema.rs`).
    fn check_cross_table_identity(tx: &Transaction<'_>, id: &Identity, skip_table: &str) -> MeshResult<()> {
        Self::check_unique_identity(
            tx,
            &id.permanent_guid.to_string(),
            &id.current_public_key.to_string(),
            &id.vpn_ipv4.to_string(),
            id.vpn_ipv6.map(|v| v.to_string()).as_deref(),
            skip_table,
        )
    }

    pub fn upsert_coordination_server(&self, cs: &CoordinationServer) -> MeshResult<()> {
        self.with_tx(|tx| {
            let id = &cs.identity;
            Self::check_cross_table_identity(tx, id, "coordination_server")?;
            tx.execute(
                "INSERT INTO coordination_server
                 (permanent_guid, current_public_key, current_private_key, hostname,
                  vpn_ipv4, vpn_ipv6, endpoint_host, endpoint_port, listen_port,
                  vpn_network_v4, vpn_network_v6, ssh_host, ssh_port, ssh_user, ssh_remote_path,
                  created_at, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)
                 ON CONFLICT(permanent_guid) DO UPDATE SET
                   current_public_key=excluded.current_public_key,
                   current_private_key=excluded.current_private_key,
                   hostname=excluded.hostname,
                   vpn_ipv4=excluded.vpn_ipv4,
                   vpn_ipv6=excluded.vpn_ipv6,
                   endpoint_host=excluded.endpoint_host,
                   endpoint_port=excluded.endpoint_port,
                   listen_port=excluded.listen_port,
                   vpn_network_v4=excluded.vpn_network_v4,
                   vpn_network_v6=excluded.vpn_network_v6,
                   ssh_host=excluded.ssh_host,
                   ssh_port=excluded.ssh_port,
                   ssh_user=excluded.ssh_user,
                   ssh_remote_path=excluded.ssh_remote_path,
                   updated_at=excluded.updated_at",
                params![
                    id.permanent_guid.to_string(),
                    id.current_public_key.to_string(),
                    id.current_private_key.to_string(),
                    id.hostname,
                    id.vpn_ipv4.to_string(),
                    id.vpn_ipv6.map(|a| a.to_string()),
                    id.endpoint.as_ref().map(|e| e.host.clone()),
                    id.endpoint.as_ref().map(|e| i64::from(e.port)),
                    i64::from(id.listen_port.unwrap_or(51820)),
                    cs.vpn_network_v4.to_string(),
                    cs.vpn_network_v6.map(|n| n.to_string()),
                    cs.ssh.host,
                    i64::from(cs.ssh.port),
                    cs.ssh.user,
                    cs.ssh.remote_config_path,
                    ts(id.created_at),
                    ts(id.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn fetch_coordination_server(&self, guid: &str) -> MeshResult<Option<CoordinationServer>> {
        self.with_tx(|tx| {
            tx.query_row(
                "SELECT permanent_guid, current_public_key, current_private_key, hostname,
                        vpn_ipv4, vpn_ipv6, endpoint_host, endpoint_port, listen_port,
                        vpn_network_v4, vpn_network_v6, ssh_host, ssh_port, ssh_user,
                        ssh_remote_path, created_at, updated_at
                 FROM coordination_server WHERE permanent_guid = ?1",
                params![guid],
                row_to_cs,
            )
            .optional()
            .map_err(MeshError::from)
        })
    }

    pub fn upsert_subnet_router(&self, sr: &SubnetRouter, cs_guid: &str) -> MeshResult<()> {
        self.with_tx(|tx| {
            let id = &sr.identity;
            Self::check_cross_table_identity(tx, id, "subnet_router")?;
            let networks = sr
                .advertised_networks
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            tx.execute(
                "INSERT INTO subnet_router
                 (permanent_guid, cs_guid, current_public_key, current_private_key, hostname,
                  vpn_ipv4, vpn_ipv6, endpoint_host, endpoint_port, listen_port,
                  advertised_networks, lan_interface, ssh_host, ssh_port, ssh_user,
                  ssh_remote_path, created_at, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)
                 ON CONFLICT(permanent_guid) DO UPDATE SET
                   current_public_key=excluded.current_public_key,
                   current_private_key=excluded.current_private_key,
                   hostname=excluded.hostname,
                   vpn_ipv4=excluded.vpn_ipv4,
                   vpn_ipv6=excluded.vpn_ipv6,
                   endpoint_host=excluded.endpoint_host,
                   endpoint_port=excluded.endpoint_port,
                   listen_port=excluded.listen_port,
                   advertised_networks=excluded.advertised_networks,
                   lan_interface=excluded.lan_interface,
                   ssh_host=excluded.ssh_host,
                   ssh_port=excluded.ssh_port,
                   ssh_user=excluded.ssh_user,
                   ssh_remote_path=excluded.ssh_remote_path,
                   updated_at=excluded.updated_at",
                params![
                    id.permanent_guid.to_string(),
                    cs_guid,
                    id.current_public_key.to_string(),
                    id.current_private_key.to_string(),
                    id.hostname,
                    id.vpn_ipv4.to_string(),
                    id.vpn_ipv6.map(|a| a.to_string()),
                    id.endpoint.as_ref().map(|e| e.host.clone()),
                    id.endpoint.as_ref().map(|e| i64::from(e.port)),
                    id.listen_port.map(i64::from),
                    networks,
                    sr.lan_interface,
                    sr.ssh.host,
                    i64::from(sr.ssh.port),
                    sr.ssh.user,
                    sr.ssh.remote_config_path,
                    ts(id.created_at),
                    ts(id.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn fetch_subnet_router(&self, guid: &str) -> MeshResult<Option<SubnetRouter>> {
        self.with_tx(|tx| {
            tx.query_row(
                "SELECT permanent_guid, current_public_key, current_private_key, hostname,
                        vpn_ipv4, vpn_ipv6, endpoint_host, endpoint_port, listen_port,
                        advertised_networks, lan_interface, ssh_host, ssh_port, ssh_user,
                        ssh_remote_path, created_at, updated_at
                 FROM subnet_router WHERE permanent_guid = ?1",
                params![guid],
                row_to_sr,
            )
            .optional()
            .map_err(MeshError::from)
        })
    }

    pub fn list_subnet_routers(&self, cs_guid: &str) -> MeshResult<Vec<SubnetRouter>> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT permanent_guid, current_public_key, current_private_key, hostname,
                        vpn_ipv4, vpn_ipv6, endpoint_host, endpoint_port, listen_port,
                        advertised_networks, lan_interface, ssh_host, ssh_port, ssh_user,
                        ssh_remote_path, created_at, updated_at
                 FROM subnet_router WHERE cs_guid = ?1 ORDER BY created_at",
            )?;
            let rows = stmt
                .query_map(params![cs_guid], row_to_sr)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn upsert_remote(&self, remote: &Remote, cs_guid: &str) -> MeshResult<()> {
        self.with_tx(|tx| {
            let id = &remote.identity;
            Self::check_cross_table_identity(tx, id, "remote")?;
            let custom_ips = remote.custom_allowed_ips.as_ref().map(|ips| {
                ips.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
            });
            tx.execute(
                "INSERT INTO remote
                 (permanent_guid, cs_guid, current_public_key, current_private_key, hostname,
                  vpn_ipv4, vpn_ipv6, endpoint_host, endpoint_port, listen_port,
                  access_level, custom_allowed_ips, device_type, exit_node_guid,
                  created_at, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)
                 ON CONFLICT(permanent_guid) DO UPDATE SET
                   current_public_key=excluded.current_public_key,
                   current_private_key=excluded.current_private_key,
                   hostname=excluded.hostname,
                   vpn_ipv4=excluded.vpn_ipv4,
                   vpn_ipv6=excluded.vpn_ipv6,
                   endpoint_host=excluded.endpoint_host,
                   endpoint_port=excluded.endpoint_port,
                   listen_port=excluded.listen_port,
                   access_level=excluded.access_level,
                   custom_allowed_ips=excluded.custom_allowed_ips,
                   device_type=excluded.device_type,
                   exit_node_guid=excluded.exit_node_guid,
                   updated_at=excluded.updated_at",
                params![
                    id.permanent_guid.to_string(),
                    cs_guid,
                    id.current_public_key.to_string(),
                    id.current_private_key.to_string(),
                    id.hostname,
                    id.vpn_ipv4.to_string(),
                    id.vpn_ipv6.map(|a| a.to_string()),
                    id.endpoint.as_ref().map(|e| e.host.clone()),
                    id.endpoint.as_ref().map(|e| i64::from(e.port)),
                    id.listen_port.map(i64::from),
                    remote.access_level.as_str(),
                    custom_ips,
                    remote.device_type,
                    remote.exit_node_id.as_ref().map(ToString::to_string),
                    ts(id.created_at),
                    ts(id.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn fetch_remote(&self, guid: &str) -> MeshResult<Option<Remote>> {
        self.with_tx(|tx| {
            tx.query_row(
                "SELECT permanent_guid, current_public_key, current_private_key, hostname,
                        vpn_ipv4, vpn_ipv6, endpoint_host, endpoint_port, listen_port,
                        access_level, custom_allowed_ips, device_type, exit_node_guid,
                        created_at, updated_at
                 FROM remote WHERE permanent_guid = ?1",
                params![guid],
                row_to_remote,
            )
            .optional()
            .map_err(MeshError::from)
        })
    }

    pub fn fetch_remote_by_hostname(&self, cs_guid: &str, hostname: &str) -> MeshResult<Option<Remote>> {
        self.with_tx(|tx| {
            tx.query_row(
                "SELECT permanent_guid, current_public_key, current_private_key, hostname,
                        vpn_ipv4, vpn_ipv6, endpoint_host, endpoint_port, listen_port,
                        access_level, custom_allowed_ips, device_type, exit_node_guid,
                        created_at, updated_at
                 FROM remote WHERE cs_guid = ?1 AND hostname = ?2",
                params![cs_guid, hostname],
                row_to_remote,
            )
            .optional()
            .map_err(MeshError::from)
        })
    }

    pub fn list_remotes(&self, cs_guid: &str) -> MeshResult<Vec<Remote>> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT permanent_guid, current_public_key, current_private_key, hostname,
                        vpn_ipv4, vpn_ipv6, endpoint_host, endpoint_port, listen_port,
                        access_level, custom_allowed_ips, device_type, exit_node_guid,
                        created_at, updated_at
                 FROM remote WHERE cs_guid = ?1 ORDER BY created_at",
            )?;
            let rows = stmt
                .query_map(params![cs_guid], row_to_remote)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn list_remotes_assigned_to_exit(&self, exit_guid: &str) -> MeshResult<Vec<Remote>> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT permanent_guid, current_public_key, current_private_key, hostname,
                        vpn_ipv4, vpn_ipv6, endpoint_host, endpoint_port, listen_port,
                        access_level, custom_allowed_ips, device_type, exit_node_guid,
                        created_at, updated_at
                 FROM remote WHERE exit_node_guid = ?1",
            )?;
            let rows = stmt
                .query_map(params![exit_guid], row_to_remote)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn upsert_exit_node(&self, exit: &ExitNode, cs_guid: &str) -> MeshResult<()> {
        self.with_tx(|tx| {
            let id = &exit.identity;
            Self::check_cross_table_identity(tx, id, "exit_node")?;
            tx.execute(
                "INSERT INTO exit_node
                 (permanent_guid, cs_guid, current_public_key, current_private_key, hostname,
                  vpn_ipv4, vpn_ipv6, endpoint_host, endpoint_port, listen_port,
                  wan_interface, ssh_host, ssh_port, ssh_user, ssh_remote_path,
                  assigned_remote_count, created_at, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)
                 ON CONFLICT(permanent_guid) DO UPDATE SET
                   current_public_key=excluded.current_public_key,
                   current_private_key=excluded.current_private_key,
                   hostname=excluded.hostname,
                   vpn_ipv4=excluded.vpn_ipv4,
                   vpn_ipv6=excluded.vpn_ipv6,
                   endpoint_host=excluded.endpoint_host,
                   endpoint_port=excluded.endpoint_port,
                   listen_port=excluded.listen_port,
                   wan_interface=excluded.wan_interface,
                   ssh_host=excluded.ssh_host,
                   ssh_port=excluded.ssh_port,
                   ssh_user=excluded.ssh_user,
                   ssh_remote_path=excluded.ssh_remote_path,
                   assigned_remote_count=excluded.assigned_remote_count,
                   updated_at=excluded.updated_at",
                params![
                    id.permanent_guid.to_string(),
                    cs_guid,
                    id.current_public_key.to_string(),
                    id.current_private_key.to_string(),
                    id.hostname,
                    id.vpn_ipv4.to_string(),
                    id.vpn_ipv6.map(|a| a.to_string()),
                    id.endpoint.as_ref().map(|e| e.host.clone()),
                    id.endpoint.as_ref().map(|e| i64::from(e.port)),
                    i64::from(id.listen_port.unwrap_or(51820)),
                    exit.wan_interface,
                    exit.ssh.host,
                    i64::from(exit.ssh.port),
                    exit.ssh.user,
                    exit.ssh.remote_config_path,
                    i64::from(exit.assigned_remote_count),
                    ts(id.created_at),
                    ts(id.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn fetch_exit_node(&self, guid: &str) -> MeshResult<Option<ExitNode>> {
        self.with_tx(|tx| {
            tx.query_row(
                "SELECT permanent_guid, current_public_key, current_private_key, hostname,
                        vpn_ipv4, vpn_ipv6, endpoint_host, endpoint_port, listen_port,
                        wan_interface, ssh_host, ssh_port, ssh_user, ssh_remote_path,
                        assigned_remote_count, created_at, updated_at
                 FROM exit_node WHERE permanent_guid = ?1",
                params![guid],
                row_to_exit,
            )
            .optional()
            .map_err(MeshError::from)
        })
    }

    pub fn list_exit_nodes(&self, cs_guid: &str) -> MeshResult<Vec<ExitNode>> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT permanent_guid, current_public_key, current_private_key, hostname,
                        vpn_ipv4, vpn_ipv6, endpoint_host, endpoint_port, listen_port,
                        wan_interface, ssh_host, ssh_port, ssh_user, ssh_remote_path,
                        assigned_remote_count, created_at, updated_at
                 FROM exit_node WHERE cs_guid = ?1 ORDER BY created_at",
            )?;
            let rows = stmt
                .query_map(params![cs_guid], row_to_exit)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// All VPN IPv4 addresses in use under a coordination server, across
    /// every kind — used by the allocator (C2's `next_free`) to compute
    /// the used-set (§3 identity invariant #4).
    pub fn used_vpn_ipv4(&self, cs_guid: &str) -> MeshResult<BTreeSet<IpAddr>> {
        self.with_tx(|tx| {
            let mut used = BTreeSet::new();
            let cs_ip: String = tx.query_row(
                "SELECT vpn_ipv4 FROM coordination_server WHERE permanent_guid = ?1",
                params![cs_guid],
                |r| r.get(0),
            )?;
            used.insert(cs_ip.parse().map_err(|_| {
                MeshError::MalformedConfig("stored vpn_ipv4 is not a valid address".to_string())
            })?);
            for table in ["subnet_router", "remote", "exit_node"] {
                let mut stmt = tx.prepare(&format!(
                    "SELECT vpn_ipv4 FROM {table} WHERE cs_guid = ?1"
                ))?;
                let rows = stmt.query_map(params![cs_guid], |r| r.get::<_, String>(0))?;
                for row in rows {
                    let ip: IpAddr = row?
                        .parse()
                        .map_err(|_| MeshError::MalformedConfig("stored vpn_ipv4 invalid".into()))?;
                    used.insert(ip);
                }
            }
            Ok(used)
        })
    }

    /// Deletes an entity's own row, CASCADE-cleaning owned firewall rules
    /// (SQLite FK) plus comments and peer-order entries we own explicitly
    /// (§3 Lifecycle).
    pub fn delete_entity(&self, guid: &str, kind: EntityKind) -> MeshResult<()> {
        self.with_tx(|tx| {
            let table = match kind {
                EntityKind::CoordinationServer => "coordination_server",
                EntityKind::SubnetRouter => "subnet_router",
                EntityKind::Remote => "remote",
                EntityKind::ExitNode => "exit_node",
                _ => {
                    return Err(MeshError::MalformedConfig(
                        "delete_entity only supports mesh-speaking kinds".to_string(),
                    ))
                }
            };
            tx.execute(&format!("DELETE FROM {table} WHERE permanent_guid = ?1"), params![guid])?;
            tx.execute("DELETE FROM comment WHERE entity_guid = ?1", params![guid])?;
            tx.execute("DELETE FROM cs_peer_order WHERE entity_guid = ?1", params![guid])?;
            Ok(())
        })
    }

    /// Reassigns every remote pointed at a removed exit node back to
    /// `full_access` (§8 boundary behavior; policy pinned in `DESIGN.md`).
    pub fn clear_exit_assignment_reverting_to_full_access(&self, exit_guid: &str) -> MeshResult<usize> {
        self.with_tx(|tx| {
            let n = tx.execute(
                "UPDATE remote SET exit_node_guid = NULL, access_level = 'full_access' WHERE exit_node_guid = ?1",
                params![exit_guid],
            )?;
            Ok(n)
        })
    }

    pub fn cs_peer_order_get(&self, cs_guid: &str) -> MeshResult<Vec<(String, EntityKind)>> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT entity_guid, entity_kind FROM cs_peer_order WHERE cs_guid = ?1 ORDER BY display_order",
            )?;
            let rows = stmt
                .query_map(params![cs_guid], |r| {
                    let kind: String = r.get(1)?;
                    Ok((r.get::<_, String>(0)?, kind))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .map(|(guid, kind)| {
                    EntityKind::from_str(&kind)
                        .map(|k| (guid, k))
                        .ok_or_else(|| MeshError::MalformedConfig(format!("unknown entity_kind `{kind}`")))
                })
                .collect()
        })
    }

    pub fn cs_peer_order_append(&self, cs_guid: &str, entity_guid: &str, kind: EntityKind) -> MeshResult<()> {
        self.with_tx(|tx| {
            let next: i64 = tx.query_row(
                "SELECT COALESCE(MAX(display_order), -1) + 1 FROM cs_peer_order WHERE cs_guid = ?1",
                params![cs_guid],
                |r| r.get(0),
            )?;
            tx.execute(
                "INSERT OR IGNORE INTO cs_peer_order (cs_guid, entity_guid, entity_kind, display_order)
                 VALUES (?1, ?2, ?3, ?4)",
                params![cs_guid, entity_guid, kind.as_str(), next],
            )?;
            Ok(())
        })
    }

    /// The coordination server a subnet router/remote/exit node belongs
    /// to, looked up by its own `permanent_guid`. Used by the orchestrator
    /// (C8) to re-derive `cs_guid` for operations that only take the
    /// entity's own guid.
    pub fn remote_cs_guid(&self, remote_guid: &str) -> MeshResult<Option<String>> {
        self.with_tx(|tx| {
            tx.query_row(
                "SELECT cs_guid FROM remote WHERE permanent_guid = ?1",
                params![remote_guid],
                |r| r.get(0),
            )
            .optional()
            .map_err(MeshError::from)
        })
    }

    pub fn subnet_router_cs_guid(&self, sr_guid: &str) -> MeshResult<Option<String>> {
        self.with_tx(|tx| {
            tx.query_row(
                "SELECT cs_guid FROM subnet_router WHERE permanent_guid = ?1",
                params![sr_guid],
                |r| r.get(0),
            )
            .optional()
            .map_err(MeshError::from)
        })
    }

    pub fn exit_node_cs_guid(&self, exit_guid: &str) -> MeshResult<Option<String>> {
        self.with_tx(|tx| {
            tx.query_row(
                "SELECT cs_guid FROM exit_node WHERE permanent_guid = ?1",
                params![exit_guid],
                |r| r.get(0),
            )
            .optional()
            .map_err(MeshError::from)
        })
    }
}

fn row_to_cs(row: &rusqlite::Row<'_>) -> rusqlite::Result<CoordinationServer> {
    let identity = Identity {
        permanent_guid: pubkey(row, 0)?,
        current_public_key: pubkey(row, 1)?,
        current_private_key: privkey(row, 2)?,
        hostname: row.get(3)?,
        vpn_ipv4: ipv4(row, 4)?,
        vpn_ipv6: opt_ipv6(row, 5)?,
        endpoint: opt_endpoint(row.get(6)?, row.get(7)?),
        listen_port: row.get::<_, Option<i64>>(8)?.map(|p| p as u16),
        created_at: timestamp(row, 15)?,
        updated_at: timestamp(row, 16)?,
    };
    let vpn_network_v4: String = row.get(9)?;
    let vpn_network_v6: Option<String> = row.get(10)?;
    Ok(CoordinationServer {
        identity,
        vpn_network_v4: vpn_network_v4
            .parse::<Ipv4Net>()
            .map_err(|_| bad_col(9))?,
        vpn_network_v6: vpn_network_v6
            .map(|s| s.parse::<Ipv6Net>())
            .transpose()
            .map_err(|_| bad_col(10))?,
        ssh: crate::model::SshCoordinates {
            host: row.get(11)?,
            port: row.get::<_, i64>(12)? as u16,
            user: row.get(13)?,
            remote_config_path: row.get(14)?,
        },
    })
}

fn row_to_sr(row: &rusqlite::Row<'_>) -> rusqlite::Result<SubnetRouter> {
    let identity = Identity {
        permanent_guid: pubkey(row, 0)?,
        current_public_key: pubkey(row, 1)?,
        current_private_key: privkey(row, 2)?,
        hostname: row.get(3)?,
        vpn_ipv4: ipv4(row, 4)?,
        vpn_ipv6: opt_ipv6(row, 5)?,
        endpoint: opt_endpoint(row.get(6)?, row.get(7)?),
        listen_port: row.get::<_, Option<i64>>(8)?.map(|p| p as u16),
        created_at: timestamp(row, 15)?,
        updated_at: timestamp(row, 16)?,
    };
    let networks: String = row.get(9)?;
    let advertised_networks = networks
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<IpNet>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| bad_col(9))?;
    Ok(SubnetRouter {
        identity,
        advertised_networks,
        lan_interface: row.get(10)?,
        ssh: SshCoordinates {
            host: row.get(11)?,
            port: row.get::<_, i64>(12)? as u16,
            user: row.get(13)?,
            remote_config_path: row.get(14)?,
        },
    })
}

fn row_to_remote(row: &rusqlite::Row<'_>) -> rusqlite::Result<Remote> {
    let identity = Identity {
        permanent_guid: pubkey(row, 0)?,
        current_public_key: pubkey(row, 1)?,
        current_private_key: privkey(row, 2)?,
        hostname: row.get(3)?,
        vpn_ipv4: ipv4(row, 4)?,
        vpn_ipv6: opt_ipv6(row, 5)?,
        endpoint: opt_endpoint(row.get(6)?, row.get(7)?),
        listen_port: row.get::<_, Option<i64>>(8)?.map(|p| p as u16),
        created_at: timestamp(row, 13)?,
        updated_at: timestamp(row, 14)?,
    };
    let access_level: String = row.get(9)?;
    let custom_allowed_ips: Option<String> = row.get(10)?;
    let exit_node_guid: Option<String> = row.get(12)?;
    Ok(Remote {
        identity,
        access_level: AccessLevel::parse(&access_level).map_err(|_| bad_col(9))?,
        custom_allowed_ips: custom_allowed_ips
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.split(',')
                    .map(|p| p.parse::<IpNet>())
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()
            .map_err(|_| bad_col(10))?,
        device_type: row.get(11)?,
        exit_node_id: exit_node_guid
            .map(|s| PublicKey::try_from(s.as_str()))
            .transpose()
            .map_err(|_| bad_col(12))?,
    })
}

fn row_to_exit(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExitNode> {
    let identity = Identity {
        permanent_guid: pubkey(row, 0)?,
        current_public_key: pubkey(row, 1)?,
        current_private_key: privkey(row, 2)?,
        hostname: row.get(3)?,
        vpn_ipv4: ipv4(row, 4)?,
        vpn_ipv6: opt_ipv6(row, 5)?,
        endpoint: opt_endpoint(row.get(6)?, row.get(7)?),
        listen_port: row.get::<_, Option<i64>>(8)?.map(|p| p as u16),
        created_at: timestamp(row, 14)?,
        updated_at: timestamp(row, 15)?,
    };
    Ok(ExitNode {
        identity,
        wan_interface: row.get(9)?,
        ssh: SshCoordinates {
            host: row.get(10)?,
            port: row.get::<_, i64>(11)? as u16,
            user: row.get(12)?,
            remote_config_path: row.get(13)?,
        },
        assigned_remote_count: row.get::<_, i64>(16)? as u32,
    })
}

fn bad_col(idx: usize) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, "stored value".to_string(), rusqlite::types::Type::Text)
}

fn pubkey(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<PublicKey> {
    let s: String = row.get(idx)?;
    PublicKey::try_from(s.as_str()).map_err(|_| bad_col(idx))
}

fn privkey(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<PrivateKey> {
    let s: String = row.get(idx)?;
    PrivateKey::try_from(s.as_str()).map_err(|_| bad_col(idx))
}

fn ipv4(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Ipv4Addr> {
    let s: String = row.get(idx)?;
    s.parse().map_err(|_| bad_col(idx))
}

fn opt_ipv6(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<Ipv6Addr>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| s.parse()).transpose().map_err(|_| bad_col(idx))
}

fn timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_ts(&s).map_err(|_| bad_col(idx))
}
