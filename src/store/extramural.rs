//! CRUD for the extramural (third-party VPN) tables (§3, §4.10,
//! component C10). A separate, non-overlapping domain from the mesh
//! entity tables.

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use rusqlite::{params, OptionalExtension};

use crate::error::{MeshError, MeshResult};
use crate::keys::{PresharedKey, PrivateKey, PublicKey};
use crate::model::extramural::{ExtramuralConfig, ExtramuralServer, Sponsor};

use super::Store;

fn bad_col(idx: usize) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, "stored value".to_string(), rusqlite::types::Type::Text)
}

fn join_nets(nets: &[IpNet]) -> String {
    nets.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}

fn split_nets(s: &str) -> rusqlite::Result<Vec<IpNet>> {
    s.split(',')
        .filter(|p| !p.is_empty())
        .map(|p| p.parse::<IpNet>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| bad_col(0))
}

fn row_to_sponsor(row: &rusqlite::Row<'_>) -> rusqlite::Result<Sponsor> {
    let created_at: String = row.get(2)?;
    Ok(Sponsor {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| bad_col(2))?,
    })
}

fn row_to_config(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExtramuralConfig> {
    let private: String = row.get(2)?;
    let public: String = row.get(3)?;
    let address: String = row.get(4)?;
    let dns: String = row.get(5)?;
    Ok(ExtramuralConfig {
        id: row.get(0)?,
        sponsor_id: row.get(1)?,
        local_private_key: PrivateKey::try_from(private.as_str()).map_err(|_| bad_col(2))?,
        local_public_key: PublicKey::try_from(public.as_str()).map_err(|_| bad_col(3))?,
        local_address: split_nets(&address)?,
        dns: dns.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect(),
        pending_remote_update: row.get::<_, i64>(6)? != 0,
    })
}

fn row_to_server(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExtramuralServer> {
    let public: String = row.get(3)?;
    let preshared: Option<String> = row.get(4)?;
    let allowed: String = row.get(6)?;
    Ok(ExtramuralServer {
        id: row.get(0)?,
        config_id: row.get(1)?,
        label: row.get(2)?,
        public_key: PublicKey::try_from(public.as_str()).map_err(|_| bad_col(3))?,
        preshared_key: preshared
            .map(|s| PresharedKey::try_from(s.as_str()))
            .transpose()
            .map_err(|_| bad_col(4))?,
        endpoint: row.get(5)?,
        allowed_ips: split_nets(&allowed)?,
        active: row.get::<_, i64>(7)? != 0,
    })
}

impl Store {
    pub fn upsert_sponsor(&self, name: &str) -> MeshResult<Sponsor> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO extramural_sponsor (name, created_at) VALUES (?1, ?2)
                 ON CONFLICT(name) DO NOTHING",
                params![name, Utc::now().to_rfc3339()],
            )?;
            tx.query_row(
                "SELECT id, name, created_at FROM extramural_sponsor WHERE name = ?1",
                params![name],
                row_to_sponsor,
            )
            .map_err(Into::into)
        })
    }

    pub fn list_sponsors(&self) -> MeshResult<Vec<Sponsor>> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare("SELECT id, name, created_at FROM extramural_sponsor ORDER BY name")?;
            let rows = stmt.query_map([], row_to_sponsor)?.collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn insert_extramural_config(&self, sponsor_id: i64, config: &ExtramuralConfig) -> MeshResult<i64> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO extramural_config
                 (sponsor_id, local_private_key, local_public_key, local_address, dns, pending_remote_update)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    sponsor_id,
                    config.local_private_key.to_string(),
                    config.local_public_key.to_string(),
                    join_nets(&config.local_address),
                    config.dns.join(","),
                    config.pending_remote_update as i64,
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    pub fn list_extramural_configs(&self, sponsor_id: i64) -> MeshResult<Vec<ExtramuralConfig>> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id, sponsor_id, local_private_key, local_public_key, local_address, dns,
                        pending_remote_update
                 FROM extramural_config WHERE sponsor_id = ?1",
            )?;
            let rows = stmt
                .query_map(params![sponsor_id], row_to_config)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Marks the local key rotation pending a provider-side update (§4.10:
    /// "rotate local key (marks `pending_remote_update`)").
    pub fn rotate_extramural_local_key(
        &self,
        config_id: i64,
        new_private: &PrivateKey,
        new_public: &PublicKey,
    ) -> MeshResult<()> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE extramural_config
                 SET local_private_key = ?1, local_public_key = ?2, pending_remote_update = 1
                 WHERE id = ?3",
                params![new_private.to_string(), new_public.to_string(), config_id],
            )?;
            Ok(())
        })
    }

    pub fn clear_extramural_pending(&self, config_id: i64) -> MeshResult<()> {
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE extramural_config SET pending_remote_update = 0 WHERE id = ?1",
                params![config_id],
            )?;
            Ok(())
        })
    }

    pub fn insert_extramural_server(&self, config_id: i64, server: &ExtramuralServer) -> MeshResult<i64> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO extramural_server
                 (config_id, label, public_key, preshared_key, endpoint, allowed_ips, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    config_id,
                    server.label,
                    server.public_key.to_string(),
                    server.preshared_key.as_ref().map(ToString::to_string),
                    server.endpoint,
                    join_nets(&server.allowed_ips),
                    server.active as i64,
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })
    }

    pub fn list_extramural_servers(&self, config_id: i64) -> MeshResult<Vec<ExtramuralServer>> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id, config_id, label, public_key, preshared_key, endpoint, allowed_ips, active
                 FROM extramural_server WHERE config_id = ?1 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![config_id], row_to_server)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn active_extramural_server(&self, config_id: i64) -> MeshResult<Option<ExtramuralServer>> {
        self.with_tx(|tx| {
            tx.query_row(
                "SELECT id, config_id, label, public_key, preshared_key, endpoint, allowed_ips, active
                 FROM extramural_server WHERE config_id = ?1 AND active = 1",
                params![config_id],
                row_to_server,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Switches the active server for a config to `server_id` (§4.10:
    /// "exactly one active server per config"), atomically deactivating
    /// the rest.
    pub fn switch_active_extramural_server(&self, config_id: i64, server_id: i64) -> MeshResult<()> {
        self.with_tx(|tx| {
            let exists: i64 = tx.query_row(
                "SELECT COUNT(*) FROM extramural_server WHERE id = ?1 AND config_id = ?2",
                params![server_id, config_id],
                |r| r.get(0),
            )?;
            if exists == 0 {
                return Err(MeshError::OrphanedReference {
                    referrer: format!("extramural_server #{server_id}"),
                    referent: format!("extramural_config #{config_id}"),
                });
            }
            tx.execute(
                "UPDATE extramural_server SET active = 0 WHERE config_id = ?1",
                params![config_id],
            )?;
            tx.execute(
                "UPDATE extramural_server SET active = 1 WHERE id = ?1",
                params![server_id],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_keypair;

    fn config() -> ExtramuralConfig {
        let (private, public) = generate_keypair();
        ExtramuralConfig {
            id: 0,
            sponsor_id: 0,
            local_private_key: private,
            local_public_key: public,
            local_address: vec!["10.8.0.5/24".parse().unwrap()],
            dns: vec!["1.1.1.1".to_string()],
            pending_remote_update: false,
        }
    }

    #[test]
    fn exactly_one_active_server_after_switch() {
        let store = Store::open_memory().unwrap();
        let sponsor = store.upsert_sponsor("Acme VPN").unwrap();
        let config_id = store.insert_extramural_config(sponsor.id, &config()).unwrap();
        let (_, pub_a) = generate_keypair();
        let (_, pub_b) = generate_keypair();
        let a = ExtramuralServer {
            id: 0,
            config_id,
            label: "a".to_string(),
            public_key: pub_a,
            preshared_key: None,
            endpoint: "a.example:51820".to_string(),
            allowed_ips: vec!["0.0.0.0/0".parse().unwrap()],
            active: true,
        };
        let b = ExtramuralServer {
            active: false,
            label: "b".to_string(),
            public_key: pub_b,
            ..a.clone()
        };
        store.insert_extramural_server(config_id, &a).unwrap();
        let b_id = store.insert_extramural_server(config_id, &b).unwrap();
        store.switch_active_extramural_server(config_id, b_id).unwrap();
        let active = store.active_extramural_server(config_id).unwrap().unwrap();
        assert_eq!(active.label, "b");
    }
}
