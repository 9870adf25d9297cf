//! The extramural manager (spec §4.10, component C10): bookkeeping for
//! third-party (commercial-VPN) configs, kept as an independent domain
//! that "never appears in CS/SR/exit-node configs" (§4.10).
//!
//! [`crate::store::Store`]'s `extramural_*` methods are the CRUD layer;
//! this module is the operator-facing surface on top of it — importing a
//! provider's `.conf` text (reusing [`crate::parse`]), switching the
//! active server, and rotating the local key.

use tracing::instrument;

use crate::error::{MeshError, MeshResult};
use crate::keys::{derive_public, generate_keypair, PresharedKey, PublicKey};
use crate::model::extramural::{ExtramuralConfig, ExtramuralServer, Sponsor};
use crate::parse::{self, split_multivalue};
use crate::store::Store;

/// The mesh-independent extramural API (§4.10). Like [`crate::orchestrator::Orchestrator`],
/// holds nothing but a store reference.
pub struct ExtramuralManager<'s> {
    store: &'s Store,
}

impl<'s> ExtramuralManager<'s> {
    #[must_use]
    pub fn new(store: &'s Store) -> ExtramuralManager<'s> {
        ExtramuralManager { store }
    }

    /// Imports a third-party provider's `.conf` text under `sponsor_name`
    /// (§4.10: "import a provider config (parser reused; sections beyond
    /// the first peer become extra `extramural_server` rows)").
    ///
    /// The `[Interface]` section becomes the config's local peer; the
    /// first `[Peer]` section becomes the initial `active` server and
    /// every subsequent `[Peer]` section an inactive candidate.
    #[instrument(skip(self, text))]
    pub fn import_provider_config(
        &self,
        sponsor_name: &str,
        text: &str,
    ) -> MeshResult<(ExtramuralConfig, Vec<ExtramuralServer>)> {
        let (raw, _warnings) = parse::parse(text)?;

        let private_str = raw.interface.private_key.as_deref().ok_or_else(|| {
            MeshError::MalformedConfig("extramural config has no [Interface] PrivateKey".to_string())
        })?;
        let local_private = crate::keys::PrivateKey::try_from(private_str)?;
        let local_public = derive_public(&local_private);

        if raw.peers.is_empty() {
            return Err(MeshError::MalformedConfig(
                "extramural config has no [Peer] sections".to_string(),
            ));
        }

        let local_address = raw
            .interface
            .address
            .iter()
            .map(|a| a.parse().map_err(|_| MeshError::MalformedConfig(format!("bad Address {a}"))))
            .collect::<MeshResult<Vec<_>>>()?;

        let sponsor = self.store.upsert_sponsor(sponsor_name)?;

        let config = ExtramuralConfig {
            id: 0,
            sponsor_id: sponsor.id,
            local_private_key: local_private,
            local_public_key: local_public,
            local_address,
            dns: raw.interface.dns.clone(),
            pending_remote_update: false,
        };
        let config_id = self.store.insert_extramural_config(sponsor.id, &config)?;

        let mut servers = Vec::with_capacity(raw.peers.len());
        for (i, peer) in raw.peers.iter().enumerate() {
            let public_key = peer.public_key.as_deref().ok_or_else(|| {
                MeshError::MalformedConfig("extramural [Peer] has no PublicKey".to_string())
            })?;
            let public_key = PublicKey::try_from(public_key)?;
            let preshared_key = peer
                .preshared_key
                .as_deref()
                .map(PresharedKey::try_from)
                .transpose()?;
            let endpoint = peer.endpoint.clone().ok_or_else(|| {
                MeshError::MalformedConfig("extramural [Peer] has no Endpoint".to_string())
            })?;
            let allowed_ips = peer
                .allowed_ips
                .iter()
                .flat_map(|s| split_multivalue(s))
                .map(|a| a.parse().map_err(|_| MeshError::MalformedConfig(format!("bad AllowedIPs {a}"))))
                .collect::<MeshResult<Vec<_>>>()?;

            let server = ExtramuralServer {
                id: 0,
                config_id,
                label: format!("server-{i}"),
                public_key,
                preshared_key,
                endpoint,
                allowed_ips,
                active: i == 0,
            };
            self.store.insert_extramural_server(config_id, &server)?;
            servers.push(server);
        }

        let config = ExtramuralConfig { id: config_id, ..config };
        Ok((config, servers))
    }

    /// §4.10 "switch active server".
    pub fn switch_active_server(&self, config_id: i64, server_id: i64) -> MeshResult<()> {
        self.store.switch_active_extramural_server(config_id, server_id)
    }

    /// §4.10 "rotate local key (marks `pending_remote_update`)". The
    /// rotated key is not handed to the provider here — that is an
    /// out-of-band operator action the provider's own portal requires;
    /// this only updates local state and flags it as out of sync.
    #[instrument(skip(self))]
    pub fn rotate_local_key(&self, config_id: i64) -> MeshResult<PublicKey> {
        let (new_private, new_public) = generate_keypair();
        self.store
            .rotate_extramural_local_key(config_id, &new_private, &new_public)?;
        Ok(new_public)
    }

    /// §4.10 "clear pending flag on operator confirmation" — the operator
    /// has told the provider about the rotated key out of band.
    pub fn clear_pending(&self, config_id: i64) -> MeshResult<()> {
        self.store.clear_extramural_pending(config_id)
    }

    pub fn list_sponsors(&self) -> MeshResult<Vec<Sponsor>> {
        self.store.list_sponsors()
    }

    pub fn list_configs(&self, sponsor_id: i64) -> MeshResult<Vec<ExtramuralConfig>> {
        self.store.list_extramural_configs(sponsor_id)
    }

    pub fn list_servers(&self, config_id: i64) -> MeshResult<Vec<ExtramuralServer>> {
        self.store.list_extramural_servers(config_id)
    }

    pub fn active_server(&self, config_id: i64) -> MeshResult<Option<ExtramuralServer>> {
        self.store.active_extramural_server(config_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROVIDER_CONF: &str = "\
[Interface]
PrivateKey = iCqBgy3Q8vLMB3vYdj7eOTnd1T2aWgdOgC2c+VzN5VI=
Address = 10.90.0.2/32
DNS = 10.90.0.1

[Peer]
PublicKey = TGliSb9TtiWfGYUB+2C+1O2Wmko0jluUXZxV4Jm1Kic=
Endpoint = sg.example-vpn.net:51820
AllowedIPs = 0.0.0.0/0, ::/0

[Peer]
PublicKey = 3VYB/w/NNkGzD3eTwjEQFkfxaNHPvkw3zz5QsLkyFQw=
Endpoint = us.example-vpn.net:51820
AllowedIPs = 0.0.0.0/0, ::/0
";

    #[test]
    fn import_makes_first_peer_active_and_rest_candidates() {
        let store = Store::open_memory().unwrap();
        let mgr = ExtramuralManager::new(&store);
        let (config, servers) = mgr.import_provider_config("Example VPN", PROVIDER_CONF).unwrap();
        assert_eq!(servers.len(), 2);
        assert!(servers[0].active);
        assert!(!servers[1].active);

        let active = mgr.active_server(config.id).unwrap().unwrap();
        assert_eq!(active.endpoint, "sg.example-vpn.net:51820");
    }

    #[test]
    fn switch_active_server_flips_exactly_one() {
        let store = Store::open_memory().unwrap();
        let mgr = ExtramuralManager::new(&store);
        let (config, servers) = mgr.import_provider_config("Example VPN", PROVIDER_CONF).unwrap();
        mgr.switch_active_server(config.id, servers[1].id).unwrap();
        let active = mgr.active_server(config.id).unwrap().unwrap();
        assert_eq!(active.endpoint, "us.example-vpn.net:51820");
    }

    #[test]
    fn rotate_local_key_marks_pending() {
        let store = Store::open_memory().unwrap();
        let mgr = ExtramuralManager::new(&store);
        let (config, _) = mgr.import_provider_config("Example VPN", PROVIDER_CONF).unwrap();
        let old_public = config.local_public_key.clone();
        let new_public = mgr.rotate_local_key(config.id).unwrap();
        assert_ne!(old_public, new_public);

        let reloaded = &mgr.list_configs(config.sponsor_id).unwrap()[0];
        assert!(reloaded.pending_remote_update);

        mgr.clear_pending(config.id).unwrap();
        let reloaded = &mgr.list_configs(config.sponsor_id).unwrap()[0];
        assert!(!reloaded.pending_remote_update);
    }

    #[test]
    fn rejects_config_with_no_peers() {
        let store = Store::open_memory().unwrap();
        let mgr = ExtramuralManager::new(&store);
        let text = "[Interface]\nPrivateKey = iCqBgy3Q8vLMB3vYdj7eOTnd1T2aWgdOgC2c+VzN5VI=\n";
        assert!(mgr.import_provider_config("Example VPN", text).is_err());
    }
}
