//! The orchestrator (spec §4.8, component C8): the mesh's mutating API.
//! Every operation here is atomic over the store (each wraps exactly one
//! [`crate::store::Store::with_tx`]-backed call, or a short sequence of
//! them guarded by application-level checks) and returns a
//! [`RegenerationPlan`] naming the `.conf` files that are now stale.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::Utc;
use ipnet::{IpNet, Ipv4Net};
use tracing::instrument;

use crate::error::{MeshError, MeshResult};
use crate::keys::{derive_public, generate_keypair, PrivateKey, PublicKey};
use crate::model::{
    AccessLevel, CommandPair, CommandScope, CommandSingleton, CoordinationServer, EndpointAddr,
    EntityKind, ExitNode, Identity, KeyRotationRecord, Remote, SshCoordinates, SubnetRouter,
};
use crate::net::{next_free, parse_cidr, v4_offset_range};
use crate::parse::{self, reattach_comments, ConfigType, RawConfig, RawPeer};
use crate::patterns::{
    emit_bidirectional_pair, emit_down, emit_up, pattern, recognize_line, recognize_or_warn,
    PatternName, PatternScope,
};
use crate::store::Store;

/// The canonical, pattern-library-seeded `PostUp`/`PostDown` set a freshly
/// added subnet router gets (§4.8 `add_subnet_router`): forwarding enabled,
/// outbound LAN traffic masqueraded over `lan_interface`, FORWARD opened
/// both ways between the tunnel and the LAN, MSS clamped. An operator can
/// still append custom fragments afterward; those live alongside these rows
/// in `command_pair`/`command_singleton` and are merged at generation time.
fn subnet_router_command_pairs(cs: &CoordinationServer, lan_interface: &str) -> Vec<CommandPair> {
    let empty = BTreeMap::new();
    let mut order = 0;
    let mut next_order = || {
        let o = order;
        order += 1;
        o
    };
    let mut pairs = vec![CommandPair {
        entity_guid: String::new(),
        entity_kind: EntityKind::SubnetRouter,
        pattern_name: Some(PatternName::EnableIpv4Forwarding),
        up_commands: vec![emit_up(PatternName::EnableIpv4Forwarding, &empty)],
        down_commands: vec![emit_down(PatternName::EnableIpv4Forwarding, &empty)],
        variables: empty.clone(),
        scope: CommandScope::Global,
        execution_order: next_order(),
    }];

    let mut nat4 = BTreeMap::new();
    nat4.insert("cidr4".to_string(), cs.vpn_network_v4.to_string());
    nat4.insert("wan".to_string(), lan_interface.to_string());
    pairs.push(CommandPair {
        entity_guid: String::new(),
        entity_kind: EntityKind::SubnetRouter,
        pattern_name: Some(PatternName::NatMasqueradeIpv4),
        up_commands: vec![emit_up(PatternName::NatMasqueradeIpv4, &nat4)],
        down_commands: vec![emit_down(PatternName::NatMasqueradeIpv4, &nat4)],
        variables: nat4,
        scope: CommandScope::Interface,
        execution_order: next_order(),
    });

    if let Some(v6_net) = cs.vpn_network_v6 {
        pairs.push(CommandPair {
            entity_guid: String::new(),
            entity_kind: EntityKind::SubnetRouter,
            pattern_name: Some(PatternName::EnableIpv6Forwarding),
            up_commands: vec![emit_up(PatternName::EnableIpv6Forwarding, &empty)],
            down_commands: vec![emit_down(PatternName::EnableIpv6Forwarding, &empty)],
            variables: empty.clone(),
            scope: CommandScope::Global,
            execution_order: next_order(),
        });
        let mut nat6 = BTreeMap::new();
        nat6.insert("cidr6".to_string(), v6_net.to_string());
        nat6.insert("wan".to_string(), lan_interface.to_string());
        pairs.push(CommandPair {
            entity_guid: String::new(),
            entity_kind: EntityKind::SubnetRouter,
            pattern_name: Some(PatternName::NatMasqueradeIpv6),
            up_commands: vec![emit_up(PatternName::NatMasqueradeIpv6, &nat6)],
            down_commands: vec![emit_down(PatternName::NatMasqueradeIpv6, &nat6)],
            variables: nat6,
            scope: CommandScope::Interface,
            execution_order: next_order(),
        });
    }

    let (bidi_up, bidi_down) = emit_bidirectional_pair(PatternName::BidirectionalForwardIpv4, "wg0", lan_interface);
    let mut bidi_vars = BTreeMap::new();
    bidi_vars.insert("iface".to_string(), "wg0".to_string());
    bidi_vars.insert("wan".to_string(), lan_interface.to_string());
    pairs.push(CommandPair {
        entity_guid: String::new(),
        entity_kind: EntityKind::SubnetRouter,
        pattern_name: Some(PatternName::BidirectionalForwardIpv4),
        up_commands: bidi_up,
        down_commands: bidi_down,
        variables: bidi_vars.clone(),
        scope: CommandScope::Interface,
        execution_order: next_order(),
    });

    if cs.vpn_network_v6.is_some() {
        let (bidi6_up, bidi6_down) =
            emit_bidirectional_pair(PatternName::BidirectionalForwardIpv6, "wg0", lan_interface);
        pairs.push(CommandPair {
            entity_guid: String::new(),
            entity_kind: EntityKind::SubnetRouter,
            pattern_name: Some(PatternName::BidirectionalForwardIpv6),
            up_commands: bidi6_up,
            down_commands: bidi6_down,
            variables: bidi_vars,
            scope: CommandScope::Interface,
            execution_order: next_order(),
        });
    }

    pairs.push(CommandPair {
        entity_guid: String::new(),
        entity_kind: EntityKind::SubnetRouter,
        pattern_name: Some(PatternName::MssClamping),
        up_commands: vec![emit_up(PatternName::MssClamping, &empty)],
        down_commands: vec![emit_down(PatternName::MssClamping, &empty)],
        variables: empty,
        scope: CommandScope::Interface,
        execution_order: next_order(),
    });

    pairs
}

/// §3's per-kind VPN IPv4 partition, expressed as last-octet offsets from
/// the coordination server's network address.
const SUBNET_ROUTER_RANGE: (u8, u8) = (20, 29);
const REMOTE_RANGE: (u8, u8) = (30, 99);
const EXIT_NODE_RANGE: (u8, u8) = (100, 119);

/// Which `.conf` files an operation left stale (§4.8: "all orchestrator
/// outputs also include a `regeneration_plan`").
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegenerationPlan {
    pub stale: Vec<(String, EntityKind)>,
}

impl RegenerationPlan {
    fn single(guid: impl Into<String>, kind: EntityKind) -> RegenerationPlan {
        RegenerationPlan {
            stale: vec![(guid.into(), kind)],
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct AddRemoteOptions {
    pub custom_allowed_ips: Option<Vec<IpNet>>,
    pub device_type: Option<String>,
    /// Caller-supplied VPN IPv4 override, bypassing the `[.30,.99]`
    /// auto-allocator (§3: the `.120-.254` partition is "configurable for
    /// user overrides"; an override is simply a caller-supplied address
    /// outside the normal range). Validated against the coordination
    /// server's network and checked for collisions the same as an
    /// auto-allocated address.
    pub vpn_ipv4: Option<Ipv4Addr>,
    pub vpn_ipv6: Option<Ipv6Addr>,
    pub endpoint: Option<EndpointAddr>,
    pub listen_port: Option<u16>,
    /// The exit node to assign at creation (§3: "optional `exit_node_id`
    /// reference"). Required when `access_level` is `ExitOnly` (§8
    /// boundary: "a remote set to `exit_only` with no exit assigned
    /// fails `add`/`update` with a clear error").
    pub exit_node_guid: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct AddSubnetRouterOptions {
    /// See [`AddRemoteOptions::vpn_ipv4`].
    pub vpn_ipv4: Option<Ipv4Addr>,
    pub vpn_ipv6: Option<Ipv6Addr>,
    pub endpoint: Option<EndpointAddr>,
    pub listen_port: Option<u16>,
}

#[derive(Clone, Debug, Default)]
pub struct AddExitNodeOptions {
    /// See [`AddRemoteOptions::vpn_ipv4`].
    pub vpn_ipv4: Option<Ipv4Addr>,
    pub vpn_ipv6: Option<Ipv6Addr>,
    pub listen_port: Option<u16>,
}

/// Out-of-band detail an imported `.conf` text cannot itself supply
/// (§4.5's parse produces only what was written to disk): deployment
/// coordinates, the coordination server's own public endpoint, and a
/// subnet router's LAN advertisements. All optional — when omitted for a
/// re-import of an already-known entity, the existing stored value is
/// kept.
#[derive(Clone, Debug, Default)]
pub struct ImportOptions {
    pub ssh: Option<SshCoordinates>,
    pub endpoint: Option<EndpointAddr>,
    pub advertised_networks: Option<Vec<IpNet>>,
}

/// One entity [`Orchestrator::import_config`] resolved and persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportedEntity {
    pub guid: String,
    pub kind: EntityKind,
}

/// The result of one `import_config` call (§4.5: parse → derive/validate
/// keys (C1) → recognize `PostUp`/`PostDown` (C4) → reattach comments →
/// commit (C3)).
#[derive(Clone, Debug)]
pub struct ImportOutcome {
    pub config_type: ConfigType,
    /// The entity whose own `[Interface]` this text describes.
    pub primary: ImportedEntity,
    /// Peers discovered from a `coordination_server` import's `[Peer]`
    /// sections and persisted alongside `primary`. Each one's
    /// `current_private_key` is a locally generated placeholder — a CS's
    /// own file never reveals a peer's private key — so
    /// [`Orchestrator::integrity_check`] reports every fresh one as
    /// `KeyMismatch` until the operator imports that peer's own config.
    pub peers: Vec<ImportedEntity>,
}

/// The mesh's mutating API (§4.8). Holds no state of its own beyond a
/// store reference — every invariant check re-reads the store fresh, so
/// there is nothing here that can go stale between calls.
pub struct Orchestrator<'s> {
    store: &'s Store,
}

impl<'s> Orchestrator<'s> {
    #[must_use]
    pub fn new(store: &'s Store) -> Orchestrator<'s> {
        Orchestrator { store }
    }

    fn allocate_v4(&self, cs_guid: &str, range: (u8, u8)) -> MeshResult<IpAddr> {
        let cs = self
            .store
            .fetch_coordination_server(cs_guid)?
            .ok_or_else(|| MeshError::OrphanedReference {
                referrer: "orchestrator operation".to_string(),
                referent: format!("coordination_server {cs_guid}"),
            })?;
        let used = self.store.used_vpn_ipv4(cs_guid)?;
        let (lo, hi) = v4_offset_range(cs.vpn_network_v4, range.0, range.1);
        next_free(IpNet::V4(cs.vpn_network_v4), &used, lo, hi)
    }

    /// Resolves the VPN IPv4 for a new entity: an explicit `override_addr`
    /// (§3's "configurable for user overrides" escape hatch out of the
    /// `.120-.254` reserved partition) if the caller supplied one, else the
    /// next free address in `range`. An override still has to land inside
    /// the coordination server's own VPN network and still has to be
    /// unused — the override bypasses the range partition, not the
    /// network-membership or uniqueness invariants.
    fn resolve_v4(&self, cs_guid: &str, range: (u8, u8), override_addr: Option<Ipv4Addr>) -> MeshResult<Ipv4Addr> {
        let Some(addr) = override_addr else {
            let IpAddr::V4(addr) = self.allocate_v4(cs_guid, range)? else {
                unreachable!("allocate_v4 over an IPv4 network always returns an IPv4 address")
            };
            return Ok(addr);
        };

        let cs = self
            .store
            .fetch_coordination_server(cs_guid)?
            .ok_or_else(|| MeshError::OrphanedReference {
                referrer: "orchestrator operation".to_string(),
                referent: format!("coordination_server {cs_guid}"),
            })?;
        if !cs.vpn_network_v4.contains(&addr) {
            return Err(MeshError::AddressFamilyMismatch {
                addr: IpAddr::V4(addr),
                network: cs.vpn_network_v4.to_string(),
                network_family: "IPv4",
            });
        }
        let used = self.store.used_vpn_ipv4(cs_guid)?;
        if used.contains(&IpAddr::V4(addr)) {
            return Err(MeshError::DuplicateIdentity {
                field: "vpn_ipv4",
                value: addr.to_string(),
            });
        }
        Ok(addr)
    }

    /// §4.8 `add_remote`: allocates the next free VPN IPv4 in `[.30,.99]`,
    /// generates a keypair, persists with `permanent_guid =
    /// current_public_key`, and validates hostname uniqueness within the
    /// coordination server. Rejects `AccessLevel::ExitOnly` with no exit
    /// node assigned (§8 boundary behavior): that combination would
    /// regenerate a client config with zero `[Peer]` sections, since
    /// `exit_only` suppresses the CS peer and there is nothing left to
    /// peer with.
    #[instrument(skip(self, options))]
    pub fn add_remote(
        &self,
        cs_guid: &str,
        hostname: &str,
        access_level: AccessLevel,
        options: AddRemoteOptions,
    ) -> MeshResult<(Remote, RegenerationPlan)> {
        if self.store.fetch_remote_by_hostname(cs_guid, hostname)?.is_some() {
            return Err(MeshError::DuplicateIdentity {
                field: "hostname",
                value: hostname.to_string(),
            });
        }

        let exit_node_id = match options.exit_node_guid.as_deref() {
            Some(exit_guid) => {
                let exit = self.store.fetch_exit_node(exit_guid)?.ok_or_else(|| MeshError::OrphanedReference {
                    referrer: "add_remote".to_string(),
                    referent: format!("exit_node {exit_guid}"),
                })?;
                Some(exit.identity.permanent_guid)
            }
            None => {
                if access_level == AccessLevel::ExitOnly {
                    return Err(MeshError::MalformedConfig(
                        "exit_only remote requires an exit node assigned at creation (options.exit_node_guid)"
                            .to_string(),
                    ));
                }
                None
            }
        };

        let vpn_ipv4 = self.resolve_v4(cs_guid, REMOTE_RANGE, options.vpn_ipv4)?;
        let (private, public) = generate_keypair();
        let now = Utc::now();

        let remote = Remote {
            identity: Identity {
                permanent_guid: public.clone(),
                current_public_key: public,
                current_private_key: private,
                hostname: hostname.to_string(),
                vpn_ipv4,
                vpn_ipv6: options.vpn_ipv6,
                endpoint: options.endpoint,
                listen_port: options.listen_port,
                created_at: now,
                updated_at: now,
            },
            access_level,
            custom_allowed_ips: options.custom_allowed_ips,
            device_type: options.device_type,
            exit_node_id,
        };

        self.store.upsert_remote(&remote, cs_guid)?;
        self.store.cs_peer_order_append(cs_guid, &remote.identity.permanent_guid.to_string(), EntityKind::Remote)?;

        let mut plan = RegenerationPlan::single(cs_guid, EntityKind::CoordinationServer);
        plan.stale.push((remote.identity.permanent_guid.to_string(), EntityKind::Remote));
        if let Some(exit_guid) = &remote.exit_node_id {
            plan.stale.push((exit_guid.to_string(), EntityKind::ExitNode));
        }
        Ok((remote, plan))
    }

    /// §4.8 `add_subnet_router`: VPN IPv4 from `[.20,.29]`, seeds
    /// `PostUp`/`PostDown` from the canonical recognized patterns (MASQ +
    /// forwarding + MSS clamping).
    #[instrument(skip(self, options))]
    pub fn add_subnet_router(
        &self,
        cs_guid: &str,
        hostname: &str,
        advertised_networks: Vec<IpNet>,
        lan_interface: &str,
        ssh: SshCoordinates,
        options: AddSubnetRouterOptions,
    ) -> MeshResult<(SubnetRouter, RegenerationPlan)> {
        let cs = self
            .store
            .fetch_coordination_server(cs_guid)?
            .ok_or_else(|| MeshError::OrphanedReference {
                referrer: "add_subnet_router".to_string(),
                referent: format!("coordination_server {cs_guid}"),
            })?;
        let vpn_ipv4 = self.resolve_v4(cs_guid, SUBNET_ROUTER_RANGE, options.vpn_ipv4)?;
        let (private, public) = generate_keypair();
        let now = Utc::now();

        let sr = SubnetRouter {
            identity: Identity {
                permanent_guid: public.clone(),
                current_public_key: public,
                current_private_key: private,
                hostname: hostname.to_string(),
                vpn_ipv4,
                vpn_ipv6: options.vpn_ipv6,
                endpoint: options.endpoint,
                listen_port: options.listen_port,
                created_at: now,
                updated_at: now,
            },
            advertised_networks,
            lan_interface: lan_interface.to_string(),
            ssh,
        };

        self.store.upsert_subnet_router(&sr, cs_guid)?;
        self.store.cs_peer_order_append(cs_guid, &sr.identity.permanent_guid.to_string(), EntityKind::SubnetRouter)?;

        let sr_guid = sr.identity.permanent_guid.to_string();
        let mut commands = subnet_router_command_pairs(&cs, &sr.lan_interface);
        for pair in &mut commands {
            pair.entity_guid = sr_guid.clone();
        }
        self.store.replace_command_pairs(&sr_guid, &commands)?;

        let mut plan = RegenerationPlan::single(cs_guid, EntityKind::CoordinationServer);
        plan.stale.push((sr_guid, EntityKind::SubnetRouter));
        Ok((sr, plan))
    }

    /// §4.8 `add_exit_node`: VPN IPv4 from `[.100,.119]`, seeds MASQUERADE
    /// `PostUp`/`PostDown`.
    #[instrument(skip(self, options))]
    pub fn add_exit_node(
        &self,
        cs_guid: &str,
        hostname: &str,
        wan_interface: &str,
        endpoint: EndpointAddr,
        ssh: SshCoordinates,
        options: AddExitNodeOptions,
    ) -> MeshResult<(ExitNode, RegenerationPlan)> {
        let vpn_ipv4 = self.resolve_v4(cs_guid, EXIT_NODE_RANGE, options.vpn_ipv4)?;
        let (private, public) = generate_keypair();
        let now = Utc::now();

        let exit = ExitNode {
            identity: Identity {
                permanent_guid: public.clone(),
                current_public_key: public,
                current_private_key: private,
                hostname: hostname.to_string(),
                vpn_ipv4,
                vpn_ipv6: options.vpn_ipv6,
                endpoint: Some(endpoint),
                listen_port: options.listen_port,
                created_at: now,
                updated_at: now,
            },
            wan_interface: wan_interface.to_string(),
            ssh,
            assigned_remote_count: 0,
        };

        self.store.upsert_exit_node(&exit, cs_guid)?;
        self.store.cs_peer_order_append(cs_guid, &exit.identity.permanent_guid.to_string(), EntityKind::ExitNode)?;

        let mut plan = RegenerationPlan::single(cs_guid, EntityKind::CoordinationServer);
        plan.stale.push((exit.identity.permanent_guid.to_string(), EntityKind::ExitNode));
        Ok((exit, plan))
    }

    /// §4.8 `assign_exit`: stores the edge; forbids clearing the
    /// assignment on an `exit_only` remote (the operator must change its
    /// access level first).
    #[instrument(skip(self))]
    pub fn assign_exit(&self, remote_guid: &str, exit_guid: Option<&str>) -> MeshResult<RegenerationPlan> {
        let mut remote = self.store.fetch_remote(remote_guid)?.ok_or_else(|| MeshError::OrphanedReference {
            referrer: "assign_exit".to_string(),
            referent: format!("remote {remote_guid}"),
        })?;

        if exit_guid.is_none() && remote.access_level == AccessLevel::ExitOnly {
            return Err(MeshError::MalformedConfig(
                "cannot clear exit assignment on an exit_only remote; change its access level first".to_string(),
            ));
        }

        if let Some(exit_guid) = exit_guid {
            let exit = self.store.fetch_exit_node(exit_guid)?.ok_or_else(|| MeshError::OrphanedReference {
                referrer: "assign_exit".to_string(),
                referent: format!("exit_node {exit_guid}"),
            })?;
            remote.exit_node_id = Some(exit.identity.permanent_guid);
        } else {
            remote.exit_node_id = None;
        }

        let cs_guid = remote_cs_guid(self.store, remote_guid)?;
        self.store.upsert_remote(&remote, &cs_guid)?;

        let mut plan = RegenerationPlan::single(remote_guid, EntityKind::Remote);
        if let Some(exit_guid) = exit_guid {
            plan.stale.push((exit_guid.to_string(), EntityKind::ExitNode));
        }
        Ok(plan)
    }

    /// §4.8 `remove_entity`: deletes the row, writes a terminal rotation
    /// row (`new_public_key = None`), and returns the artifacts that must
    /// be regenerated. Removing an exit node reverts every remote assigned
    /// to it back to `full_access` (the policy decision recorded in
    /// `DESIGN.md`). Removing any mesh-speaking peer also marks its owning
    /// coordination server stale, since the CS's own `[Peer]` list just
    /// lost an entry.
    #[instrument(skip(self))]
    pub fn remove_entity(&self, guid: &str, kind: EntityKind, reason: &str) -> MeshResult<RegenerationPlan> {
        let mut plan = RegenerationPlan::default();

        let old_public_key = match kind {
            EntityKind::CoordinationServer => {
                let cs = self.store.fetch_coordination_server(guid)?;
                cs.map(|c| c.identity.current_public_key.to_string())
            }
            EntityKind::SubnetRouter => {
                self.store.fetch_subnet_router(guid)?.map(|s| s.identity.current_public_key.to_string())
            }
            EntityKind::Remote => self.store.fetch_remote(guid)?.map(|r| r.identity.current_public_key.to_string()),
            EntityKind::ExitNode => self.store.fetch_exit_node(guid)?.map(|e| e.identity.current_public_key.to_string()),
            _ => None,
        };

        let owning_cs_guid = match kind {
            EntityKind::CoordinationServer => None,
            EntityKind::SubnetRouter => Some(subnet_router_cs_guid(self.store, guid)?),
            EntityKind::Remote => Some(remote_cs_guid(self.store, guid)?),
            EntityKind::ExitNode => Some(exit_node_cs_guid(self.store, guid)?),
            _ => None,
        };

        if kind == EntityKind::ExitNode {
            // Captured before clearing: clearing nulls `exit_node_guid`,
            // so querying afterward would always find nothing.
            let affected = self.store.list_remotes_assigned_to_exit(guid)?;
            let reverted = self.store.clear_exit_assignment_reverting_to_full_access(guid)?;
            if reverted > 0 {
                for remote in affected {
                    plan.stale.push((remote.identity.permanent_guid.to_string(), EntityKind::Remote));
                }
            }
        }

        if let Some(old_public_key) = old_public_key {
            self.store.append_rotation(&KeyRotationRecord {
                id: None,
                entity_guid: guid.to_string(),
                entity_kind: kind,
                old_public_key,
                new_public_key: None,
                new_private_key: None,
                rotated_at: Utc::now(),
                reason: reason.to_string(),
            })?;
        }

        self.store.delete_entity(guid, kind)?;

        plan.stale.push((guid.to_string(), kind));
        if let Some(cs_guid) = owning_cs_guid {
            plan.stale.push((cs_guid, EntityKind::CoordinationServer));
        }
        Ok(plan)
    }

    /// §4.8 `rotate_keys`: generates a new keypair, appends a rotation
    /// row, and updates `current_*` only — `permanent_guid` never changes
    /// (identity invariant #1).
    #[instrument(skip(self))]
    pub fn rotate_keys(&self, guid: &str, kind: EntityKind, reason: &str) -> MeshResult<RegenerationPlan> {
        let old_public_key;
        let (new_private, new_public) = generate_keypair();
        let mut owning_cs_guid: Option<String> = None;

        match kind {
            EntityKind::CoordinationServer => {
                let mut cs = self.store.fetch_coordination_server(guid)?.ok_or_else(|| MeshError::OrphanedReference {
                    referrer: "rotate_keys".to_string(),
                    referent: format!("coordination_server {guid}"),
                })?;
                old_public_key = cs.identity.current_public_key.to_string();
                cs.identity.current_private_key = new_private.clone();
                cs.identity.current_public_key = new_public.clone();
                cs.identity.updated_at = Utc::now();
                self.store.upsert_coordination_server(&cs)?;
            }
            EntityKind::SubnetRouter => {
                let mut sr = self.store.fetch_subnet_router(guid)?.ok_or_else(|| MeshError::OrphanedReference {
                    referrer: "rotate_keys".to_string(),
                    referent: format!("subnet_router {guid}"),
                })?;
                old_public_key = sr.identity.current_public_key.to_string();
                sr.identity.current_private_key = new_private.clone();
                sr.identity.current_public_key = new_public.clone();
                sr.identity.updated_at = Utc::now();
                let cs_guid = subnet_router_cs_guid(self.store, guid)?;
                self.store.upsert_subnet_router(&sr, &cs_guid)?;
                owning_cs_guid = Some(cs_guid);
            }
            EntityKind::Remote => {
                let mut remote = self.store.fetch_remote(guid)?.ok_or_else(|| MeshError::OrphanedReference {
                    referrer: "rotate_keys".to_string(),
                    referent: format!("remote {guid}"),
                })?;
                old_public_key = remote.identity.current_public_key.to_string();
                remote.identity.current_private_key = new_private.clone();
                remote.identity.current_public_key = new_public.clone();
                remote.identity.updated_at = Utc::now();
                let cs_guid = remote_cs_guid(self.store, guid)?;
                self.store.upsert_remote(&remote, &cs_guid)?;
                owning_cs_guid = Some(cs_guid);
            }
            EntityKind::ExitNode => {
                let mut exit = self.store.fetch_exit_node(guid)?.ok_or_else(|| MeshError::OrphanedReference {
                    referrer: "rotate_keys".to_string(),
                    referent: format!("exit_node {guid}"),
                })?;
                old_public_key = exit.identity.current_public_key.to_string();
                exit.identity.current_private_key = new_private.clone();
                exit.identity.current_public_key = new_public.clone();
                exit.identity.updated_at = Utc::now();
                let cs_guid = exit_node_cs_guid(self.store, guid)?;
                self.store.upsert_exit_node(&exit, &cs_guid)?;
                owning_cs_guid = Some(cs_guid);
            }
            _ => {
                return Err(MeshError::MalformedConfig(
                    "rotate_keys only supports mesh-speaking entity kinds".to_string(),
                ))
            }
        }

        self.store.append_rotation(&KeyRotationRecord {
            id: None,
            entity_guid: guid.to_string(),
            entity_kind: kind,
            old_public_key,
            new_public_key: Some(new_public.to_string()),
            new_private_key: Some(new_private.to_string()),
            rotated_at: Utc::now(),
            reason: reason.to_string(),
        })?;

        // A rotated peer's public key changes the CS config too. Rotating the
        // CS itself changes the shared secret every mesh-speaking entity
        // trusts, so every entity underneath it goes stale, not just the CS.
        let mut plan = RegenerationPlan::single(guid, kind);
        if kind == EntityKind::CoordinationServer {
            for sr in self.store.list_subnet_routers(guid)? {
                plan.stale.push((sr.identity.permanent_guid.to_string(), EntityKind::SubnetRouter));
            }
            for remote in self.store.list_remotes(guid)? {
                plan.stale.push((remote.identity.permanent_guid.to_string(), EntityKind::Remote));
            }
            for exit in self.store.list_exit_nodes(guid)? {
                plan.stale.push((exit.identity.permanent_guid.to_string(), EntityKind::ExitNode));
            }
        } else if let Some(cs_guid) = owning_cs_guid {
            plan.stale.push((cs_guid, EntityKind::CoordinationServer));
        }
        Ok(plan)
    }

    /// §4.8 `integrity_check`.
    pub fn integrity_check(&self, cs_guid: &str) -> MeshResult<Vec<crate::store::IntegrityViolation>> {
        self.store.integrity_check(cs_guid)
    }

    /// Turns a parsed `.conf` (§4.5 C5 output) into persisted entities.
    /// Derives the file's own public key from its `[Interface] PrivateKey`
    /// (C1), classifies the file via [`parse::detect_config_type`], cross
    /// checks any referenced peer's claimed public key against what is
    /// already on file (§4.5 rule 6, via [`parse::check_key_consistency`]),
    /// recognizes `PostUp`/`PostDown` fragments through the pattern library
    /// (C4), and reattaches comments to the resolved `permanent_guid`
    /// before committing everything through the usual `upsert_*`/
    /// `replace_*` store calls.
    ///
    /// `cs_guid` names the mesh this import belongs to: `None` bootstraps a
    /// brand-new mesh from a `coordination_server`-type import; `Some`
    /// attaches a `subnet_router`/`client` import to an already-known mesh,
    /// or re-imports a coordination server's own file under its existing
    /// identity.
    #[instrument(skip(self, raw, options))]
    pub fn import_config(
        &self,
        raw: &RawConfig,
        cs_guid: Option<&str>,
        hostname_hint: &str,
        options: ImportOptions,
    ) -> MeshResult<ImportOutcome> {
        let config_type = parse::detect_config_type(raw);

        let private_str = raw.interface.private_key.as_deref().ok_or_else(|| {
            MeshError::MalformedConfig(
                "imported [Interface] has no PrivateKey; cannot derive identity".to_string(),
            )
        })?;
        let private = PrivateKey::try_from(private_str)?;
        let derived = derive_public(&private);

        match config_type {
            ConfigType::CoordinationServer => {
                self.import_coordination_server(raw, cs_guid, hostname_hint, private, derived, options)
            }
            ConfigType::SubnetRouter => {
                let cs_guid = cs_guid.ok_or_else(|| {
                    MeshError::MalformedConfig(
                        "importing a subnet_router config requires an existing coordination_server guid"
                            .to_string(),
                    )
                })?;
                self.import_subnet_router(raw, cs_guid, hostname_hint, private, derived, options)
            }
            ConfigType::Client => {
                let cs_guid = cs_guid.ok_or_else(|| {
                    MeshError::MalformedConfig(
                        "importing a client config requires an existing coordination_server guid"
                            .to_string(),
                    )
                })?;
                self.import_remote(raw, cs_guid, hostname_hint, private, derived, options)
            }
        }
    }

    fn import_coordination_server(
        &self,
        raw: &RawConfig,
        cs_guid: Option<&str>,
        hostname_hint: &str,
        private: PrivateKey,
        derived: PublicKey,
        options: ImportOptions,
    ) -> MeshResult<ImportOutcome> {
        let first_addr = raw.interface.address.first().ok_or_else(|| {
            MeshError::MalformedConfig("coordination_server import has no Interface Address".to_string())
        })?;
        let IpNet::V4(own_v4) = parse_cidr(first_addr)? else {
            return Err(MeshError::MalformedConfig(
                "coordination_server's own Address must be IPv4".to_string(),
            ));
        };
        let vpn_ipv4 = own_v4.addr();
        let vpn_network_v4 =
            Ipv4Net::new(own_v4.network(), own_v4.prefix_len()).expect("same prefix on a network address is valid");

        let listen_port = raw
            .interface
            .listen_port
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(|_| MeshError::MalformedConfig("bad ListenPort".to_string()))?;

        let existing = match cs_guid {
            Some(guid) => self.store.fetch_coordination_server(guid)?,
            None => None,
        };

        let now = Utc::now();
        let cs = CoordinationServer {
            identity: Identity {
                permanent_guid: existing.as_ref().map_or_else(|| derived.clone(), |e| e.identity.permanent_guid.clone()),
                current_public_key: derived,
                current_private_key: private,
                hostname: hostname_hint.to_string(),
                vpn_ipv4,
                vpn_ipv6: existing.as_ref().and_then(|e| e.identity.vpn_ipv6),
                endpoint: options.endpoint.clone().or_else(|| existing.as_ref().and_then(|e| e.identity.endpoint.clone())),
                listen_port,
                created_at: existing.as_ref().map_or(now, |e| e.identity.created_at),
                updated_at: now,
            },
            vpn_network_v4: existing.as_ref().map_or(vpn_network_v4, |e| e.vpn_network_v4),
            vpn_network_v6: existing.as_ref().and_then(|e| e.vpn_network_v6),
            ssh: options
                .ssh
                .clone()
                .or_else(|| existing.as_ref().map(|e| e.ssh.clone()))
                .ok_or_else(|| MeshError::MalformedConfig("coordination_server import requires ssh coordinates".to_string()))?,
        };
        self.store.upsert_coordination_server(&cs)?;
        let cs_guid_str = cs.identity.permanent_guid.to_string();

        let (pairs, singletons, _warnings) = recognize_commands(
            &cs_guid_str,
            EntityKind::CoordinationServer,
            &raw.interface.post_up,
            &raw.interface.post_down,
        );
        self.store.replace_command_pairs(&cs_guid_str, &pairs)?;
        self.store.replace_command_singletons(&cs_guid_str, &singletons)?;

        let incoming = reattach_comments(&raw.interface.comments, &cs_guid_str, EntityKind::CoordinationServer);
        let existing_comments = self.store.list_comments(&cs_guid_str)?;
        self.store.replace_comments(&cs_guid_str, &parse::comments::merge(&existing_comments, &incoming))?;

        let mut peers = Vec::new();
        for peer in &raw.peers {
            peers.push(self.import_cs_peer(&cs_guid_str, vpn_network_v4, peer)?);
        }

        Ok(ImportOutcome {
            config_type: ConfigType::CoordinationServer,
            primary: ImportedEntity {
                guid: cs_guid_str,
                kind: EntityKind::CoordinationServer,
            },
            peers,
        })
    }

    /// Resolves one `[Peer]` section of a coordination server's own file
    /// into a persisted SR/remote/exit-node placeholder, classified by
    /// which §3 VPN IPv4 partition its `AllowedIPs` host address falls in.
    fn import_cs_peer(&self, cs_guid: &str, cs_network: Ipv4Net, peer: &RawPeer) -> MeshResult<ImportedEntity> {
        let public_str = peer
            .public_key
            .as_deref()
            .ok_or_else(|| MeshError::MalformedConfig("[Peer] section has no PublicKey".to_string()))?;
        let public = PublicKey::try_from(public_str)?;
        let peer_guid = public.to_string();

        let allowed_ip = peer
            .allowed_ips
            .first()
            .ok_or_else(|| MeshError::MalformedConfig(format!("peer {peer_guid} has no AllowedIPs")))?;
        let IpNet::V4(allowed_v4) = parse_cidr(allowed_ip)? else {
            return Err(MeshError::MalformedConfig(format!(
                "peer {peer_guid}'s first AllowedIPs entry is not IPv4"
            )));
        };
        let vpn_ipv4 = allowed_v4.addr();

        let existing = self.lookup_existing_identity(&peer_guid)?;
        let now = Utc::now();

        let (permanent_guid, current_private_key, created_at, kind) = match existing {
            Some((existing_kind, identity)) => {
                parse::check_key_consistency(
                    &format!("{existing_kind} {peer_guid} (referenced from coordination_server {cs_guid})"),
                    &peer_guid,
                    &identity.current_public_key.to_string(),
                )?;
                (identity.permanent_guid, identity.current_private_key, identity.created_at, existing_kind)
            }
            None => (public.clone(), PrivateKey::random(), now, classify_peer_kind(cs_network, vpn_ipv4)),
        };

        let hostname = Identity::default_hostname(&permanent_guid);
        let ssh_host = hostname.clone();
        let identity = Identity {
            permanent_guid: permanent_guid.clone(),
            current_public_key: public,
            current_private_key,
            hostname,
            vpn_ipv4,
            vpn_ipv6: None,
            endpoint: peer.endpoint.as_deref().map(EndpointAddr::parse).transpose()?,
            listen_port: None,
            created_at,
            updated_at: now,
        };
        let guid = permanent_guid.to_string();

        match kind {
            EntityKind::SubnetRouter => {
                let sr = SubnetRouter {
                    identity,
                    advertised_networks: Vec::new(),
                    lan_interface: "eth0".to_string(),
                    ssh: SshCoordinates {
                        host: ssh_host,
                        port: 22,
                        user: "root".to_string(),
                        remote_config_path: SshCoordinates::default_config_path("wg0"),
                    },
                };
                self.store.upsert_subnet_router(&sr, cs_guid)?;
            }
            EntityKind::ExitNode => {
                let exit = ExitNode {
                    identity,
                    wan_interface: "eth0".to_string(),
                    ssh: SshCoordinates {
                        host: ssh_host,
                        port: 22,
                        user: "root".to_string(),
                        remote_config_path: SshCoordinates::default_config_path("wg0"),
                    },
                    assigned_remote_count: 0,
                };
                self.store.upsert_exit_node(&exit, cs_guid)?;
            }
            _ => {
                let remote = Remote {
                    identity,
                    access_level: AccessLevel::FullAccess,
                    custom_allowed_ips: None,
                    device_type: None,
                    exit_node_id: None,
                };
                self.store.upsert_remote(&remote, cs_guid)?;
            }
        }

        self.store.cs_peer_order_append(cs_guid, &guid, kind)?;
        let incoming = reattach_comments(&peer.comments, &guid, kind);
        let existing_comments = self.store.list_comments(&guid)?;
        self.store.replace_comments(&guid, &parse::comments::merge(&existing_comments, &incoming))?;

        Ok(ImportedEntity { guid, kind })
    }

    fn lookup_existing_identity(&self, guid: &str) -> MeshResult<Option<(EntityKind, Identity)>> {
        if let Some(sr) = self.store.fetch_subnet_router(guid)? {
            return Ok(Some((EntityKind::SubnetRouter, sr.identity)));
        }
        if let Some(remote) = self.store.fetch_remote(guid)? {
            return Ok(Some((EntityKind::Remote, remote.identity)));
        }
        if let Some(exit) = self.store.fetch_exit_node(guid)? {
            return Ok(Some((EntityKind::ExitNode, exit.identity)));
        }
        Ok(None)
    }

    fn import_subnet_router(
        &self,
        raw: &RawConfig,
        cs_guid: &str,
        hostname_hint: &str,
        private: PrivateKey,
        derived: PublicKey,
        options: ImportOptions,
    ) -> MeshResult<ImportOutcome> {
        let cs = self.store.fetch_coordination_server(cs_guid)?.ok_or_else(|| MeshError::OrphanedReference {
            referrer: "import_config".to_string(),
            referent: format!("coordination_server {cs_guid}"),
        })?;

        let peer = raw
            .peers
            .first()
            .ok_or_else(|| MeshError::MalformedConfig("subnet_router import has no [Peer] section".to_string()))?;
        let peer_key = peer
            .public_key
            .as_deref()
            .ok_or_else(|| MeshError::MalformedConfig("subnet_router's [Peer] has no PublicKey".to_string()))?;
        parse::check_key_consistency(
            &format!("coordination_server {cs_guid}"),
            peer_key,
            &cs.identity.current_public_key.to_string(),
        )?;

        let first_addr = raw
            .interface
            .address
            .first()
            .ok_or_else(|| MeshError::MalformedConfig("subnet_router import has no Interface Address".to_string()))?;
        let IpNet::V4(own_v4) = parse_cidr(first_addr)? else {
            return Err(MeshError::MalformedConfig("subnet_router's own Address must be IPv4".to_string()));
        };
        let vpn_ipv4 = own_v4.addr();

        let existing = self.store.fetch_subnet_router(&derived.to_string())?;
        let (pairs, singletons, _warnings) = recognize_commands(
            "",
            EntityKind::SubnetRouter,
            &raw.interface.post_up,
            &raw.interface.post_down,
        );
        let lan_interface = pairs
            .iter()
            .find(|p| p.pattern_name == Some(PatternName::NatMasqueradeIpv4))
            .and_then(|p| p.variables.get("wan").cloned())
            .unwrap_or_else(|| "eth0".to_string());

        let now = Utc::now();
        let identity = Identity {
            permanent_guid: existing.as_ref().map_or_else(|| derived.clone(), |e| e.identity.permanent_guid.clone()),
            current_public_key: derived,
            current_private_key: private,
            hostname: hostname_hint.to_string(),
            vpn_ipv4,
            vpn_ipv6: existing.as_ref().and_then(|e| e.identity.vpn_ipv6),
            endpoint: options.endpoint.clone().or_else(|| existing.as_ref().and_then(|e| e.identity.endpoint.clone())),
            listen_port: raw
                .interface
                .listen_port
                .as_deref()
                .map(str::parse)
                .transpose()
                .map_err(|_| MeshError::MalformedConfig("bad ListenPort".to_string()))?,
            created_at: existing.as_ref().map_or(now, |e| e.identity.created_at),
            updated_at: now,
        };
        let sr_guid = identity.permanent_guid.to_string();
        let sr = SubnetRouter {
            identity,
            advertised_networks: options
                .advertised_networks
                .clone()
                .unwrap_or_else(|| existing.as_ref().map_or_else(Vec::new, |e| e.advertised_networks.clone())),
            lan_interface,
            ssh: options
                .ssh
                .clone()
                .or_else(|| existing.as_ref().map(|e| e.ssh.clone()))
                .ok_or_else(|| MeshError::MalformedConfig("subnet_router import requires ssh coordinates".to_string()))?,
        };
        self.store.upsert_subnet_router(&sr, cs_guid)?;
        self.store.cs_peer_order_append(cs_guid, &sr_guid, EntityKind::SubnetRouter)?;

        let mut pairs = pairs;
        for p in &mut pairs {
            p.entity_guid = sr_guid.clone();
        }
        let mut singletons = singletons;
        for s in &mut singletons {
            s.entity_guid = sr_guid.clone();
        }
        self.store.replace_command_pairs(&sr_guid, &pairs)?;
        self.store.replace_command_singletons(&sr_guid, &singletons)?;

        let incoming = reattach_comments(&raw.interface.comments, &sr_guid, EntityKind::SubnetRouter);
        let existing_comments = self.store.list_comments(&sr_guid)?;
        self.store.replace_comments(&sr_guid, &parse::comments::merge(&existing_comments, &incoming))?;

        Ok(ImportOutcome {
            config_type: ConfigType::SubnetRouter,
            primary: ImportedEntity {
                guid: sr_guid,
                kind: EntityKind::SubnetRouter,
            },
            peers: Vec::new(),
        })
    }

    fn import_remote(
        &self,
        raw: &RawConfig,
        cs_guid: &str,
        hostname_hint: &str,
        private: PrivateKey,
        derived: PublicKey,
        options: ImportOptions,
    ) -> MeshResult<ImportOutcome> {
        let cs = self.store.fetch_coordination_server(cs_guid)?.ok_or_else(|| MeshError::OrphanedReference {
            referrer: "import_config".to_string(),
            referent: format!("coordination_server {cs_guid}"),
        })?;

        let peer = raw
            .peers
            .first()
            .ok_or_else(|| MeshError::MalformedConfig("client import has no [Peer] section".to_string()))?;
        let peer_key = peer
            .public_key
            .as_deref()
            .ok_or_else(|| MeshError::MalformedConfig("client's [Peer] has no PublicKey".to_string()))?;
        parse::check_key_consistency(
            &format!("coordination_server {cs_guid}"),
            peer_key,
            &cs.identity.current_public_key.to_string(),
        )?;

        let first_addr = raw
            .interface
            .address
            .first()
            .ok_or_else(|| MeshError::MalformedConfig("client import has no Interface Address".to_string()))?;
        let IpNet::V4(own_v4) = parse_cidr(first_addr)? else {
            return Err(MeshError::MalformedConfig("client's own Address must be IPv4".to_string()));
        };
        let vpn_ipv4 = own_v4.addr();

        let existing = self.store.fetch_remote(&derived.to_string())?;
        let now = Utc::now();
        let identity = Identity {
            permanent_guid: existing.as_ref().map_or_else(|| derived.clone(), |e| e.identity.permanent_guid.clone()),
            current_public_key: derived,
            current_private_key: private,
            hostname: hostname_hint.to_string(),
            vpn_ipv4,
            vpn_ipv6: existing.as_ref().and_then(|e| e.identity.vpn_ipv6),
            endpoint: options.endpoint.clone().or_else(|| existing.as_ref().and_then(|e| e.identity.endpoint.clone())),
            listen_port: raw
                .interface
                .listen_port
                .as_deref()
                .map(str::parse)
                .transpose()
                .map_err(|_| MeshError::MalformedConfig("bad ListenPort".to_string()))?,
            created_at: existing.as_ref().map_or(now, |e| e.identity.created_at),
            updated_at: now,
        };
        let remote_guid = identity.permanent_guid.to_string();
        let remote = Remote {
            identity,
            access_level: existing.as_ref().map_or(AccessLevel::FullAccess, |e| e.access_level),
            custom_allowed_ips: existing.as_ref().and_then(|e| e.custom_allowed_ips.clone()),
            device_type: existing.as_ref().and_then(|e| e.device_type.clone()),
            exit_node_id: existing.as_ref().and_then(|e| e.exit_node_id.clone()),
        };
        self.store.upsert_remote(&remote, cs_guid)?;
        self.store.cs_peer_order_append(cs_guid, &remote_guid, EntityKind::Remote)?;

        let incoming = reattach_comments(&raw.interface.comments, &remote_guid, EntityKind::Remote);
        let existing_comments = self.store.list_comments(&remote_guid)?;
        self.store.replace_comments(&remote_guid, &parse::comments::merge(&existing_comments, &incoming))?;

        Ok(ImportOutcome {
            config_type: ConfigType::Client,
            primary: ImportedEntity {
                guid: remote_guid,
                kind: EntityKind::Remote,
            },
            peers: Vec::new(),
        })
    }
}

fn to_command_scope(scope: PatternScope) -> CommandScope {
    match scope {
        PatternScope::Interface => CommandScope::Interface,
        PatternScope::PeerSpecific => CommandScope::PeerSpecific,
        PatternScope::Global => CommandScope::Global,
    }
}

/// Classifies a peer discovered in a coordination server's own file by
/// which §3 VPN IPv4 partition its address falls in, defaulting to
/// `Remote` outside the subnet-router/exit-node ranges (the largest and
/// most generic category).
fn classify_peer_kind(network: Ipv4Net, addr: Ipv4Addr) -> EntityKind {
    let base = u32::from(network.network());
    let offset = u32::from(addr).wrapping_sub(base);
    if (u32::from(SUBNET_ROUTER_RANGE.0)..=u32::from(SUBNET_ROUTER_RANGE.1)).contains(&offset) {
        EntityKind::SubnetRouter
    } else if (u32::from(EXIT_NODE_RANGE.0)..=u32::from(EXIT_NODE_RANGE.1)).contains(&offset) {
        EntityKind::ExitNode
    } else {
        EntityKind::Remote
    }
}

/// Runs an entity's `PostUp`/`PostDown` lines through the pattern library
/// (C4), pairing each recognized up-line with a recognized down-line that
/// shares its pattern and variables, and falling back to `command_singleton`
/// rows (verbatim, with a [`crate::error::Warning::UnrecognizedPattern`])
/// for anything left unmatched.
fn recognize_commands(
    entity_guid: &str,
    kind: EntityKind,
    post_up: &[String],
    post_down: &[String],
) -> (Vec<CommandPair>, Vec<CommandSingleton>, Vec<crate::error::Warning>) {
    let mut pairs = Vec::new();
    let mut singletons = Vec::new();
    let mut warnings = Vec::new();
    let mut matched_down = vec![false; post_down.len()];
    let mut order = 0i64;

    for up in post_up {
        match recognize_or_warn(up) {
            Ok((name, vars)) => {
                let expected_down = emit_down(name, &vars);
                let down_idx = post_down
                    .iter()
                    .enumerate()
                    .position(|(i, d)| !matched_down[i] && d.trim() == expected_down);
                if let Some(idx) = down_idx {
                    matched_down[idx] = true;
                    pairs.push(CommandPair {
                        entity_guid: entity_guid.to_string(),
                        entity_kind: kind,
                        pattern_name: Some(name),
                        up_commands: vec![up.clone()],
                        down_commands: vec![post_down[idx].clone()],
                        variables: vars,
                        scope: to_command_scope(pattern(name).scope),
                        execution_order: order,
                    });
                } else {
                    singletons.push(CommandSingleton {
                        entity_guid: entity_guid.to_string(),
                        entity_kind: kind,
                        pattern_name: Some(name),
                        direction_is_up: true,
                        command: up.clone(),
                        variables: vars,
                        scope: to_command_scope(pattern(name).scope),
                        execution_order: order,
                    });
                }
            }
            Err(w) => {
                warnings.push(w);
                singletons.push(CommandSingleton {
                    entity_guid: entity_guid.to_string(),
                    entity_kind: kind,
                    pattern_name: None,
                    direction_is_up: true,
                    command: up.clone(),
                    variables: BTreeMap::new(),
                    scope: CommandScope::Global,
                    execution_order: order,
                });
            }
        }
        order += 1;
    }

    // Recognizers only ever match `PostUp`-style text (§4.4's emitters are
    // the only source of canonical down-text); a `PostDown` line with no
    // up-line to pair against is therefore always unrecognized, not a
    // failed lookup.
    for (i, down) in post_down.iter().enumerate() {
        if matched_down[i] {
            continue;
        }
        warnings.push(crate::error::Warning::UnrecognizedPattern { line: down.clone() });
        singletons.push(CommandSingleton {
            entity_guid: entity_guid.to_string(),
            entity_kind: kind,
            pattern_name: None,
            direction_is_up: false,
            command: down.clone(),
            variables: BTreeMap::new(),
            scope: CommandScope::Global,
            execution_order: order,
        });
        order += 1;
    }

    (pairs, singletons, warnings)
}

fn remote_cs_guid(store: &Store, remote_guid: &str) -> MeshResult<String> {
    store
        .remote_cs_guid(remote_guid)?
        .ok_or_else(|| MeshError::OrphanedReference {
            referrer: format!("remote {remote_guid}"),
            referent: "coordination_server".to_string(),
        })
}

fn subnet_router_cs_guid(store: &Store, sr_guid: &str) -> MeshResult<String> {
    store
        .subnet_router_cs_guid(sr_guid)?
        .ok_or_else(|| MeshError::OrphanedReference {
            referrer: format!("subnet_router {sr_guid}"),
            referent: "coordination_server".to_string(),
        })
}

fn exit_node_cs_guid(store: &Store, exit_guid: &str) -> MeshResult<String> {
    store
        .exit_node_cs_guid(exit_guid)?
        .ok_or_else(|| MeshError::OrphanedReference {
            referrer: format!("exit_node {exit_guid}"),
            referent: "coordination_server".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CoordinationServer, SshCoordinates};

    fn bootstrap_cs(store: &Store) -> String {
        let (private, public) = generate_keypair();
        let now = Utc::now();
        let cs = CoordinationServer {
            identity: Identity {
                permanent_guid: public.clone(),
                current_public_key: public,
                current_private_key: private,
                hostname: "hub".to_string(),
                vpn_ipv4: "10.66.0.1".parse().unwrap(),
                vpn_ipv6: None,
                endpoint: Some(EndpointAddr {
                    host: "hub.example.com".to_string(),
                    port: 51820,
                }),
                listen_port: Some(51820),
                created_at: now,
                updated_at: now,
            },
            vpn_network_v4: "10.66.0.0/24".parse().unwrap(),
            vpn_network_v6: None,
            ssh: SshCoordinates {
                host: "hub.example.com".to_string(),
                port: 22,
                user: "root".to_string(),
                remote_config_path: "/etc/wireguard/wg0.conf".to_string(),
            },
        };
        store.upsert_coordination_server(&cs).unwrap();
        cs.identity.permanent_guid.to_string()
    }

    fn bootstrap_dual_stack_cs(store: &Store) -> String {
        let (private, public) = generate_keypair();
        let now = Utc::now();
        let cs = CoordinationServer {
            identity: Identity {
                permanent_guid: public.clone(),
                current_public_key: public,
                current_private_key: private,
                hostname: "hub".to_string(),
                vpn_ipv4: "10.66.0.1".parse().unwrap(),
                vpn_ipv6: Some("fd00:66::1".parse().unwrap()),
                endpoint: Some(EndpointAddr {
                    host: "hub.example.com".to_string(),
                    port: 51820,
                }),
                listen_port: Some(51820),
                created_at: now,
                updated_at: now,
            },
            vpn_network_v4: "10.66.0.0/24".parse().unwrap(),
            vpn_network_v6: Some("fd00:66::/64".parse().unwrap()),
            ssh: SshCoordinates {
                host: "hub.example.com".to_string(),
                port: 22,
                user: "root".to_string(),
                remote_config_path: "/etc/wireguard/wg0.conf".to_string(),
            },
        };
        store.upsert_coordination_server(&cs).unwrap();
        cs.identity.permanent_guid.to_string()
    }

    /// A dual-stack mesh's subnet router gets both the IPv4 and IPv6
    /// bidirectional FORWARD pair, not just the IPv4 half.
    #[test]
    fn add_subnet_router_on_dual_stack_mesh_seeds_ipv6_bidirectional_forward() {
        let store = Store::open_memory().unwrap();
        let cs_guid = bootstrap_dual_stack_cs(&store);
        let orch = Orchestrator::new(&store);

        let (sr, _) = orch
            .add_subnet_router(
                &cs_guid,
                "home-gateway",
                vec!["192.168.10.0/24".parse().unwrap()],
                "eth0",
                SshCoordinates {
                    host: "home-gateway.lan".to_string(),
                    port: 22,
                    user: "root".to_string(),
                    remote_config_path: "/etc/wireguard/wg0.conf".to_string(),
                },
                AddSubnetRouterOptions::default(),
            )
            .unwrap();

        let sr_guid = sr.identity.permanent_guid.to_string();
        let pairs = store.list_command_pairs(&sr_guid).unwrap();
        let names: Vec<_> = pairs.iter().map(|p| p.pattern_name).collect();
        assert_eq!(
            names,
            vec![
                Some(PatternName::EnableIpv4Forwarding),
                Some(PatternName::NatMasqueradeIpv4),
                Some(PatternName::EnableIpv6Forwarding),
                Some(PatternName::NatMasqueradeIpv6),
                Some(PatternName::BidirectionalForwardIpv4),
                Some(PatternName::BidirectionalForwardIpv6),
                Some(PatternName::MssClamping),
            ]
        );
        let bidi6 = pairs.iter().find(|p| p.pattern_name == Some(PatternName::BidirectionalForwardIpv6)).unwrap();
        assert!(bidi6.up_commands.iter().any(|l| l.starts_with("ip6tables -A FORWARD -i wg0 -o eth0")));
        assert!(bidi6.up_commands.iter().any(|l| l.starts_with("ip6tables -A FORWARD -i eth0 -o wg0")));
    }

    #[test]
    fn add_remote_allocates_lowest_free_address_and_duplicate_hostname_fails() {
        let store = Store::open_memory().unwrap();
        let cs_guid = bootstrap_cs(&store);
        let orch = Orchestrator::new(&store);

        let (remote, plan) = orch
            .add_remote(&cs_guid, "alice-phone", AccessLevel::FullAccess, AddRemoteOptions::default())
            .unwrap();
        assert_eq!(remote.identity.vpn_ipv4, "10.66.0.30".parse::<std::net::Ipv4Addr>().unwrap());
        assert_eq!(plan.stale.len(), 2);

        let dup = orch.add_remote(&cs_guid, "alice-phone", AccessLevel::FullAccess, AddRemoteOptions::default());
        assert!(matches!(dup, Err(MeshError::DuplicateIdentity { .. })));
    }

    #[test]
    fn add_remote_honors_explicit_vpn_ipv4_override_outside_the_remote_range() {
        let store = Store::open_memory().unwrap();
        let cs_guid = bootstrap_cs(&store);
        let orch = Orchestrator::new(&store);

        let (remote, _) = orch
            .add_remote(
                &cs_guid,
                "reserved-kiosk",
                AccessLevel::FullAccess,
                AddRemoteOptions {
                    vpn_ipv4: Some("10.66.0.200".parse().unwrap()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(remote.identity.vpn_ipv4, "10.66.0.200".parse::<std::net::Ipv4Addr>().unwrap());

        let collide = orch.add_remote(
            &cs_guid,
            "another-kiosk",
            AccessLevel::FullAccess,
            AddRemoteOptions {
                vpn_ipv4: Some("10.66.0.200".parse().unwrap()),
                ..Default::default()
            },
        );
        assert!(matches!(collide, Err(MeshError::DuplicateIdentity { field: "vpn_ipv4", .. })));

        let outside_network = orch.add_remote(
            &cs_guid,
            "off-network-kiosk",
            AccessLevel::FullAccess,
            AddRemoteOptions {
                vpn_ipv4: Some("10.77.0.5".parse().unwrap()),
                ..Default::default()
            },
        );
        assert!(matches!(outside_network, Err(MeshError::AddressFamilyMismatch { .. })));
    }

    #[test]
    fn add_subnet_router_seeds_canonical_command_pairs() {
        let store = Store::open_memory().unwrap();
        let cs_guid = bootstrap_cs(&store);
        let orch = Orchestrator::new(&store);

        let (sr, _) = orch
            .add_subnet_router(
                &cs_guid,
                "home-gateway",
                vec!["192.168.10.0/24".parse().unwrap()],
                "eth0",
                SshCoordinates {
                    host: "home-gateway.lan".to_string(),
                    port: 22,
                    user: "root".to_string(),
                    remote_config_path: "/etc/wireguard/wg0.conf".to_string(),
                },
                AddSubnetRouterOptions::default(),
            )
            .unwrap();

        let sr_guid = sr.identity.permanent_guid.to_string();
        let pairs = store.list_command_pairs(&sr_guid).unwrap();
        let names: Vec<_> = pairs.iter().map(|p| p.pattern_name).collect();
        assert_eq!(
            names,
            vec![
                Some(PatternName::EnableIpv4Forwarding),
                Some(PatternName::NatMasqueradeIpv4),
                Some(PatternName::BidirectionalForwardIpv4),
                Some(PatternName::MssClamping),
            ]
        );
        let nat = pairs.iter().find(|p| p.pattern_name == Some(PatternName::NatMasqueradeIpv4)).unwrap();
        assert_eq!(nat.variables.get("wan"), Some(&"eth0".to_string()));
        assert!(nat.up_commands[0].contains("10.66.0.0/24"));
    }

    #[test]
    fn rotate_keys_preserves_permanent_guid() {
        let store = Store::open_memory().unwrap();
        let cs_guid = bootstrap_cs(&store);
        let orch = Orchestrator::new(&store);
        let (remote, _) = orch
            .add_remote(&cs_guid, "bob-laptop", AccessLevel::VpnOnly, AddRemoteOptions::default())
            .unwrap();
        let guid = remote.identity.permanent_guid.to_string();

        orch.rotate_keys(&guid, EntityKind::Remote, "scheduled rotation").unwrap();

        let reloaded = store.fetch_remote(&guid).unwrap().unwrap();
        assert_eq!(reloaded.identity.permanent_guid.to_string(), guid);
        assert_ne!(reloaded.identity.current_public_key.to_string(), guid);
        assert!(reloaded.identity.is_internally_consistent());

        let history = store.rotation_history(&guid).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].old_public_key, guid);
    }

    /// Rotating a non-CS entity's keys must mark the *owning* CS stale,
    /// not the rotated entity's own guid mislabeled as a CS.
    #[test]
    fn rotate_keys_on_remote_marks_owning_cs_stale() {
        let store = Store::open_memory().unwrap();
        let cs_guid = bootstrap_cs(&store);
        let orch = Orchestrator::new(&store);
        let (remote, _) = orch
            .add_remote(&cs_guid, "bob-laptop", AccessLevel::VpnOnly, AddRemoteOptions::default())
            .unwrap();
        let guid = remote.identity.permanent_guid.to_string();

        let plan = orch.rotate_keys(&guid, EntityKind::Remote, "scheduled rotation").unwrap();

        assert!(plan.stale.contains(&(guid.clone(), EntityKind::Remote)));
        assert!(plan.stale.contains(&(cs_guid, EntityKind::CoordinationServer)));
        assert!(!plan.stale.contains(&(guid, EntityKind::CoordinationServer)));
    }

    #[test]
    fn removing_exit_node_reverts_assigned_remotes_to_full_access() {
        let store = Store::open_memory().unwrap();
        let cs_guid = bootstrap_cs(&store);
        let orch = Orchestrator::new(&store);
        let (exit, _) = orch
            .add_exit_node(
                &cs_guid,
                "vps-exit",
                "eth0",
                EndpointAddr {
                    host: "vps.example.com".to_string(),
                    port: 51820,
                },
                SshCoordinates {
                    host: "vps.example.com".to_string(),
                    port: 22,
                    user: "root".to_string(),
                    remote_config_path: "/etc/wireguard/wg0.conf".to_string(),
                },
                AddExitNodeOptions::default(),
            )
            .unwrap();
        let exit_guid = exit.identity.permanent_guid.to_string();
        let (remote, _) = orch
            .add_remote(
                &cs_guid,
                "carol-tablet",
                AccessLevel::ExitOnly,
                AddRemoteOptions {
                    exit_node_guid: Some(exit_guid.clone()),
                    ..Default::default()
                },
            )
            .unwrap();
        let remote_guid = remote.identity.permanent_guid.to_string();
        assert_eq!(remote.exit_node_id.as_ref().unwrap().to_string(), exit_guid);

        orch.remove_entity(&exit_guid, EntityKind::ExitNode, "decommissioned").unwrap();

        let reloaded = store.fetch_remote(&remote_guid).unwrap().unwrap();
        assert_eq!(reloaded.access_level, AccessLevel::FullAccess);
        assert!(reloaded.exit_node_id.is_none());
    }

    /// §8 boundary behavior: "a remote set to `exit_only` with no exit
    /// assigned fails `add`/`update` with a clear error."
    #[test]
    fn add_remote_rejects_exit_only_with_no_exit_assigned() {
        let store = Store::open_memory().unwrap();
        let cs_guid = bootstrap_cs(&store);
        let orch = Orchestrator::new(&store);

        let result = orch.add_remote(&cs_guid, "roaming", AccessLevel::ExitOnly, AddRemoteOptions::default());
        assert!(matches!(result, Err(MeshError::MalformedConfig(_))));
        assert!(store.fetch_remote_by_hostname(&cs_guid, "roaming").unwrap().is_none());
    }
}
