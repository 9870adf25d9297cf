//! The integrity check (§4.3): walks every mesh-speaking entity under a
//! coordination server and reports every violation of identity invariant
//! #2 (`current_public_key == derive_public(current_private_key)`) plus
//! dangling references (an `exit_node_guid` or `subnet_router_guid` that
//! no longer exists).

use crate::error::MeshResult;
use crate::model::EntityKind;

use super::Store;

/// One detected inconsistency. Distinct from [`crate::error::MeshError`]:
/// an integrity check enumerates every violation it finds rather than
/// failing at the first (§4.3: "enumerate violations, don't just fail
/// fast").
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IntegrityViolation {
    KeyMismatch {
        entity_guid: String,
        entity_kind: EntityKind,
    },
    DanglingExitAssignment {
        remote_guid: String,
        exit_node_guid: String,
    },
    DanglingFirewallSubnetRouter {
        remote_guid: String,
        subnet_router_guid: String,
    },
}

impl std::fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityViolation::KeyMismatch { entity_guid, entity_kind } => {
                write!(f, "{entity_kind} {entity_guid}: current_public_key does not match derive_public(current_private_key)")
            }
            IntegrityViolation::DanglingExitAssignment { remote_guid, exit_node_guid } => {
                write!(f, "remote {remote_guid}: exit_node_guid {exit_node_guid} does not exist")
            }
            IntegrityViolation::DanglingFirewallSubnetRouter { remote_guid, subnet_router_guid } => {
                write!(f, "remote {remote_guid}: firewall rule references missing subnet_router {subnet_router_guid}")
            }
        }
    }
}

impl Store {
    pub fn integrity_check(&self, cs_guid: &str) -> MeshResult<Vec<IntegrityViolation>> {
        let mut violations = Vec::new();

        if let Some(cs) = self.fetch_coordination_server(cs_guid)? {
            if !cs.identity.is_internally_consistent() {
                violations.push(IntegrityViolation::KeyMismatch {
                    entity_guid: cs.identity.permanent_guid.to_string(),
                    entity_kind: EntityKind::CoordinationServer,
                });
            }
        }

        let subnet_routers = self.list_subnet_routers(cs_guid)?;
        for sr in &subnet_routers {
            if !sr.identity.is_internally_consistent() {
                violations.push(IntegrityViolation::KeyMismatch {
                    entity_guid: sr.identity.permanent_guid.to_string(),
                    entity_kind: EntityKind::SubnetRouter,
                });
            }
        }

        let exit_nodes = self.list_exit_nodes(cs_guid)?;
        for exit in &exit_nodes {
            if !exit.identity.is_internally_consistent() {
                violations.push(IntegrityViolation::KeyMismatch {
                    entity_guid: exit.identity.permanent_guid.to_string(),
                    entity_kind: EntityKind::ExitNode,
                });
            }
        }

        let remotes = self.list_remotes(cs_guid)?;
        for remote in &remotes {
            if !remote.identity.is_internally_consistent() {
                violations.push(IntegrityViolation::KeyMismatch {
                    entity_guid: remote.identity.permanent_guid.to_string(),
                    entity_kind: EntityKind::Remote,
                });
            }
            if let Some(exit_id) = &remote.exit_node_id {
                let exit_guid = exit_id.to_string();
                if !exit_nodes.iter().any(|e| e.identity.permanent_guid.to_string() == exit_guid) {
                    violations.push(IntegrityViolation::DanglingExitAssignment {
                        remote_guid: remote.identity.permanent_guid.to_string(),
                        exit_node_guid: exit_guid,
                    });
                }
            }
            let rules = self.list_firewall_rules(&remote.identity.permanent_guid.to_string())?;
            for rule in rules {
                if !subnet_routers
                    .iter()
                    .any(|sr| sr.identity.permanent_guid.to_string() == rule.subnet_router_guid)
                {
                    violations.push(IntegrityViolation::DanglingFirewallSubnetRouter {
                        remote_guid: remote.identity.permanent_guid.to_string(),
                        subnet_router_guid: rule.subnet_router_guid,
                    });
                }
            }
        }

        Ok(violations)
    }
}
