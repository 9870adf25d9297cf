//! The config parser (spec §4.5, component C5): textual WireGuard `.conf`
//! → structured records, with comment attachment, multi-valued key
//! splitting, unknown-field preservation and config-type detection.
//!
//! This module produces *raw* records (`RawInterface`/`RawPeer`) —
//! strings, not yet validated keys or CIDRs. [`crate::orchestrator`] is
//! what turns a [`RawConfig`] into entities in the store, deriving public
//! keys (C1) and cross-checking them (§4.5 rule 6).

pub mod comments;
mod detect;
mod fields;

pub use detect::{detect_config_type, ConfigType};

use crate::error::{MeshError, Warning};
use crate::model::{CommentCategory, CommentPosition};

/// A comment attached during parsing, before it is re-attached to an
/// entity's `permanent_guid` once that entity's public key is known
/// (§4.5 rule 4).
#[derive(Clone, Debug, PartialEq)]
pub struct AttachedComment {
    pub text: String,
    pub position: CommentPosition,
    /// The field key this comment sits next to, when its position is
    /// `Before`/`Inline`/`After`. `None` for `Above`/`Below`/`Standalone`.
    pub field_key: Option<String>,
}

impl AttachedComment {
    #[must_use]
    pub fn guess_category(&self) -> CommentCategory {
        let lower = self.text.to_lowercase();
        if lower.contains("host") || lower.contains("name:") {
            CommentCategory::Hostname
        } else if lower.contains("role") || lower.contains("router")
            || lower.contains("gateway")
            || lower.contains("exit")
        {
            CommentCategory::Role
        } else if lower.contains("because") || lower.contains("since") || lower.contains("reason")
        {
            CommentCategory::Rationale
        } else {
            CommentCategory::Custom
        }
    }
}

/// The `[Interface]` section, still in raw string form.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawInterface {
    pub private_key: Option<String>,
    pub address: Vec<String>,
    pub listen_port: Option<String>,
    pub dns: Vec<String>,
    pub mtu: Option<String>,
    pub table: Option<String>,
    pub fwmark: Option<String>,
    pub post_up: Vec<String>,
    pub post_down: Vec<String>,
    pub unknown_fields: Vec<(String, String)>,
    pub comments: Vec<AttachedComment>,
}

/// A single `[Peer]` section, still in raw string form.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawPeer {
    pub public_key: Option<String>,
    pub preshared_key: Option<String>,
    pub allowed_ips: Vec<String>,
    pub endpoint: Option<String>,
    pub persistent_keepalive: Option<String>,
    pub unknown_fields: Vec<(String, String)>,
    pub comments: Vec<AttachedComment>,
}

/// The full parse of one `.conf` file (§4.5).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawConfig {
    pub interface: RawInterface,
    /// Parse order preserved (§4.5 rule: peers retain source order; this
    /// is also the fallback for `cs_peer_order`, §3).
    pub peers: Vec<RawPeer>,
    /// Comments with no section context (before the first `[...]` line).
    pub standalone_comments: Vec<String>,
}

/// Parses one `.conf` text into a [`RawConfig`], collecting non-fatal
/// issues as [`Warning`]s rather than failing the whole parse (§7:
/// "Unknown sections and unknown fields are warnings, not failures").
pub fn parse(text: &str) -> Result<(RawConfig, Vec<Warning>), MeshError> {
    let lines: Vec<&str> = text.lines().collect();
    let sections = fields::split_sections(&lines)?;

    let mut config = RawConfig::default();
    let mut warnings = Vec::new();

    for section in sections {
        match section.header.as_deref() {
            None => {
                config.standalone_comments = section
                    .lines
                    .iter()
                    .filter_map(|l| fields::comment_text(l))
                    .collect();
            }
            Some("Interface") => {
                let (iface, mut w) = fields::parse_interface(&section.lines)?;
                config.interface = iface;
                warnings.append(&mut w);
            }
            Some("Peer") => {
                let (peer, mut w) = fields::parse_peer(&section.lines)?;
                config.peers.push(peer);
                warnings.append(&mut w);
            }
            Some(other) => {
                warnings.push(Warning::UnknownField {
                    section: other.to_string(),
                    key: "<section>".to_string(),
                });
            }
        }
    }

    Ok((config, warnings))
}

/// §4.5 rule 6: every `[Peer]` referencing an interface's derived public
/// key elsewhere must match it exactly.
pub fn check_key_consistency(
    context: &str,
    derived: &str,
    stored: &str,
) -> Result<(), MeshError> {
    if derived == stored {
        Ok(())
    } else {
        Err(MeshError::KeyConsistencyError {
            context: context.to_string(),
            derived: derived.to_string(),
            stored: stored.to_string(),
        })
    }
}

/// Splits a comma-separated multi-valued field (§4.5 rule 3: `Address`,
/// `DNS`, `AllowedIPs`).
#[must_use]
pub fn split_multivalue(raw: &str) -> Vec<String> {
    raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
}

/// Turns a section's positionally-attached comments into `comment` rows
/// keyed to a concrete entity (§4.5 rule 4: "re-attached to the entity
/// identity once the section's public key is known"). Called by
/// [`crate::orchestrator::Orchestrator::import_config`] once the section's
/// `permanent_guid` has been derived or matched.
pub(crate) fn reattach_comments(
    raw_comments: &[AttachedComment],
    entity_guid: &str,
    entity_kind: crate::model::EntityKind,
) -> Vec<crate::model::Comment> {
    raw_comments
        .iter()
        .enumerate()
        .map(|(i, c)| crate::model::Comment {
            id: None,
            entity_guid: entity_guid.to_string(),
            entity_kind,
            category: c.guess_category(),
            text: c.text.clone(),
            position: c.position,
            display_order: i as i64,
        })
        .collect()
}
