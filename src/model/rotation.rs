//! §3 `key_rotation_history`: append-only audit trail that survives an
//! entity's removal (its terminal row has `new_*` null).

use chrono::{DateTime, Utc};

use super::EntityKind;

#[derive(Clone, Debug, PartialEq)]
pub struct KeyRotationRecord {
    pub id: Option<i64>,
    pub entity_guid: String,
    pub entity_kind: EntityKind,
    pub old_public_key: String,
    /// `None` on the terminal row written by `remove_entity` (§3 Lifecycle).
    pub new_public_key: Option<String>,
    pub new_private_key: Option<String>,
    pub rotated_at: DateTime<Utc>,
    pub reason: String,
}
