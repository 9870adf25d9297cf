//! The append-only `key_rotation_history` audit trail (§3 Lifecycle,
//! §4.8's "the append-only rotation log is the source of truth for key
//! history").

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::error::MeshResult;
use crate::model::{EntityKind, KeyRotationRecord};

use super::Store;

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<KeyRotationRecord> {
    let kind: String = row.get(2)?;
    let rotated_at: String = row.get(6)?;
    Ok(KeyRotationRecord {
        id: Some(row.get(0)?),
        entity_guid: row.get(1)?,
        entity_kind: EntityKind::from_str(&kind).ok_or_else(|| bad_col(2))?,
        old_public_key: row.get(3)?,
        new_public_key: row.get(4)?,
        new_private_key: row.get(5)?,
        rotated_at: DateTime::parse_from_rfc3339(&rotated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| bad_col(6))?,
        reason: row.get(7)?,
    })
}

fn bad_col(idx: usize) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, "stored value".to_string(), rusqlite::types::Type::Text)
}

impl Store {
    /// Appends one rotation row. Callers are expected to have already
    /// checked the §3 invariant that `old_public_key` equals the most
    /// recent `new_public_key` (or the entity's first-ever public key) —
    /// the orchestrator (C8) owns that check so the store stays a plain
    /// append, matching this crate's transaction-per-operation model.
    pub fn append_rotation(&self, record: &KeyRotationRecord) -> MeshResult<()> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO key_rotation_history
                 (entity_guid, entity_kind, old_public_key, new_public_key, new_private_key, rotated_at, reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.entity_guid,
                    record.entity_kind.as_str(),
                    record.old_public_key,
                    record.new_public_key,
                    record.new_private_key,
                    record.rotated_at.to_rfc3339(),
                    record.reason,
                ],
            )?;
            Ok(())
        })
    }

    pub fn rotation_history(&self, entity_guid: &str) -> MeshResult<Vec<KeyRotationRecord>> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id, entity_guid, entity_kind, old_public_key, new_public_key,
                        new_private_key, rotated_at, reason
                 FROM key_rotation_history WHERE entity_guid = ?1 ORDER BY rotated_at",
            )?;
            let rows = stmt
                .query_map(params![entity_guid], row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// The most recent rotation row for an entity, if any (used by the
    /// orchestrator to find the current `old_public_key` baseline).
    pub fn latest_rotation(&self, entity_guid: &str) -> MeshResult<Option<KeyRotationRecord>> {
        self.with_tx(|tx| {
            tx.query_row(
                "SELECT id, entity_guid, entity_kind, old_public_key, new_public_key,
                        new_private_key, rotated_at, reason
                 FROM key_rotation_history WHERE entity_guid = ?1
                 ORDER BY rotated_at DESC LIMIT 1",
                params![entity_guid],
                row_to_record,
            )
            .optional()
            .map_err(Into::into)
        })
    }
}
