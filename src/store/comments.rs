//! CRUD for `comment` rows (§3, §4.5 rule 4).

use rusqlite::params;

use crate::error::MeshResult;
use crate::model::{Comment, CommentCategory, CommentPosition, EntityKind};

use super::Store;

fn row_to_comment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Comment> {
    let kind: String = row.get(2)?;
    let category: String = row.get(3)?;
    let position: String = row.get(5)?;
    Ok(Comment {
        id: Some(row.get(0)?),
        entity_guid: row.get(1)?,
        entity_kind: EntityKind::from_str(&kind)
            .ok_or_else(|| bad_col(2))?,
        category: CommentCategory::parse(&category).ok_or_else(|| bad_col(3))?,
        text: row.get(4)?,
        position: CommentPosition::parse(&position).ok_or_else(|| bad_col(5))?,
        display_order: row.get(6)?,
    })
}

fn bad_col(idx: usize) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, "stored value".to_string(), rusqlite::types::Type::Text)
}

impl Store {
    pub fn list_comments(&self, entity_guid: &str) -> MeshResult<Vec<Comment>> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id, entity_guid, entity_kind, category, text, position, display_order
                 FROM comment WHERE entity_guid = ?1 ORDER BY display_order",
            )?;
            let rows = stmt
                .query_map(params![entity_guid], row_to_comment)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Replaces the full comment set for one entity, following the §3
    /// merge rule: callers pass the already-merged set (see
    /// [`crate::parse::comments::merge`]) so this is a plain overwrite,
    /// never a delete-then-reimport of operator edits.
    pub fn replace_comments(&self, entity_guid: &str, comments: &[Comment]) -> MeshResult<()> {
        self.with_tx(|tx| {
            tx.execute("DELETE FROM comment WHERE entity_guid = ?1", params![entity_guid])?;
            for c in comments {
                tx.execute(
                    "INSERT INTO comment (entity_guid, entity_kind, category, text, position, display_order)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        entity_guid,
                        c.entity_kind.as_str(),
                        c.category.as_str(),
                        c.text,
                        c.position.as_str(),
                        c.display_order,
                    ],
                )?;
            }
            Ok(())
        })
    }

    pub fn append_comment(&self, comment: &Comment) -> MeshResult<()> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO comment (entity_guid, entity_kind, category, text, position, display_order)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    comment.entity_guid,
                    comment.entity_kind.as_str(),
                    comment.category.as_str(),
                    comment.text,
                    comment.position.as_str(),
                    comment.display_order,
                ],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(order: i64) -> Comment {
        Comment {
            id: None,
            entity_guid: "g1".to_string(),
            entity_kind: EntityKind::Remote,
            category: CommentCategory::Custom,
            text: format!("note {order}"),
            position: CommentPosition::Above,
            display_order: order,
        }
    }

    #[test]
    fn replace_then_list_round_trips() {
        let store = Store::open_memory().unwrap();
        store.replace_comments("g1", &[comment(0), comment(1)]).unwrap();
        let listed = store.list_comments("g1").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].text, "note 1");
    }
}
