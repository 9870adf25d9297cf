//! The import merger (§3 Lifecycle: "Comments are mutated only by
//! explicit edit or by the import merger (which matches new comments to
//! existing entities by `permanent_guid`)").

use crate::model::{Comment, EntityKind};

/// Merges freshly parsed comments for one entity against the comments
/// already on file for that `permanent_guid`. Existing comments are kept
/// verbatim (including any operator edits); comments present in the new
/// parse but absent from the existing set are appended. Nothing is ever
/// deleted by import — only explicit operator edits remove a comment.
#[must_use]
pub fn merge(existing: &[Comment], incoming: &[Comment]) -> Vec<Comment> {
    let mut merged = existing.to_vec();
    let mut next_order = merged.iter().map(|c| c.display_order).max().map_or(0, |m| m + 1);

    for candidate in incoming {
        let already_present = existing
            .iter()
            .any(|e| e.text == candidate.text && e.position == candidate.position);
        if !already_present {
            let mut c = candidate.clone();
            c.id = None;
            c.display_order = next_order;
            next_order += 1;
            merged.push(c);
        }
    }

    merged
}

/// Re-keys a batch of freshly parsed comments to a concrete entity once
/// its `permanent_guid` is known (§4.5 rule 4: "re-attached to the entity
/// identity once the section's public key is known").
#[must_use]
pub fn rekey(comments: Vec<Comment>, entity_guid: &str, entity_kind: EntityKind) -> Vec<Comment> {
    comments
        .into_iter()
        .map(|mut c| {
            c.entity_guid = entity_guid.to_string();
            c.entity_kind = entity_kind;
            c
        })
        .collect()
}
