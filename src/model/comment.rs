//! Comments attach to an entity's `permanent_guid`, never to a key or a
//! file offset, so they survive key rotation (§3).

use super::EntityKind;

/// §3 `comment.category`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommentCategory {
    Hostname,
    Role,
    Rationale,
    PermanentGuidRef,
    Custom,
}

impl CommentCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CommentCategory::Hostname => "hostname",
            CommentCategory::Role => "role",
            CommentCategory::Rationale => "rationale",
            CommentCategory::PermanentGuidRef => "permanent_guid_ref",
            CommentCategory::Custom => "custom",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<CommentCategory> {
        Some(match s {
            "hostname" => CommentCategory::Hostname,
            "role" => CommentCategory::Role,
            "rationale" => CommentCategory::Rationale,
            "permanent_guid_ref" => CommentCategory::PermanentGuidRef,
            "custom" => CommentCategory::Custom,
            _ => return None,
        })
    }
}

/// §3 `comment.position` / §4.5 rule 4 (comment attachment).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommentPosition {
    Before,
    After,
    Inline,
    Above,
    Below,
    Standalone,
}

impl CommentPosition {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CommentPosition::Before => "before",
            CommentPosition::After => "after",
            CommentPosition::Inline => "inline",
            CommentPosition::Above => "above",
            CommentPosition::Below => "below",
            CommentPosition::Standalone => "standalone",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<CommentPosition> {
        Some(match s {
            "before" => CommentPosition::Before,
            "after" => CommentPosition::After,
            "inline" => CommentPosition::Inline,
            "above" => CommentPosition::Above,
            "below" => CommentPosition::Below,
            "standalone" => CommentPosition::Standalone,
            _ => return None,
        })
    }
}

/// A single `comment` row (§3).
#[derive(Clone, Debug, PartialEq)]
pub struct Comment {
    pub id: Option<i64>,
    pub entity_guid: String,
    pub entity_kind: EntityKind,
    pub category: CommentCategory,
    pub text: String,
    pub position: CommentPosition,
    pub display_order: i64,
}
