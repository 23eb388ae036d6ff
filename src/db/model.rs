//! Database view models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use crate::model::{NoticeLevel, ObjectType};

/// A stored notice as shown to operators.
#[derive(Debug, Clone)]
pub struct StoredNotice {
    pub id: i64,
    pub level: String,
    pub message: String,
    pub created_at: String,
}

impl StoredNotice {
    pub fn is_error(&self) -> bool {
        self.level == NoticeLevel::Error.as_str()
    }
}

/// One embedded relation of a stored object, e.g. an article's tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLink {
    pub linked_type: ObjectType,
    pub linked_hail_id: String,
}

/// Per-type counts of stored objects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectCount {
    pub object_type: String,
    pub count: i64,
}
