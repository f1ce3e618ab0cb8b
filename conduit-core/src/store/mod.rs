//! Configuration store adapter.
//!
//! The store is the single source of truth. Every list operation returns a
//! deterministic order (by id) and an empty collection when nothing matches;
//! `get_connection` returns `None` for an unknown id.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::models::{BlockDescriptor, ConnectionDescriptor, TagMapping};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("malformed {record}: {reason}")]
    Malformed { record: String, reason: String },
}

impl StoreError {
    pub(crate) fn malformed(record: impl Into<String>, reason: impl ToString) -> Self {
        StoreError::Malformed {
            record: record.into(),
            reason: reason.to_string(),
        }
    }
}

/// Typed read API over connection/block/tag records
pub trait ConfigStore: Send + Sync {
    fn list_enabled_connections(&self) -> Result<Vec<ConnectionDescriptor>, StoreError>;

    fn get_connection(&self, id: &str) -> Result<Option<ConnectionDescriptor>, StoreError>;

    fn list_blocks(&self, connection_id: &str) -> Result<Vec<BlockDescriptor>, StoreError>;

    fn list_tag_mappings(&self, block_id: &str) -> Result<Vec<TagMapping>, StoreError>;
}
