//! Persistence for Lockly.
//!
//! [`BlobStore`] is the key/value primitive the host provides: whole JSON
//! documents addressed by a storage key. Two implementations ship here,
//! [`MemoryStore`] for tests and embedding, and [`JsonFileStore`] which
//! writes one enveloped JSON file per key. The [`slots`] module layers the
//! slot table on top.

pub mod envelope;
pub mod file;
pub mod memory;
pub mod slots;

use async_trait::async_trait;
use lockly_core::error::LocklyError;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

/// Storage key prefix of the slot table.
pub const SLOTS_STORAGE_KEY: &str = "lockly_slots";
/// Storage key prefix of the activity log.
pub const ACTIVITY_STORAGE_KEY: &str = "lockly_activity";

/// Slot table key for one installation.
pub fn slots_key(installation: &str) -> String {
    format!("{SLOTS_STORAGE_KEY}.{installation}")
}

/// Activity log key for one installation.
pub fn activity_key(installation: &str) -> String {
    format!("{ACTIVITY_STORAGE_KEY}.{installation}")
}

/// Whole-document key/value storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Load the document stored under `key`, `None` when absent.
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    /// Replace the document stored under `key`.
    async fn save(&self, key: &str, data: &serde_json::Value) -> Result<(), StoreError>;
}

/// Errors raised by store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Reading or writing the backing file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stored document is not valid JSON or has the wrong shape.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl From<StoreError> for LocklyError {
    fn from(err: StoreError) -> Self {
        LocklyError::Storage(err.to_string())
    }
}
