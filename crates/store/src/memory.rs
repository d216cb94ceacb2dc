//! In-memory [`BlobStore`].

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{BlobStore, StoreError};

/// Keeps documents in a map. Counts saves so callers can observe write
/// coalescing.
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<String, serde_json::Value>>,
    saves: Mutex<HashMap<String, usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document without counting it as a save.
    pub async fn insert(&self, key: &str, data: serde_json::Value) {
        self.docs.lock().await.insert(key.to_string(), data);
    }

    /// Current document under `key`.
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.docs.lock().await.get(key).cloned()
    }

    /// Number of saves performed for `key`.
    pub async fn save_count(&self, key: &str) -> usize {
        self.saves.lock().await.get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self.get(key).await)
    }

    async fn save(&self, key: &str, data: &serde_json::Value) -> Result<(), StoreError> {
        self.docs.lock().await.insert(key.to_string(), data.clone());
        *self.saves.lock().await.entry(key.to_string()).or_default() += 1;
        Ok(())
    }
}
