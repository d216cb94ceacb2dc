//! File-backed [`BlobStore`] writing one enveloped JSON document per key.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::envelope::{rewrap, unwrap_data};
use crate::{BlobStore, StoreError};

/// Stores each key as `<dir>/<key>`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

/// Read and parse a JSON document, `None` when the file does not exist.
pub async fn read_json(path: &Path) -> Result<Option<serde_json::Value>, StoreError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write `doc` to `path` through a sibling temp file and rename.
pub async fn write_json(path: &Path, doc: &serde_json::Value) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let text = serde_json::to_string_pretty(doc)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, text).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl BlobStore for JsonFileStore {
    async fn load(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(read_json(&self.path_for(key)).await?.map(unwrap_data))
    }

    async fn save(&self, key: &str, data: &serde_json::Value) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let existing = match read_json(&path).await {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(key, error = %e, "Existing store file unreadable, rewriting");
                None
            }
        };
        let doc = rewrap(existing, key, data.clone());
        write_json(&path, &doc).await?;
        tracing::debug!(key, path = %path.display(), "Store file written");
        Ok(())
    }
}
