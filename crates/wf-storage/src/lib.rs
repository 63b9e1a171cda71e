//! Persistence contract for the workflow engine
//!
//! The engine and the cron job manager persist recipes, executions, and
//! schedule state through the `Store` trait: opaque JSON-serializable
//! records keyed by (kind, id). Two implementations are provided: an
//! in-memory store for tests and a JSON file store that writes atomically
//! (temp file + rename) with one directory per kind.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tracing::debug;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence contract: opaque JSON records keyed by (kind, id)
///
/// No schema beyond "JSON-serializable record" is required; recipe,
/// execution, and job shapes must round-trip exactly.
#[async_trait]
pub trait Store: Send + Sync {
    /// Save (insert or replace) a record
    async fn save(&self, kind: &str, id: &str, record: Value) -> StoreResult<()>;

    /// Load a record, None if absent
    async fn load(&self, kind: &str, id: &str) -> StoreResult<Option<Value>>;

    /// Delete a record; deleting an absent record is not an error
    async fn delete(&self, kind: &str, id: &str) -> StoreResult<()>;

    /// List all (id, record) pairs of a kind
    async fn list_all(&self, kind: &str) -> StoreResult<Vec<(String, Value)>>;
}

/// Thread-safe store handle
pub type SharedStore = Arc<dyn Store>;

fn check_key(part: &str) -> StoreResult<()> {
    if part.is_empty() || part.contains('/') || part.contains("..") {
        return Err(StoreError::InvalidKey(part.to_string()));
    }
    Ok(())
}

/// In-memory store backed by a concurrent map
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<String, Value>,
}

impl MemoryStore {
    /// Create an empty in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    fn key(kind: &str, id: &str) -> String {
        format!("{}/{}", kind, id)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save(&self, kind: &str, id: &str, record: Value) -> StoreResult<()> {
        check_key(kind)?;
        check_key(id)?;
        self.records.insert(Self::key(kind, id), record);
        Ok(())
    }

    async fn load(&self, kind: &str, id: &str) -> StoreResult<Option<Value>> {
        Ok(self.records.get(&Self::key(kind, id)).map(|r| r.clone()))
    }

    async fn delete(&self, kind: &str, id: &str) -> StoreResult<()> {
        self.records.remove(&Self::key(kind, id));
        Ok(())
    }

    async fn list_all(&self, kind: &str) -> StoreResult<Vec<(String, Value)>> {
        let prefix = format!("{}/", kind);
        let mut records: Vec<(String, Value)> = self
            .records
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| (entry.key()[prefix.len()..].to_string(), entry.value().clone()))
            .collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }
}

/// JSON file store: one directory per kind, one `<id>.json` file per record
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    /// Create a store rooted at the given directory
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn file_path(&self, kind: &str, id: &str) -> PathBuf {
        self.root.join(kind).join(format!("{}.json", id))
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn save(&self, kind: &str, id: &str, record: Value) -> StoreResult<()> {
        check_key(kind)?;
        check_key(id)?;

        let dir = self.root.join(kind);
        if !dir.exists() {
            fs::create_dir_all(&dir).await?;
        }

        let path = self.file_path(kind, id);
        let temp_path = dir.join(format!("{}.json.tmp", id));
        let content = serde_json::to_string_pretty(&record)?;

        // Write to temp file first, then atomic rename
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, &path).await?;

        debug!(kind = kind, id = id, "Saved record");
        Ok(())
    }

    async fn load(&self, kind: &str, id: &str) -> StoreResult<Option<Value>> {
        check_key(kind)?;
        check_key(id)?;

        let path = self.file_path(kind, id);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn delete(&self, kind: &str, id: &str) -> StoreResult<()> {
        check_key(kind)?;
        check_key(id)?;

        let path = self.file_path(kind, id);
        if path.exists() {
            fs::remove_file(&path).await?;
            debug!(kind = kind, id = id, "Deleted record");
        }
        Ok(())
    }

    async fn list_all(&self, kind: &str) -> StoreResult<Vec<(String, Value)>> {
        check_key(kind)?;

        let dir = self.root.join(kind);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        let mut entries = fs::read_dir(&dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id) = name.strip_suffix(".json") else {
                // Skip temp files and anything else
                continue;
            };

            let content = fs::read_to_string(entry.path()).await?;
            records.push((id.to_string(), serde_json::from_str(&content)?));
        }

        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }
}
