//! Key-value state store used for lifecycle records, breaker configs and
//! checkpoints. Last write wins; no transactions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::errors::ServiceError;

/// Classification attached to every stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    State,
    Configuration,
    Checkpoint,
}

/// A value as recorded by a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub key: String,
    pub kind: StateKind,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn set_state(
        &self,
        key: &str,
        value: Value,
        kind: StateKind,
        metadata: Option<Value>,
    ) -> Result<(), ServiceError>;

    async fn get_state(&self, key: &str) -> Result<Option<Value>, ServiceError>;
}

/// In-process store backed by a map.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: RwLock<HashMap<String, StoredEntry>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entry(&self, key: &str) -> Option<StoredEntry> {
        self.entries.read().await.get(key).cloned()
    }

    /// Stored keys starting with `prefix`, sorted.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut keys: Vec<_> = self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn set_state(
        &self,
        key: &str,
        value: Value,
        kind: StateKind,
        metadata: Option<Value>,
    ) -> Result<(), ServiceError> {
        let entry = StoredEntry {
            key: key.to_string(),
            kind,
            value,
            metadata,
            updated_at: Utc::now(),
        };
        self.entries.write().await.insert(key.to_string(), entry);
        Ok(())
    }

    async fn get_state(&self, key: &str) -> Result<Option<Value>, ServiceError> {
        Ok(self.entries.read().await.get(key).map(|e| e.value.clone()))
    }
}

/// Store that keeps one JSON document per key under a directory.
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create state dir: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Keys may contain `:` and `/`; file names may not.
    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| match c {
                ':' | '/' | '\\' => '_',
                c => c,
            })
            .collect();
        self.dir.join(format!("{}.json", name))
    }

    fn write_entry(&self, entry: &StoredEntry) -> anyhow::Result<()> {
        let path = self.path_for(&entry.key);
        let content =
            serde_json::to_string_pretty(entry).context("Failed to serialize state entry")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write state file: {}", path.display()))?;
        Ok(())
    }

    fn read_entry(&self, key: &str) -> anyhow::Result<Option<StoredEntry>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;
        let entry = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))?;
        Ok(Some(entry))
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn set_state(
        &self,
        key: &str,
        value: Value,
        kind: StateKind,
        metadata: Option<Value>,
    ) -> Result<(), ServiceError> {
        let entry = StoredEntry {
            key: key.to_string(),
            kind,
            value,
            metadata,
            updated_at: Utc::now(),
        };
        self.write_entry(&entry)?;
        Ok(())
    }

    async fn get_state(&self, key: &str) -> Result<Option<Value>, ServiceError> {
        Ok(self.read_entry(key)?.map(|e| e.value))
    }
}
