//! The settings-store collaborator: read/write of one small JSON document.
//!
//! Writers follow read-modify-write with last-writer-wins; only one daemon
//! per machine applies changes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::task;

use crate::errors::{Result, SettingsError};

/// Read and write access to a JSON settings document.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Current document. A missing document reads as `{}`.
    async fn read(&self) -> Result<Value>;

    /// Replace the document.
    async fn write(&self, value: Value) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// File-backed store
// ─────────────────────────────────────────────────────────────────────────────

/// Settings document stored as pretty-printed JSON on disk.
#[derive(Clone, Debug)]
pub struct FileSettingsStore {
    path: PathBuf,
}

impl FileSettingsStore {
    /// Store backed by `path`. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_settings_json(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Ok(Value::Object(Map::default()));
    }
    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(Value::Object(Map::default()));
    }
    Ok(serde_json::from_str(&content)?)
}

fn write_settings_json(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_json::to_string_pretty(value)?;
    std::fs::write(path, content)?;
    Ok(())
}

#[async_trait]
impl SettingsStore for FileSettingsStore {
    async fn read(&self) -> Result<Value> {
        let path = self.path.clone();
        task::spawn_blocking(move || read_settings_json(&path))
            .await
            .map_err(|e| SettingsError::Task(e.to_string()))?
    }

    async fn write(&self, value: Value) -> Result<()> {
        let path = self.path.clone();
        task::spawn_blocking(move || write_settings_json(&path, &value))
            .await
            .map_err(|e| SettingsError::Task(e.to_string()))?
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory store
// ─────────────────────────────────────────────────────────────────────────────

/// Settings document held in memory.
#[derive(Debug)]
pub struct MemorySettingsStore {
    document: Mutex<Value>,
}

impl MemorySettingsStore {
    /// Store starting with `{}`.
    pub fn new() -> Self {
        Self::with_document(Value::Object(Map::default()))
    }

    /// Store starting with `document`.
    pub fn with_document(document: Value) -> Self {
        Self {
            document: Mutex::new(document),
        }
    }

    /// Snapshot of the current document.
    pub fn snapshot(&self) -> Value {
        self.document.lock().clone()
    }
}

impl Default for MemorySettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn read(&self) -> Result<Value> {
        Ok(self.document.lock().clone())
    }

    async fn write(&self, value: Value) -> Result<()> {
        *self.document.lock() = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn file_store_reads_missing_as_empty_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSettingsStore::new(dir.path().join("settings.json"));
        assert_eq!(store.read().await.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn file_store_round_trips_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSettingsStore::new(dir.path().join("nested").join("settings.json"));
        store.write(json!({"vim": true})).await.unwrap();
        assert_eq!(store.read().await.unwrap(), json!({"vim": true}));
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn file_store_rejects_corrupt_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{oops").unwrap();
        let store = FileSettingsStore::new(path);
        assert!(matches!(store.read().await, Err(SettingsError::Json(_))));
    }

    #[tokio::test]
    async fn memory_store_last_writer_wins() {
        let store = MemorySettingsStore::new();
        store.write(json!({"theme": "dark"})).await.unwrap();
        store.write(json!({"theme": "light"})).await.unwrap();
        assert_eq!(store.snapshot(), json!({"theme": "light"}));
    }
}
