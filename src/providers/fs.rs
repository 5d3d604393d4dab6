use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{HistoryStore, StoreError};
use crate::Event;

/// Filesystem-backed history store writing JSONL per instance.
///
/// Layout: `<root>/<instance>/history.jsonl` (one event per line, appended)
/// and `<root>/<instance>/status.json` for the custom-status record. Survives
/// process restarts; intended for local development and recovery tests.
pub struct FsHistoryStore {
    root: PathBuf,
    // Serializes appends; per-instance granularity is not worth it for a
    // local development store.
    write_lock: Mutex<()>,
}

impl FsHistoryStore {
    /// Create a new store rooted at the given directory path.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        let _ = std::fs::create_dir_all(&path);
        Self {
            root: path,
            write_lock: Mutex::new(()),
        }
    }

    fn inst_root(&self, instance: &str) -> PathBuf {
        self.root.join(instance)
    }

    fn history_path(&self, instance: &str) -> PathBuf {
        self.inst_root(instance).join("history.jsonl")
    }

    fn status_path(&self, instance: &str) -> PathBuf {
        self.inst_root(instance).join("status.json")
    }

    async fn read_events(&self, instance: &str) -> Result<Vec<Event>, StoreError> {
        if !self.inst_root(instance).exists() {
            return Err(StoreError::NotFound(instance.to_string()));
        }
        let data = tokio::fs::read_to_string(self.history_path(instance))
            .await
            .unwrap_or_default();
        let mut out = Vec::new();
        for line in data.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let ev = serde_json::from_str::<Event>(line)
                .map_err(|e| StoreError::Unavailable(format!("corrupt history line: {e}")))?;
            out.push(ev);
        }
        Ok(out)
    }
}

#[async_trait]
impl HistoryStore for FsHistoryStore {
    async fn create_instance(&self, instance: &str) -> Result<(), StoreError> {
        let _g = self.write_lock.lock().await;
        let dir = self.inst_root(instance);
        if dir.exists() {
            return Err(StoreError::AlreadyExists(instance.to_string()));
        }
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        tokio::fs::File::create(self.history_path(instance))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn append(&self, instance: &str, event: Event) -> Result<u64, StoreError> {
        let _g = self.write_lock.lock().await;
        let existing = self.read_events(instance).await?;
        let id = existing.last().map(|e| e.event_id()).unwrap_or(0) + 1;
        let event = event.with_event_id(id);
        let line = serde_json::to_string(&event)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(self.history_path(instance))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        file.write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(id)
    }

    async fn read_all(&self, instance: &str) -> Result<Vec<Event>, StoreError> {
        self.read_events(instance).await
    }

    async fn set_custom_status(
        &self,
        instance: &str,
        status: Option<String>,
    ) -> Result<(), StoreError> {
        let _g = self.write_lock.lock().await;
        if !self.inst_root(instance).exists() {
            return Err(StoreError::NotFound(instance.to_string()));
        }
        let path = self.status_path(instance);
        match status {
            Some(s) => {
                let body = serde_json::to_string(&s)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
                tokio::fs::write(&path, body)
                    .await
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            }
            None => {
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
        Ok(())
    }

    async fn get_custom_status(&self, instance: &str) -> Result<Option<String>, StoreError> {
        if !self.inst_root(instance).exists() {
            return Err(StoreError::NotFound(instance.to_string()));
        }
        match tokio::fs::read_to_string(self.status_path(instance)).await {
            Ok(body) => serde_json::from_str(&body)
                .map(Some)
                .map_err(|e| StoreError::Unavailable(format!("corrupt status record: {e}"))),
            Err(_) => Ok(None),
        }
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Ok(mut entries) = tokio::fs::read_dir(&self.root).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.path().is_dir() {
                    if let Some(name) = entry.file_name().to_str() {
                        out.push(name.to_string());
                    }
                }
            }
        }
        out
    }

    async fn reset(&self) {
        let _g = self.write_lock.lock().await;
        let _ = tokio::fs::remove_dir_all(&self.root).await;
        let _ = tokio::fs::create_dir_all(&self.root).await;
    }
}
