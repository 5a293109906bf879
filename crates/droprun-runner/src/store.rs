//! Key-value persistence for task configuration and outcomes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use droprun_core::{TaskId, TaskRecord};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Opaque record store keyed by task id.
pub trait TaskStore: Send + Sync {
    fn get(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, StoreError>;

    fn put(&self, task_id: &TaskId, record: &TaskRecord) -> Result<(), StoreError>;

    fn remove(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// All stored task ids, sorted.
    fn keys(&self) -> Result<Vec<TaskId>, StoreError>;
}

/// In-process store. Records are kept serialized so a record read back is
/// always a copy of what was written.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<TaskId, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskStore for MemoryStore {
    fn get(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        records
            .get(task_id)
            .map(|raw| serde_json::from_str(raw))
            .transpose()
            .map_err(StoreError::from)
    }

    fn put(&self, task_id: &TaskId, record: &TaskRecord) -> Result<(), StoreError> {
        let raw = serde_json::to_string(record)?;
        let mut records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        records.insert(task_id.clone(), raw);
        Ok(())
    }

    fn remove(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let removed = {
            let mut records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
            records.remove(task_id)
        };
        removed
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(StoreError::from)
    }

    fn keys(&self) -> Result<Vec<TaskId>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        let mut keys: Vec<TaskId> = records.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// One JSON file per task under a directory.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, task_id: &TaskId) -> PathBuf {
        let name: String = task_id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }

    fn read(path: &Path) -> Result<Option<TaskRecord>, StoreError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl TaskStore for JsonFileStore {
    fn get(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Self::read(&self.path_for(task_id))
    }

    fn put(&self, task_id: &TaskId, record: &TaskRecord) -> Result<(), StoreError> {
        let raw = serde_json::to_string_pretty(record)?;
        let path = self.path_for(task_id);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let path = self.path_for(task_id);
        let record = Self::read(&path)?;
        if record.is_some() {
            std::fs::remove_file(&path)?;
        }
        Ok(record)
    }

    fn keys(&self) -> Result<Vec<TaskId>, StoreError> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = Self::read(&path)? {
                keys.push(record.task.id);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use droprun_core::{ProductSelector, SiteDescriptor, Task, TaskState};

    fn record(id: &str) -> TaskRecord {
        let task = Task::new(
            "simulated",
            SiteDescriptor {
                name: "Shop".to_string(),
                url: "https://shop.test".to_string(),
                site_key: None,
            },
            ProductSelector::Url {
                url: "https://shop.test/p/1".to_string(),
            },
            "main",
        )
        .with_id(TaskId::new(id));
        TaskRecord::new(task)
    }

    fn exercise(store: &dyn TaskStore) {
        let a = record("task-a");
        let id = a.task.id.clone();
        assert!(store.get(&id).unwrap().is_none());

        store.put(&id, &a).unwrap();
        store.put(&TaskId::new("task-b"), &record("task-b")).unwrap();
        assert_eq!(store.get(&id).unwrap().unwrap().task.id, id);
        assert_eq!(
            store.keys().unwrap(),
            vec![TaskId::new("task-a"), TaskId::new("task-b")]
        );

        let mut updated = a.clone();
        updated.update(TaskState::Errored, Some("proxy pool exhausted".to_string()));
        store.put(&id, &updated).unwrap();
        let read = store.get(&id).unwrap().unwrap();
        assert_eq!(read.last_state, TaskState::Errored);
        assert_eq!(read.reason.as_deref(), Some("proxy pool exhausted"));

        assert!(store.remove(&id).unwrap().is_some());
        assert!(store.remove(&id).unwrap().is_none());
        assert_eq!(store.keys().unwrap(), vec![TaskId::new("task-b")]);
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_json_file_store() {
        let dir = std::env::temp_dir().join(format!(
            "droprun-store-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        let store = JsonFileStore::open(&dir).unwrap();
        exercise(&store);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
