//! Durable key-value storage behind the offline queue.
//!
//! `FileStore` keeps one JSON file per key in the data directory;
//! `MemoryStore` is the in-process variant used for ephemeral runs and tests.
//! Both can be given a byte capacity, past which writes fail with
//! `StorageError::QuotaExceeded`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage quota exceeded: {needed} bytes needed, {capacity} available")]
    QuotaExceeded { needed: usize, capacity: usize },

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub fn is_quota(&self) -> bool {
        matches!(self, StorageError::QuotaExceeded { .. })
    }
}

pub trait KeyValueStore: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
}

pub struct FileStore {
    dir: PathBuf,
    capacity: Option<usize>,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, capacity: None })
    }

    /// Refuse single values larger than `bytes`
    pub fn with_capacity(mut self, bytes: usize) -> Self {
        self.capacity = Some(bytes);
        self
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl KeyValueStore for FileStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(path)?))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        if let Some(capacity) = self.capacity {
            if value.len() > capacity {
                return Err(StorageError::QuotaExceeded {
                    needed: value.len(),
                    capacity,
                });
            }
        }

        // Write then rename so a crash never leaves a half-written file
        let path = self.path(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path(key);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// In-memory store. Clones share the same map.
#[derive(Clone, Default)]
pub struct MemoryStore {
    items: Arc<Mutex<HashMap<String, String>>>,
    capacity: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the total size of all stored values to `bytes`
    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            items: Arc::default(),
            capacity: Some(bytes),
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(capacity) = self.capacity {
            let others: usize = items
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.len())
                .sum();
            let needed = others + value.len();
            if needed > capacity {
                return Err(StorageError::QuotaExceeded { needed, capacity });
            }
        }
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path().join("storage")).expect("store");

        assert!(store.get_item("queue").expect("get").is_none());
        store.set_item("queue", "[1,2]").expect("set");
        assert_eq!(store.get_item("queue").expect("get").as_deref(), Some("[1,2]"));

        store.remove_item("queue").expect("remove");
        assert!(store.get_item("queue").expect("get").is_none());
        store.remove_item("queue").expect("remove missing");
    }

    #[test]
    fn test_file_store_quota() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(dir.path().to_path_buf()).expect("store").with_capacity(4);

        let err = store.set_item("queue", "[1,2,3]").expect_err("too big");
        assert!(err.is_quota());
        assert!(store.get_item("queue").expect("get").is_none());
    }

    #[test]
    fn test_memory_store_capacity_counts_other_keys() {
        let store = MemoryStore::with_capacity(10);
        store.set_item("a", "12345").expect("fits");
        store.set_item("a", "1234567890").expect("replacing own value fits");
        store.set_item("a", "12345").expect("shrink");

        let err = store.set_item("b", "123456").expect_err("over capacity");
        assert!(err.is_quota());

        let shared = store.clone();
        assert_eq!(shared.get_item("a").expect("get").as_deref(), Some("12345"));
    }
}
