//! Persistent key/value storage
//!
//! The core only relies on `get`/`put`/`remove`. The storage engine itself must be
//! initialized before use; stores report [`StorageError::Unavailable`]
//! until then.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Storage faults
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    /// The storage subsystem has not been initialized
    #[error("storage not initialized")]
    Unavailable,
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(String),
    /// A stored value has the wrong shape
    #[error("corrupt value for {0}")]
    Corrupt(&'static str),
}

/// Minimal key/value contract of a non-volatile store
pub trait KeyValueStore: Send {
    /// Read a value; `Ok(None)` if the key was never written
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Write a value so that it survives power loss
    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Delete a value; removing an absent key succeeds
    fn remove(&mut self, key: &str) -> Result<(), StorageError>;
}

/// Volatile store for hosts and tests
///
/// Starts uninitialized, like a flash partition before its driver is brought up.
#[derive(Debug, Default)]
pub struct MemoryStore {
    initialized: bool,
    entries: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    /// Create an uninitialized store
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the store up
    pub fn init(&mut self) {
        self.initialized = true;
    }

    /// Create an already initialized store
    pub fn initialized() -> Self {
        Self {
            initialized: true,
            entries: HashMap::new(),
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        if !self.initialized {
            return Err(StorageError::Unavailable);
        }
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        if !self.initialized {
            return Err(StorageError::Unavailable);
        }
        self.entries.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        if !self.initialized {
            return Err(StorageError::Unavailable);
        }
        self.entries.remove(key);
        Ok(())
    }
}

/// Store keeping one file per key in a directory
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) the store directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e.to_string())),
        }
    }

    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        // Write-then-rename so a power cut never leaves a torn value
        let tmp = self.dir.join(format!(".{}.tmp", key));
        fs::write(&tmp, value).map_err(|e| StorageError::Io(e.to_string()))?;
        fs::rename(&tmp, self.path(key)).map_err(|e| StorageError::Io(e.to_string()))
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_requires_init() {
        let mut store = MemoryStore::new();
        assert_eq!(store.get("devEui"), Err(StorageError::Unavailable));
        assert_eq!(store.put("devEui", &[1]), Err(StorageError::Unavailable));

        store.init();
        assert_eq!(store.get("devEui"), Ok(None));
        store.put("devEui", &[1, 2]).unwrap();
        assert_eq!(store.get("devEui"), Ok(Some(vec![1, 2])));
        store.remove("devEui").unwrap();
        store.remove("devEui").unwrap();
        assert_eq!(store.get("devEui"), Ok(None));
    }

    #[test]
    fn file_store_round_trips_across_reopen() {
        let dir = std::env::temp_dir().join(format!("lorawan-node-store-{}", std::process::id()));
        {
            let mut store = FileStore::open(&dir).unwrap();
            assert_eq!(store.get("appKey"), Ok(None));
            store.put("appKey", &[7; 16]).unwrap();
        }
        let mut store = FileStore::open(&dir).unwrap();
        assert_eq!(store.get("appKey"), Ok(Some(vec![7; 16])));
        store.remove("appKey").unwrap();
        assert_eq!(store.get("appKey"), Ok(None));
        assert_eq!(store.remove("appKey"), Ok(()));
        let _ = fs::remove_dir_all(&dir);
    }
}
