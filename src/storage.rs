//! Persistent key-value storage.
//!
//! Values are either a single `f32` or a raw byte record. The file backend
//! keeps the whole map in one JSON document and rewrites it on every change.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entry {
    Float(f32),
    Bytes(Vec<u8>),
}

pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Option<Entry>;

    fn put(&mut self, key: &str, entry: Entry) -> Result<(), StorageError>;

    /// Write several entries as one change.
    fn put_all(&mut self, entries: Vec<(String, Entry)>) -> Result<(), StorageError> {
        for (key, entry) in entries {
            self.put(&key, entry)?;
        }
        Ok(())
    }

    fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    fn get_f32(&self, key: &str) -> Result<f32, StorageError> {
        match self.get(key) {
            Some(Entry::Float(value)) => Ok(value),
            Some(Entry::Bytes(_)) => Err(StorageError::WrongKind(key.to_string())),
            None => Err(StorageError::Missing(key.to_string())),
        }
    }

    fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        match self.get(key) {
            Some(Entry::Bytes(bytes)) => Ok(bytes),
            Some(Entry::Float(_)) => Err(StorageError::WrongKind(key.to_string())),
            None => Err(StorageError::Missing(key.to_string())),
        }
    }
}

/// Store shared between the estimator thread and the command handler.
pub type SharedStore = Arc<Mutex<dyn KeyValueStore>>;

pub fn shared<S: KeyValueStore + 'static>(store: S) -> SharedStore {
    Arc::new(Mutex::new(store))
}

/// Volatile store, used by tests and when the store file cannot be opened.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Entry> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: &str, entry: Entry) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }
}

/// JSON document on disk.
pub struct FileStore {
    path: PathBuf,
    entries: BTreeMap<String, Entry>,
}

impl FileStore {
    /// Open the store at `path`. A missing file starts empty; an unreadable
    /// document is treated as absent and replaced on the next write.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();

        let entries = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(entries) => entries,
                Err(e) => {
                    log::warn!("Store {} is corrupt ({}), starting empty", path.display(), e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No store at {}, starting empty", path.display());
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self { path, entries })
    }

    fn flush(&self) -> Result<(), StorageError> {
        let text = serde_json::to_string_pretty(&self.entries)?;

        // write-then-rename: the document on disk is always complete
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<Entry> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: &str, entry: Entry) -> Result<(), StorageError> {
        self.entries.insert(key.to_string(), entry);
        self.flush()
    }

    fn put_all(&mut self, entries: Vec<(String, Entry)>) -> Result<(), StorageError> {
        self.entries.extend(entries);
        self.flush()
    }
}
