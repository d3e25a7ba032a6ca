use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error for key '{key}': {message}")]
    Serialization { key: String, message: String },
}

/// Flat key-value store the wallet core reads and writes through.
///
/// Values are opaque bytes; the typed helpers below encode them as JSON so the
/// same records can be inspected or exported by the UI layer.
pub trait Storage: Send + Sync {
    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn set_raw(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
}

impl dyn Storage {
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.get_raw(key)? {
            Some(data) => serde_json::from_slice(&data)
                .map(Some)
                .map_err(|e| StorageError::Serialization {
                    key: key.to_string(),
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let data = serde_json::to_vec(value).map_err(|e| StorageError::Serialization {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        self.set_raw(key, data)
    }
}

/// Volatile storage, used for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let items = self
            .items
            .lock()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(items.get(key).cloned())
    }

    fn set_raw(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let mut items = self
            .items
            .lock()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        items.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let mut items = self
            .items
            .lock()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        items.remove(key);
        Ok(())
    }
}

pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(SledStorage { db })
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| StorageError::Database(e.to_string()))
    }
}

impl Storage for SledStorage {
    fn get_raw(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.db
            .get(key.as_bytes())
            .map(|value| value.map(|v| v.to_vec()))
            .map_err(|e| StorageError::Database(e.to_string()))
    }

    fn set_raw(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.db
            .insert(key.as_bytes(), value)
            .map(|_| ())
            .map_err(|e| StorageError::Database(e.to_string()))
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.db
            .remove(key.as_bytes())
            .map(|_| ())
            .map_err(|e| StorageError::Database(e.to_string()))
    }
}
