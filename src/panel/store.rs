use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access {path}: {error}")]
    Io {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },
    #[error("failed to decode {path}: {error}")]
    Json {
        path: PathBuf,
        #[source]
        error: serde_json::Error,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Persistent integer preferences keyed by name.
pub trait KeyValueStore: Send {
    fn load(&self, key: &str) -> Result<Option<i64>, StoreError>;
    fn save(&self, key: &str, value: i64) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, i64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(key: impl Into<String>, value: i64) -> Self {
        let store = Self::default();
        store
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value);
        store
    }
}

impl KeyValueStore for MemoryStore {
    fn load(&self, key: &str) -> Result<Option<i64>, StoreError> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied())
    }

    fn save(&self, key: &str, value: i64) -> Result<(), StoreError> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value);
        Ok(())
    }
}

/// A JSON object of key to integer on disk. Every save rewrites the whole
/// file.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_all(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BTreeMap::new())
            }
            Err(error) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    error,
                })
            }
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw).map_err(|error| StoreError::Json {
            path: self.path.clone(),
            error,
        })
    }
}

impl KeyValueStore for JsonFileStore {
    fn load(&self, key: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.read_all()?.get(key).copied())
    }

    fn save(&self, key: &str, value: i64) -> Result<(), StoreError> {
        let mut values = self.read_all()?;
        values.insert(key.to_owned(), value);
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|error| StoreError::Io {
                    path: parent.to_path_buf(),
                    error,
                })?;
            }
        }
        let body = serde_json::to_string_pretty(&values).map_err(|error| StoreError::Json {
            path: self.path.clone(),
            error,
        })?;
        fs::write(&self.path, body).map_err(|error| StoreError::Io {
            path: self.path.clone(),
            error,
        })
    }
}
