use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// A single stored preference value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrefValue {
    Bool(bool),
    Integer(i64),
    String(String),
}

impl PrefValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PrefValue::Bool(value) => Some(*value),
            PrefValue::Integer(value) => Some(*value != 0),
            PrefValue::String(_) => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            PrefValue::Integer(value) => Some(*value),
            PrefValue::String(value) => value.trim().parse().ok(),
            PrefValue::Bool(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PrefValue::String(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to access preferences at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed preferences at {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Key/value preference persistence.
pub trait PreferenceStore {
    /// Returns the stored value for `key`, if any.
    fn get(&self, key: &str) -> Option<PrefValue>;

    /// Stores `value` under `key`, persisting it immediately.
    fn set(&self, key: &str, value: PrefValue) -> Result<(), StorageError>;
}

/// Volatile store for tests and incognito profiles.
#[derive(Debug, Default)]
pub struct InMemoryPreferences {
    values: RefCell<BTreeMap<String, PrefValue>>,
}

impl InMemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for InMemoryPreferences {
    fn get(&self, key: &str) -> Option<PrefValue> {
        self.values.borrow().get(key).cloned()
    }

    fn set(&self, key: &str, value: PrefValue) -> Result<(), StorageError> {
        self.values.borrow_mut().insert(key.to_string(), value);
        Ok(())
    }
}

/// Preferences kept as a flat JSON object on disk.
///
/// The whole file is rewritten on every `set`.
#[derive(Debug)]
pub struct JsonPreferences {
    path: PathBuf,
    values: RefCell<BTreeMap<String, PrefValue>>,
}

impl JsonPreferences {
    /// Opens the store at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let values = match fs::read(&path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StorageError::Format {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no preference file yet");
                BTreeMap::new()
            }
            Err(source) => return Err(StorageError::Io { path, source }),
        };
        Ok(Self {
            path,
            values: RefCell::new(values),
        })
    }

    /// Opens the store, falling back to an empty one if the file is unreadable.
    pub fn open_or_default(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match Self::open(&path) {
            Ok(store) => store,
            Err(err) => {
                warn!(%err, "ignoring unreadable preferences");
                Self {
                    path,
                    values: RefCell::new(BTreeMap::new()),
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(&*self.values.borrow()).map_err(|source| {
            StorageError::Format {
                path: self.path.clone(),
                source,
            }
        })?;
        fs::write(&self.path, json).map_err(|source| StorageError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl PreferenceStore for JsonPreferences {
    fn get(&self, key: &str) -> Option<PrefValue> {
        self.values.borrow().get(key).cloned()
    }

    fn set(&self, key: &str, value: PrefValue) -> Result<(), StorageError> {
        self.values.borrow_mut().insert(key.to_string(), value);
        self.flush()
    }
}
