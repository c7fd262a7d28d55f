//! Durable persistence of credentials and whitelisted state slices.
//!
//! State is stored as one JSON document under a namespaced key
//! (`persist:<namespace>`) in a [`StateStore`]. A missing key means "nothing
//! persisted yet" and loads as [`PersistedState::default`].

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::CredentialPair;

/// Error type for persistence operations.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Slice is not whitelisted for persistence: {0}")]
    NotWhitelisted(String),
}

/// A string key-value store that survives restarts.
pub trait StateStore: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, PersistError>;

    fn set_item(&self, key: &str, value: &str) -> Result<(), PersistError>;

    fn remove_item(&self, key: &str) -> Result<(), PersistError>;
}

/// In-memory store, for tests and for sessions that must not touch disk.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    items: Arc<DashMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, PersistError> {
        Ok(self.items.get(key).map(|value| value.clone()))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), PersistError> {
        self.items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), PersistError> {
        self.items.remove(key);
        Ok(())
    }
}

/// Stores each key as a JSON file inside a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Creates a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Maps a key to its file. Bytes other than ASCII alphanumerics and `-`
    /// are escaped as `_XX`, so distinct keys never share a file.
    fn path_for(&self, key: &str) -> PathBuf {
        let mut file_name = String::with_capacity(key.len());
        for byte in key.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' {
                file_name.push(char::from(byte));
            } else {
                file_name.push_str(&format!("_{byte:02X}"));
            }
        }
        self.dir.join(format!("{file_name}.json"))
    }
}

impl StateStore for FileStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, PersistError> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), PersistError> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.path_for(key), value)?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), PersistError> {
        match std::fs::remove_file(self.path_for(key)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// The persisted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<CredentialPair>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub slices: BTreeMap<String, serde_json::Value>,
}

/// Reads and writes the [`PersistedState`] document of one namespace.
#[derive(Clone)]
pub struct Persistor {
    store: Arc<dyn StateStore>,
    key: String,
    whitelist: Arc<Vec<String>>,
    // Serializes load-modify-save cycles.
    write_lock: Arc<Mutex<()>>,
}

impl Persistor {
    /// Creates a persistor for `namespace` that accepts the given slices.
    pub fn new<I, S>(store: Arc<dyn StateStore>, namespace: &str, whitelist: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            store,
            key: format!("persist:{namespace}"),
            whitelist: Arc::new(whitelist.into_iter().map(Into::into).collect()),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// The namespaced storage key.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_whitelisted(&self, slice: &str) -> bool {
        self.whitelist.iter().any(|name| name == slice)
    }

    /// Loads the persisted document; a missing key yields the default state.
    pub fn load(&self) -> Result<PersistedState, PersistError> {
        match self.store.get_item(&self.key)? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(PersistedState::default()),
        }
    }

    pub fn save(&self, state: &PersistedState) -> Result<(), PersistError> {
        let raw = serde_json::to_string(state)?;
        self.store.set_item(&self.key, &raw)
    }

    /// Applies `f` to the stored document and writes it back.
    pub fn update<F>(&self, f: F) -> Result<(), PersistError>
    where
        F: FnOnce(&mut PersistedState),
    {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut state = match self.load() {
            Ok(state) => state,
            Err(PersistError::Serde(e)) => {
                tracing::warn!(error = %e, key = %self.key, "replacing unreadable persisted state");
                PersistedState::default()
            }
            Err(e) => return Err(e),
        };
        f(&mut state);
        self.save(&state)
    }

    pub fn save_credentials(&self, credentials: Option<&CredentialPair>) -> Result<(), PersistError> {
        self.update(|state| state.credentials = credentials.cloned())
    }

    /// Persists a whitelisted slice.
    pub fn save_slice<T: Serialize>(&self, slice: &str, value: &T) -> Result<(), PersistError> {
        if !self.is_whitelisted(slice) {
            return Err(PersistError::NotWhitelisted(slice.to_string()));
        }
        let value = serde_json::to_value(value)?;
        self.update(|state| {
            state.slices.insert(slice.to_string(), value);
        })
    }

    /// Loads a slice; absent slices are `Ok(None)`.
    pub fn load_slice<T: DeserializeOwned>(&self, slice: &str) -> Result<Option<T>, PersistError> {
        let mut state = self.load()?;
        match state.slices.remove(slice) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Removes the whole persisted document.
    pub fn purge(&self) -> Result<(), PersistError> {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        self.store.remove_item(&self.key)
    }
}

impl std::fmt::Debug for Persistor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistor")
            .field("key", &self.key)
            .field("whitelist", &self.whitelist)
            .finish_non_exhaustive()
    }
}
