//! Persisted key/value blobs
//!
//! The entitlement context and model preferences each live under one key
//! of a small per-profile JSON document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Key of the persisted [`EntitlementState`](super::types::EntitlementState)
pub const SETUP_CONTEXT_KEY: &str = "chat.setupContext";

/// Key of the persisted per-model visibility overrides
pub const MODEL_PREFERENCES_KEY: &str = "chat.modelPreferences";

/// Storage for small JSON blobs scoped to one profile
pub trait StateStore: Send + Sync {
    /// Read the raw JSON stored under `key`
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Replace the JSON stored under `key`
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`
    fn remove(&self, key: &str) -> Result<()>;
}

/// Read and deserialize a blob, treating unreadable content as absent
pub fn read_object<T, S>(store: &S, key: &str) -> Option<T>
where
    T: serde::de::DeserializeOwned,
    S: StateStore + ?Sized,
{
    match store.get(key) {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("[storage] Ignoring unreadable value for {}: {}", key, e);
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            log::warn!("[storage] Failed to read {}: {}", key, e);
            None
        }
    }
}

/// Serialize and store a blob
pub fn write_object<T, S>(store: &S, key: &str, value: &T) -> Result<()>
where
    T: serde::Serialize,
    S: StateStore + ?Sized,
{
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw)
}

// ============================================================================
// File store
// ============================================================================

/// Get the state file path
///
/// Priority:
/// 1. ENTITLE_STATE_PATH environment variable
/// 2. Platform data directory (`.../Entitle/state.json`)
pub fn get_state_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("ENTITLE_STATE_PATH") {
        return Ok(PathBuf::from(path));
    }

    let dirs = directories::ProjectDirs::from("com", "entitle", "Entitle")
        .ok_or_else(|| Error::config("Could not determine data directory"))?;
    Ok(dirs.data_dir().join("state.json"))
}

/// One JSON document on disk holding every key of the profile
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStateStore {
    /// Open the store at `path`, starting empty when the file is missing
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                let values: BTreeMap<String, serde_json::Value> = serde_json::from_str(&content)?;
                values
                    .into_iter()
                    .map(|(k, v)| (k, v.to_string()))
                    .collect()
            }
        } else {
            BTreeMap::new()
        };

        log::debug!("[storage] Opened state file {:?} ({} keys)", path, entries.len());
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Open the store at the default location
    pub fn open_default() -> Result<Self> {
        Self::open(get_state_path()?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let mut document = serde_json::Map::new();
        for (key, raw) in entries {
            document.insert(key.clone(), serde_json::from_str(raw)?);
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(&serde_json::Value::Object(document))?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| Error::internal("state store lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        // Reject non-JSON early so the document stays readable
        serde_json::from_str::<serde_json::Value>(value)?;

        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::internal("state store lock poisoned"))?;
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::internal("state store lock poisoned"))?;
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }
}

// ============================================================================
// Memory store
// ============================================================================

/// In-memory store for tests and ephemeral profiles
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: Mutex<BTreeMap<String, String>>,
    writes: std::sync::atomic::AtomicUsize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value without counting it as a write
    pub fn with_entry(self, key: &str, value: &str) -> Self {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), value.to_string());
        }
        self
    }

    /// Number of successful `set` calls
    pub fn write_count(&self) -> usize {
        self.writes.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl StateStore for MemoryStateStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| Error::internal("state store lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::internal("state store lock poisoned"))?;
        entries.insert(key.to_string(), value.to_string());
        self.writes
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::internal("state store lock poisoned"))?;
        entries.remove(key);
        Ok(())
    }
}
