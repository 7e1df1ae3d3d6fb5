use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use percent_encoding::{percent_decode_str, percent_encode, NON_ALPHANUMERIC};

use crate::offline::error::{io_error, quota_exceeded, StorageResult};

/// String-keyed blob store backing the offline cache.
///
/// The interface is synchronous: every call is a single small read or a full-value
/// overwrite, so implementations never need to suspend.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StorageResult<()>;
    fn remove(&self, key: &str) -> StorageResult<()>;
    fn keys(&self) -> StorageResult<Vec<String>>;
}

/// Process-local store with an optional byte quota.
///
/// The quota covers the UTF-8 length of every key and value; a `set` that would exceed it
/// fails with `storage/quota-exceeded` and leaves the store untouched.
#[derive(Clone, Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
    quota_bytes: Option<usize>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: Arc::default(),
            quota_bytes: Some(quota_bytes),
        }
    }

    pub fn used_bytes(&self) -> usize {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .map(|(key, value)| key.len() + value.len())
            .sum()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(quota) = self.quota_bytes {
            let others: usize = entries
                .iter()
                .filter(|(existing, _)| existing.as_str() != key)
                .map(|(existing, stored)| existing.len() + stored.len())
                .sum();
            let required = others + key.len() + value.len();
            if required > quota {
                return Err(quota_exceeded(format!(
                    "Writing '{key}' needs {required} bytes, quota is {quota}"
                )));
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(self.entries.lock().unwrap().keys().cloned().collect())
    }
}

const ENTRY_EXTENSION: &str = "json";
const CACHE_DIR_ENV: &str = "CARE_SYNC_CACHE_DIR";

/// Store that keeps one file per key under a base directory.
#[derive(Clone, Debug)]
pub struct FileKeyValueStore {
    base_dir: Arc<PathBuf>,
}

impl FileKeyValueStore {
    pub fn new(base_dir: PathBuf) -> StorageResult<Self> {
        fs::create_dir_all(&base_dir).map_err(|err| {
            io_error(format!(
                "Failed to create offline cache directory '{}': {}",
                base_dir.display(),
                err
            ))
        })?;
        Ok(Self {
            base_dir: Arc::new(base_dir),
        })
    }

    /// Uses `CARE_SYNC_CACHE_DIR` when set, otherwise `./.care-sync/cache`.
    pub fn from_env() -> StorageResult<Self> {
        if let Ok(dir) = std::env::var(CACHE_DIR_ENV) {
            return Self::new(PathBuf::from(dir));
        }

        let dir = std::env::current_dir()
            .map_err(|err| io_error(format!("Failed to obtain working directory: {}", err)))?
            .join(".care-sync/cache");
        Self::new(dir)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn file_for(&self, key: &str) -> PathBuf {
        let encoded = percent_encode(key.as_bytes(), NON_ALPHANUMERIC).to_string();
        self.base_dir.join(format!("{}.{}", encoded, ENTRY_EXTENSION))
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let path = self.file_for(key);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error(format!(
                "Failed to read offline cache entry '{}': {}",
                path.display(),
                err
            ))),
        }
    }

    fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let path = self.file_for(key);
        fs::write(&path, value).map_err(|err| {
            io_error(format!(
                "Failed to write offline cache entry '{}': {}",
                path.display(),
                err
            ))
        })
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let path = self.file_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error(format!(
                "Failed to delete offline cache entry '{}': {}",
                path.display(),
                err
            ))),
        }
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        let entries = fs::read_dir(self.base_dir.as_path()).map_err(|err| {
            io_error(format!(
                "Failed to list offline cache directory '{}': {}",
                self.base_dir.display(),
                err
            ))
        })?;

        let mut keys = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            keys.push(percent_decode_str(stem).decode_utf8_lossy().into_owned());
        }
        keys.sort();
        Ok(keys)
    }
}
