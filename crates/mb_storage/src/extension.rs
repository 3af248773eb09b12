#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::{entries_size, size_after_write, KeyValueBackend, StorageError, StorageMedium};

const EXTENSION_STORAGE_SCHEMA_VERSION: u8 = 1;
/// `chrome.storage.local` default quota.
pub const EXTENSION_STORAGE_QUOTA_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExtensionStorageDocument {
    schema_version: u8,
    entries: BTreeMap<String, String>,
}

impl Default for ExtensionStorageDocument {
    fn default() -> Self {
        Self {
            schema_version: EXTENSION_STORAGE_SCHEMA_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

/// The extension's persistent key/value storage, kept as one JSON document on disk and
/// replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct ExtensionStorage {
    path: PathBuf,
    quota_bytes: usize,
}

impl ExtensionStorage {
    pub fn default_local() -> Self {
        let path = env::var("MB_EXTENSION_STORAGE_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_storage_path);
        Self::for_path(path)
    }

    pub fn for_path(path: PathBuf) -> Self {
        Self {
            path,
            quota_bytes: EXTENSION_STORAGE_QUOTA_BYTES,
        }
    }

    pub fn with_quota(mut self, quota_bytes: usize) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A document that does not parse, or carries another schema version, reads as empty;
    /// the next write replaces it.
    fn read_document(&self) -> Result<ExtensionStorageDocument, StorageError> {
        if !self.path.exists() {
            return Ok(ExtensionStorageDocument::default());
        }
        let raw = fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(ExtensionStorageDocument::default());
        }
        match serde_json::from_str::<ExtensionStorageDocument>(&raw) {
            Ok(doc) if doc.schema_version == EXTENSION_STORAGE_SCHEMA_VERSION => Ok(doc),
            Ok(doc) => {
                warn!(
                    path = %self.path.display(),
                    found = doc.schema_version,
                    "extension storage schema unsupported, treating as empty"
                );
                Ok(ExtensionStorageDocument::default())
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "extension storage unreadable, treating as empty");
                Ok(ExtensionStorageDocument::default())
            }
        }
    }

    fn write_document(&self, doc: &ExtensionStorageDocument) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_vec_pretty(doc)?;
        atomic_write(&self.path, &serialized)?;
        Ok(())
    }
}

impl KeyValueBackend for ExtensionStorage {
    fn medium(&self) -> StorageMedium {
        StorageMedium::ExtensionStorage
    }

    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.read_document()?.entries.remove(key))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut doc = self.read_document()?;
        let needed = size_after_write(
            entries_size(doc.entries.iter()),
            doc.entries.get(key),
            key,
            value,
        );
        if needed > self.quota_bytes {
            return Err(StorageError::QuotaExceeded {
                medium: StorageMedium::ExtensionStorage,
                key: key.to_string(),
                needed,
                limit: self.quota_bytes,
            });
        }
        doc.entries.insert(key.to_string(), value.to_string());
        self.write_document(&doc)
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        let mut doc = self.read_document()?;
        if doc.entries.remove(key).is_some() {
            self.write_document(&doc)?;
        }
        Ok(())
    }
}

fn default_storage_path() -> PathBuf {
    if let Ok(xdg_config_home) = env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg_config_home)
            .join("monkeyblock")
            .join("extension_storage.json");
    }
    if let Ok(home) = env::var("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("monkeyblock")
            .join("extension_storage.json");
    }
    PathBuf::from(".monkeyblock").join("extension_storage.json")
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");
    fs::write(&tmp, data)?;
    fs::rename(tmp, path)?;
    Ok(())
}
