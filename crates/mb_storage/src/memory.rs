#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use crate::backend::{entries_size, size_after_write, KeyValueBackend, StorageError, StorageMedium};

/// In-memory store. Used as the session-only fallback when persistent media refuse writes,
/// and as a stand-in for any medium in tests.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    medium: StorageMedium,
    entries: BTreeMap<String, String>,
    quota_bytes: Option<usize>,
    disabled: bool,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::session()
    }
}

impl MemoryBackend {
    pub fn session() -> Self {
        Self::acting_as(StorageMedium::SessionMemory)
    }

    /// An in-memory store that reports itself as another medium.
    pub fn acting_as(medium: StorageMedium) -> Self {
        Self {
            medium,
            entries: BTreeMap::new(),
            quota_bytes: None,
            disabled: false,
        }
    }

    pub fn with_quota(mut self, quota_bytes: usize) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    /// Every read and write fails, like storage disabled by browser policy.
    pub fn disabled(medium: StorageMedium) -> Self {
        Self {
            disabled: true,
            ..Self::acting_as(medium)
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    fn ensure_enabled(&self) -> Result<(), StorageError> {
        if self.disabled {
            return Err(StorageError::Disabled {
                medium: self.medium,
            });
        }
        Ok(())
    }
}

impl KeyValueBackend for MemoryBackend {
    fn medium(&self) -> StorageMedium {
        self.medium
    }

    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.ensure_enabled()?;
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.ensure_enabled()?;
        if let Some(limit) = self.quota_bytes {
            let needed = size_after_write(
                entries_size(&self.entries),
                self.entries.get(key),
                key,
                value,
            );
            if needed > limit {
                return Err(StorageError::QuotaExceeded {
                    medium: self.medium,
                    key: key.to_string(),
                    needed,
                    limit,
                });
            }
        }
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        self.ensure_enabled()?;
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_mem_01_set_get_remove() {
        let mut store = MemoryBackend::session();
        assert_eq!(store.get("a").unwrap(), None);
        store.set("a", "1").unwrap();
        store.set("a", "2").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("2"));
        store.remove("a").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn at_mem_02_quota_counts_replacement_not_sum() {
        let mut store = MemoryBackend::session().with_quota(10);
        store.set("k", "12345").unwrap();
        store.set("k", "123456789").unwrap();
        let err = store.set("k2", "x").unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { needed: 13, limit: 10, .. }));
        assert_eq!(store.get("k").unwrap().as_deref(), Some("123456789"));
    }

    #[test]
    fn at_mem_03_disabled_store_refuses_everything() {
        let mut store = MemoryBackend::disabled(StorageMedium::PageStorage);
        assert_eq!(store.medium(), StorageMedium::PageStorage);
        assert!(matches!(store.get("a"), Err(StorageError::Disabled { .. })));
        assert!(matches!(store.set("a", "b"), Err(StorageError::Disabled { .. })));
    }
}
