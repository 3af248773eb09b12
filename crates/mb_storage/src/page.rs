#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::{entries_size, size_after_write, KeyValueBackend, StorageError, StorageMedium};
use crate::cookie::CookieJar;

/// Per-origin quota browsers apply to `localStorage`.
pub const PAGE_STORAGE_QUOTA_BYTES: usize = 5 * 1024 * 1024;

type OriginAreas = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Default)]
struct ProfileState {
    areas: OriginAreas,
    page_storage_disabled: bool,
}

/// One browser profile: every origin's page storage plus the cookie jar. Pages opened on
/// the same origin see the same page storage; other origins and the extension do not.
#[derive(Debug, Clone, Default)]
pub struct BrowserProfile {
    state: Arc<Mutex<ProfileState>>,
    cookies: CookieJar,
}

impl BrowserProfile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page_storage(&self, origin: &str) -> PageStorage {
        PageStorage {
            origin: normalize_origin(origin),
            state: self.state.clone(),
            quota_bytes: PAGE_STORAGE_QUOTA_BYTES,
        }
    }

    pub fn cookies(&self) -> CookieJar {
        self.cookies.clone()
    }

    pub fn set_page_storage_disabled(&self, disabled: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.page_storage_disabled = disabled;
        }
    }

    pub fn clear_origin(&self, origin: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.areas.remove(&normalize_origin(origin));
        }
    }
}

fn normalize_origin(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

/// `localStorage` for one origin of a [`BrowserProfile`].
#[derive(Debug, Clone)]
pub struct PageStorage {
    origin: String,
    state: Arc<Mutex<ProfileState>>,
    quota_bytes: usize,
}

impl PageStorage {
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn with_quota(mut self, quota_bytes: usize) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, ProfileState>, StorageError> {
        let state = self.state.lock().map_err(|_| StorageError::Poisoned {
            medium: StorageMedium::PageStorage,
        })?;
        if state.page_storage_disabled {
            return Err(StorageError::Disabled {
                medium: StorageMedium::PageStorage,
            });
        }
        Ok(state)
    }
}

impl KeyValueBackend for PageStorage {
    fn medium(&self) -> StorageMedium {
        StorageMedium::PageStorage
    }

    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let state = self.lock()?;
        Ok(state
            .areas
            .get(&self.origin)
            .and_then(|area| area.get(key))
            .cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        let area = state.areas.entry(self.origin.clone()).or_default();
        let needed = size_after_write(entries_size(area.iter()), area.get(key), key, value);
        if needed > self.quota_bytes {
            return Err(StorageError::QuotaExceeded {
                medium: StorageMedium::PageStorage,
                key: key.to_string(),
                needed,
                limit: self.quota_bytes,
            });
        }
        area.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        if let Some(area) = state.areas.get_mut(&self.origin) {
            area.remove(key);
        }
        Ok(())
    }
}
