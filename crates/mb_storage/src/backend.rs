#![forbid(unsafe_code)]

use mb_kernel_contracts::ContractViolation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageMedium {
    /// Per-origin page storage (`localStorage`).
    PageStorage,
    /// The extension's persistent storage (`chrome.storage.local`).
    ExtensionStorage,
    /// Process-local fallback that lives as long as the context.
    SessionMemory,
    Cookie,
}

impl StorageMedium {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PageStorage => "page_storage",
            Self::ExtensionStorage => "extension_storage",
            Self::SessionMemory => "session_memory",
            Self::Cookie => "cookie",
        }
    }
}

impl std::fmt::Display for StorageMedium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{medium} is disabled")]
    Disabled { medium: StorageMedium },
    #[error("{medium} quota exceeded writing {key}: {needed} bytes > {limit} bytes")]
    QuotaExceeded {
        medium: StorageMedium,
        key: String,
        needed: usize,
        limit: usize,
    },
    #[error("cookie {name} rejected: {reason}")]
    CookieRejected { name: String, reason: &'static str },
    #[error("{medium} lock poisoned")]
    Poisoned { medium: StorageMedium },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("contract violation: {0}")]
    Contract(#[from] ContractViolation),
}

/// Uniform key/value view over every persistence medium a context can reach.
pub trait KeyValueBackend {
    fn medium(&self) -> StorageMedium;
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&mut self, key: &str) -> Result<(), StorageError>;
}

impl<B: KeyValueBackend + ?Sized> KeyValueBackend for Box<B> {
    fn medium(&self) -> StorageMedium {
        (**self).medium()
    }

    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        (**self).get(key)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        (**self).set(key, value)
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        (**self).remove(key)
    }
}

pub(crate) fn entries_size<'a, I>(entries: I) -> usize
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    entries
        .into_iter()
        .map(|(k, v)| k.len().saturating_add(v.len()))
        .fold(0usize, usize::saturating_add)
}

/// Bytes the store would hold after replacing `key` with `value`.
pub(crate) fn size_after_write(
    current_total: usize,
    existing: Option<&String>,
    key: &str,
    value: &str,
) -> usize {
    let removed = existing.map(|v| key.len() + v.len()).unwrap_or(0);
    current_total
        .saturating_sub(removed)
        .saturating_add(key.len() + value.len())
}
