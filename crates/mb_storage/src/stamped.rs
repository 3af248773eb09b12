#![forbid(unsafe_code)]

use mb_kernel_contracts::UnixTimeMs;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::{KeyValueBackend, StorageError};

/// A persisted value together with the time it was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamped<T> {
    pub value: T,
    pub written_at: UnixTimeMs,
}

impl<T> Stamped<T> {
    pub fn age_ms(&self, now: UnixTimeMs) -> u64 {
        now.elapsed_since(self.written_at)
    }
}

/// Reads `key` as a stamped JSON value.
///
/// Unreadable media and values that fail to deserialize (corrupt or from an older schema)
/// are logged and reported as absent.
pub fn read_stamped<T, B>(backend: &B, key: &str) -> Option<Stamped<T>>
where
    T: DeserializeOwned,
    B: KeyValueBackend + ?Sized,
{
    let raw = match backend.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(err) => {
            warn!(medium = %backend.medium(), key, error = %err, "storage read failed");
            return None;
        }
    };
    match serde_json::from_str::<Stamped<T>>(&raw) {
        Ok(stamped) => Some(stamped),
        Err(err) => {
            warn!(medium = %backend.medium(), key, error = %err, "discarding malformed stored value");
            None
        }
    }
}

pub fn write_stamped<T, B>(
    backend: &mut B,
    key: &str,
    value: &T,
    now: UnixTimeMs,
) -> Result<(), StorageError>
where
    T: Serialize,
    B: KeyValueBackend + ?Sized,
{
    let raw = serde_json::to_string(&Stamped {
        value,
        written_at: now,
    })?;
    backend.set(key, &raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::StorageMedium;
    use crate::memory::MemoryBackend;

    #[test]
    fn at_stamped_01_roundtrip_keeps_timestamp() {
        let mut store = MemoryBackend::session();
        write_stamped(&mut store, "k", &"user_web_1_a_b".to_string(), UnixTimeMs(77)).unwrap();
        let got: Stamped<String> = read_stamped(&store, "k").unwrap();
        assert_eq!(got.value, "user_web_1_a_b");
        assert_eq!(got.written_at, UnixTimeMs(77));
        assert_eq!(got.age_ms(UnixTimeMs(100)), 23);
    }

    #[test]
    fn at_stamped_02_corrupt_json_reads_as_absent() {
        let mut store = MemoryBackend::session();
        store.set("k", "{\"value\": tru").unwrap();
        assert!(read_stamped::<bool, _>(&store, "k").is_none());
        store.set("k", "\"raw legacy string\"").unwrap();
        assert!(read_stamped::<String, _>(&store, "k").is_none());
    }

    #[test]
    fn at_stamped_03_unreadable_medium_reads_as_absent() {
        let store = MemoryBackend::disabled(StorageMedium::PageStorage);
        assert!(read_stamped::<String, _>(&store, "k").is_none());
    }

    #[test]
    fn at_stamped_04_works_through_trait_objects() {
        let mut boxed: Box<dyn KeyValueBackend + Send> = Box::new(MemoryBackend::session());
        write_stamped(boxed.as_mut(), "k", &5u32, UnixTimeMs(1)).unwrap();
        let got: Stamped<u32> = read_stamped(boxed.as_ref(), "k").unwrap();
        assert_eq!(got.value, 5);
    }
}
