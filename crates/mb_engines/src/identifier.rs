#![forbid(unsafe_code)]

use mb_kernel_contracts::fingerprint::DeviceFingerprint;
use mb_kernel_contracts::identity::{IdentifierSource, UserIdentifier};
use mb_kernel_contracts::{storage_keys, UnixTimeMs};
use mb_storage::{KeyValueBackend, StorageError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

const RANDOM_SUFFIX_LEN: usize = 9;
const BASE36_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierOrigin {
    /// A well-formed identifier was already persisted.
    Stored,
    /// Freshly minted; `persisted` is false when the medium refused the write and the id
    /// only lives as long as this context.
    Minted { persisted: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierResolution {
    pub user_id: UserIdentifier,
    pub origin: IdentifierOrigin,
}

/// Mints and persists the per-context user identifier and the device id.
pub struct IdentifierStore<R: Rng = StdRng> {
    source: IdentifierSource,
    rng: R,
}

impl IdentifierStore<StdRng> {
    pub fn new(source: IdentifierSource) -> Self {
        Self::with_rng(source, StdRng::from_entropy())
    }
}

impl<R: Rng> IdentifierStore<R> {
    pub fn with_rng(source: IdentifierSource, rng: R) -> Self {
        Self { source, rng }
    }

    pub fn source(&self) -> IdentifierSource {
        self.source
    }

    /// Returns the persisted identifier, minting and persisting one if absent.
    /// Idempotent while the backend keeps its data.
    pub fn get_or_create<B>(
        &mut self,
        backend: &mut B,
        fingerprint: &DeviceFingerprint,
        now: UnixTimeMs,
    ) -> UserIdentifier
    where
        B: KeyValueBackend + ?Sized,
    {
        self.resolve(backend, fingerprint, now).user_id
    }

    pub fn resolve<B>(
        &mut self,
        backend: &mut B,
        fingerprint: &DeviceFingerprint,
        now: UnixTimeMs,
    ) -> IdentifierResolution
    where
        B: KeyValueBackend + ?Sized,
    {
        if let Some(user_id) = load_user_id(backend) {
            return IdentifierResolution {
                user_id,
                origin: IdentifierOrigin::Stored,
            };
        }
        let user_id = self.mint(Some(fingerprint), now);
        let persisted = match backend.set(storage_keys::USER_ID, user_id.as_str()) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    medium = %backend.medium(),
                    error = %err,
                    "user id not persisted, continuing with session-only identifier"
                );
                false
            }
        };
        info!(user_id = %user_id, persisted, "minted user identifier");
        IdentifierResolution {
            user_id,
            origin: IdentifierOrigin::Minted { persisted },
        }
    }

    pub fn mint(&mut self, fingerprint: Option<&DeviceFingerprint>, now: UnixTimeMs) -> UserIdentifier {
        let suffix = random_suffix(&mut self.rng);
        UserIdentifier::mint(self.source, now, fingerprint, &suffix)
    }

    /// Returns the persisted device id, persisting `local` when none is stored.
    pub fn get_or_create_device_id<B>(
        &mut self,
        backend: &mut B,
        local: &DeviceFingerprint,
    ) -> DeviceFingerprint
    where
        B: KeyValueBackend + ?Sized,
    {
        if let Some(stored) = load_device_id(backend) {
            return stored;
        }
        if let Err(err) = backend.set(storage_keys::DEVICE_ID, local.as_str()) {
            warn!(medium = %backend.medium(), error = %err, "device id not persisted");
        }
        local.clone()
    }

    /// Replaces the persisted identifiers with ones recovered from another context.
    pub fn adopt<B>(
        &mut self,
        backend: &mut B,
        user_id: &UserIdentifier,
        device_id: &DeviceFingerprint,
    ) -> Result<(), StorageError>
    where
        B: KeyValueBackend + ?Sized,
    {
        backend.set(storage_keys::USER_ID, user_id.as_str())?;
        backend.set(storage_keys::DEVICE_ID, device_id.as_str())?;
        debug!(user_id = %user_id, device_id = %device_id, "adopted recovered identifiers");
        Ok(())
    }
}

/// Reads the persisted user identifier; malformed values are treated as absent.
pub fn load_user_id<B>(backend: &B) -> Option<UserIdentifier>
where
    B: KeyValueBackend + ?Sized,
{
    let raw = read_raw(backend, storage_keys::USER_ID)?;
    match UserIdentifier::parse(raw) {
        Ok(id) => Some(id),
        Err(err) => {
            warn!(medium = %backend.medium(), error = %err, "ignoring malformed stored user id");
            None
        }
    }
}

pub fn load_device_id<B>(backend: &B) -> Option<DeviceFingerprint>
where
    B: KeyValueBackend + ?Sized,
{
    let raw = read_raw(backend, storage_keys::DEVICE_ID)?;
    DeviceFingerprint::parse(raw).ok()
}

fn read_raw<B>(backend: &B, key: &str) -> Option<String>
where
    B: KeyValueBackend + ?Sized,
{
    match backend.get(key) {
        Ok(value) => value,
        Err(err) => {
            warn!(medium = %backend.medium(), key, error = %err, "storage read failed");
            None
        }
    }
}

fn random_suffix<R: Rng>(rng: &mut R) -> String {
    (0..RANDOM_SUFFIX_LEN)
        .map(|_| char::from(BASE36_ALPHABET[rng.gen_range(0..BASE36_ALPHABET.len())]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mb_storage::{MemoryBackend, StorageMedium};

    fn store() -> IdentifierStore<StdRng> {
        IdentifierStore::with_rng(IdentifierSource::Web, StdRng::seed_from_u64(7))
    }

    fn fp() -> DeviceFingerprint {
        DeviceFingerprint::parse("fp_1a2b3c4d5e_9z").unwrap()
    }

    #[test]
    fn at_id_01_get_or_create_is_idempotent() {
        let mut backend = MemoryBackend::acting_as(StorageMedium::PageStorage);
        let mut ids = store();
        let first = ids.resolve(&mut backend, &fp(), UnixTimeMs(1_712_000_000_000));
        assert_eq!(first.origin, IdentifierOrigin::Minted { persisted: true });
        let second = ids.resolve(&mut backend, &fp(), UnixTimeMs(1_712_000_009_999));
        assert_eq!(second.origin, IdentifierOrigin::Stored);
        assert_eq!(first.user_id, second.user_id);
    }

    #[test]
    fn at_id_02_minted_identifier_has_expected_shape() {
        let mut ids = store();
        let id = ids.mint(Some(&fp()), UnixTimeMs(1_712_000_000_000));
        let parts = id.components();
        assert_eq!(parts.source, "web");
        assert_eq!(parts.minted_at, Some(UnixTimeMs(1_712_000_000_000)));
        assert_eq!(parts.fingerprint_fragment, "1a2b3c4d");
        assert_eq!(parts.random.len(), 9);
        assert!(parts
            .random
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
    }

    #[test]
    fn at_id_03_unwritable_medium_yields_session_only_identifier() {
        let mut backend = MemoryBackend::disabled(StorageMedium::PageStorage);
        let mut ids = store();
        let got = ids.resolve(&mut backend, &fp(), UnixTimeMs(5));
        assert_eq!(got.origin, IdentifierOrigin::Minted { persisted: false });
        assert!(got.user_id.as_str().starts_with("user_web_5_"));
    }

    #[test]
    fn at_id_04_malformed_stored_id_is_replaced() {
        let mut backend = MemoryBackend::session();
        backend.set(storage_keys::USER_ID, "garbage").unwrap();
        let mut ids = store();
        let got = ids.resolve(&mut backend, &fp(), UnixTimeMs(5));
        assert!(matches!(got.origin, IdentifierOrigin::Minted { .. }));
        assert_eq!(
            backend.get(storage_keys::USER_ID).unwrap().as_deref(),
            Some(got.user_id.as_str())
        );
    }

    #[test]
    fn at_id_05_stored_device_id_wins_over_local_fingerprint() {
        let mut backend = MemoryBackend::session();
        let mut ids = store();
        let original = fp();
        assert_eq!(ids.get_or_create_device_id(&mut backend, &original), original);
        let drifted = DeviceFingerprint::parse("fp_other_value").unwrap();
        assert_eq!(ids.get_or_create_device_id(&mut backend, &drifted), original);
    }

    #[test]
    fn at_id_06_adopt_overwrites_both_identifiers() {
        let mut backend = MemoryBackend::session();
        let mut ids = store();
        ids.get_or_create(&mut backend, &fp(), UnixTimeMs(1));
        let recovered_uid = UserIdentifier::parse("user_web_1700000000000_k2j4h5g6_q8w7e6r5t").unwrap();
        let recovered_did = DeviceFingerprint::parse("fp_k2j4h5g6_zz").unwrap();
        ids.adopt(&mut backend, &recovered_uid, &recovered_did).unwrap();
        assert_eq!(load_user_id(&backend), Some(recovered_uid));
        assert_eq!(load_device_id(&backend), Some(recovered_did));
    }

    #[test]
    fn at_id_07_suffixes_differ_between_mints() {
        let mut ids = store();
        let a = ids.mint(None, UnixTimeMs(1));
        let b = ids.mint(None, UnixTimeMs(1));
        assert_ne!(a, b);
    }
}
