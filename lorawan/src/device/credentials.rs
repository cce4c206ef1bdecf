//! Device identity persistence
//!
//! The identity lives in a [`KeyValueStore`] under three keys. A direct join
//! may also hand over an identity that is kept in memory only and never
//! written back.

use parking_lot::{Condvar, Mutex};

use crate::config::device::{AESKey, DeviceIdentity, EUI64};
use crate::error::Error;
use crate::storage::{KeyValueStore, StorageError};

const KEY_DEV_EUI: &str = "devEui";
const KEY_APP_EUI: &str = "appEui";
const KEY_APP_KEY: &str = "appKey";
const KEYS: [&str; 3] = [KEY_DEV_EUI, KEY_APP_EUI, KEY_APP_KEY];

struct Inner {
    storage: Box<dyn KeyValueStore>,
    volatile: Option<DeviceIdentity>,
}

impl Inner {
    fn read<const N: usize>(&self, key: &'static str) -> Result<Option<[u8; N]>, StorageError> {
        match self.storage.get(key)? {
            None => Ok(None),
            Some(bytes) => bytes.as_slice().try_into().map(Some).map_err(|_| StorageError::Corrupt(key)),
        }
    }

    fn load(&self) -> Result<DeviceIdentity, Error> {
        let dev_eui = self.read::<8>(KEY_DEV_EUI)?;
        let app_eui = self.read::<8>(KEY_APP_EUI)?;
        let app_key = self.read::<16>(KEY_APP_KEY)?;
        match (dev_eui, app_eui, app_key) {
            (Some(dev_eui), Some(app_eui), Some(app_key)) => Ok(DeviceIdentity::new(
                EUI64::new(dev_eui),
                EUI64::new(app_eui),
                AESKey::new(app_key),
            )),
            _ => Err(Error::NotProvisioned),
        }
    }

    fn is_complete(&self) -> bool {
        self.volatile.is_some() || self.load().is_ok()
    }

    fn write(&mut self, identity: &DeviceIdentity) -> Result<(), StorageError> {
        self.storage.put(KEY_DEV_EUI, identity.dev_eui.as_bytes())?;
        self.storage.put(KEY_APP_EUI, identity.app_eui.as_bytes())?;
        self.storage.put(KEY_APP_KEY, identity.app_key.as_bytes())
    }

    /// Put back the values seen before a failed write
    fn restore(&mut self, previous: &[Option<Vec<u8>>; 3]) -> Result<(), StorageError> {
        for (key, value) in KEYS.iter().zip(previous) {
            match value {
                Some(value) => self.storage.put(key, value)?,
                None => self.storage.remove(key)?,
            }
        }
        Ok(())
    }
}

/// Persists and retrieves the device identity
pub struct CredentialStore {
    inner: Mutex<Inner>,
    provisioned: Condvar,
}

impl CredentialStore {
    /// Store backed by `storage`
    pub fn new(storage: impl KeyValueStore + 'static) -> Self {
        Self {
            inner: Mutex::new(Inner {
                storage: Box::new(storage),
                volatile: None,
            }),
            provisioned: Condvar::new(),
        }
    }

    /// Persist `identity`, replacing any stored one
    ///
    /// Fails with [`StorageError::Unavailable`] if the storage subsystem has
    /// not been initialized. A failed write leaves the previous identity in
    /// place, or no identity at all if that cannot be put back; never a mix
    /// of old and new values.
    pub fn save(&self, identity: &DeviceIdentity) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let previous = [
            inner.storage.get(KEY_DEV_EUI)?,
            inner.storage.get(KEY_APP_EUI)?,
            inner.storage.get(KEY_APP_KEY)?,
        ];
        if let Err(error) = inner.write(identity) {
            tracing::warn!(%error, "identity write failed, restoring previous identity");
            if let Err(restore) = inner.restore(&previous) {
                tracing::error!(error = %restore, "restore failed, clearing stored identity");
                for key in KEYS {
                    let _ = inner.storage.remove(key);
                }
            }
            return Err(error);
        }
        drop(inner);

        tracing::info!(dev_eui = %identity.dev_eui, app_eui = %identity.app_eui, "identity saved");
        self.provisioned.notify_all();
        Ok(())
    }

    /// Read the stored identity
    ///
    /// A partially stored identity counts as not provisioned.
    pub fn load(&self) -> Result<DeviceIdentity, Error> {
        self.inner.lock().load()
    }

    /// Whether a complete identity is available, stored or in memory
    pub fn is_complete(&self) -> bool {
        self.inner.lock().is_complete()
    }

    /// Hold an identity for this process only (direct join)
    pub fn set_volatile(&self, identity: DeviceIdentity) {
        self.inner.lock().volatile = Some(identity);
        self.provisioned.notify_all();
    }

    /// Identity for a join: the stored one, else the in-memory one
    pub fn join_identity(&self) -> Result<DeviceIdentity, Error> {
        let inner = self.inner.lock();
        match inner.load() {
            Ok(identity) => Ok(identity),
            Err(error) => inner.volatile.ok_or(error),
        }
    }

    /// Block until a complete identity is available
    pub fn wait_for_provisioning(&self) {
        let mut inner = self.inner.lock();
        while !inner.is_complete() {
            self.provisioned.wait(&mut inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::Arc;
    use std::thread;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::from_hex("0011223344556677", "70B3D57ED0000001", "000102030405060708090A0B0C0D0E0F").unwrap()
    }

    #[test]
    fn save_then_load() {
        let store = CredentialStore::new(MemoryStore::initialized());
        assert!(!store.is_complete());
        assert_eq!(store.load(), Err(Error::NotProvisioned));
        store.save(&identity()).unwrap();
        assert!(store.is_complete());
        assert_eq!(store.load().unwrap(), identity());
    }

    #[test]
    fn save_before_storage_init_fails() {
        let store = CredentialStore::new(MemoryStore::new());
        assert_eq!(store.save(&identity()), Err(StorageError::Unavailable));
        assert!(!store.is_complete());
    }

    /// Memory store whose next `failures` writes to one key fail
    struct FailingPut {
        inner: MemoryStore,
        key: &'static str,
        failures: u32,
        fail_remove: bool,
    }

    impl FailingPut {
        fn new(key: &'static str, failures: u32) -> Self {
            Self {
                inner: MemoryStore::initialized(),
                key,
                failures,
                fail_remove: false,
            }
        }
    }

    impl KeyValueStore for FailingPut {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            self.inner.get(key)
        }

        fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
            if key == self.key && self.failures > 0 {
                self.failures -= 1;
                return Err(StorageError::Io("disk full".into()));
            }
            self.inner.put(key, value)
        }

        fn remove(&mut self, key: &str) -> Result<(), StorageError> {
            if self.fail_remove {
                return Err(StorageError::Io("read-only".into()));
            }
            self.inner.remove(key)
        }
    }

    fn other() -> DeviceIdentity {
        DeviceIdentity::from_hex("8899AABBCCDDEEFF", "70B3D57ED0000002", "F0E0D0C0B0A090807060504030201000").unwrap()
    }

    #[test]
    fn failed_save_keeps_previous_identity() {
        let mut storage = FailingPut::new(KEY_APP_KEY, 1);
        storage.inner.put(KEY_DEV_EUI, identity().dev_eui.as_bytes()).unwrap();
        storage.inner.put(KEY_APP_EUI, identity().app_eui.as_bytes()).unwrap();
        storage.inner.put(KEY_APP_KEY, identity().app_key.as_bytes()).unwrap();
        let store = CredentialStore::new(storage);

        assert_eq!(store.save(&other()), Err(StorageError::Io("disk full".into())));
        assert_eq!(store.load().unwrap(), identity());
    }

    #[test]
    fn failed_first_save_leaves_nothing_stored() {
        let store = CredentialStore::new(FailingPut::new(KEY_APP_KEY, 1));
        assert_eq!(store.save(&identity()), Err(StorageError::Io("disk full".into())));
        assert_eq!(store.load(), Err(Error::NotProvisioned));
        assert!(!store.is_complete());
    }

    #[test]
    fn failed_save_never_mixes_identities() {
        let store = CredentialStore::new(FailingPut::new(KEY_APP_EUI, 1));
        store.save(&identity()).unwrap_err();
        assert_eq!(store.load(), Err(Error::NotProvisioned));

        // Nothing can be removed: both EUIs hold the new values and appKey was
        // never written
        let mut storage = FailingPut::new(KEY_APP_KEY, u32::MAX);
        storage.fail_remove = true;
        let store = CredentialStore::new(storage);
        store.save(&other()).unwrap_err();
        assert!(!store.is_complete());
    }

    #[test]
    fn partial_identity_is_not_provisioned() {
        let mut storage = MemoryStore::initialized();
        storage.put(KEY_DEV_EUI, &[1; 8]).unwrap();
        storage.put(KEY_APP_EUI, &[2; 8]).unwrap();
        let store = CredentialStore::new(storage);
        assert_eq!(store.load(), Err(Error::NotProvisioned));
    }

    #[test]
    fn wrong_length_is_corrupt() {
        let mut storage = MemoryStore::initialized();
        storage.put(KEY_DEV_EUI, &[1; 7]).unwrap();
        let store = CredentialStore::new(storage);
        assert_eq!(store.load(), Err(Error::Storage(StorageError::Corrupt(KEY_DEV_EUI))));
    }

    #[test]
    fn volatile_identity_is_not_persisted() {
        let store = CredentialStore::new(MemoryStore::initialized());
        store.set_volatile(identity());
        assert!(store.is_complete());
        assert_eq!(store.load(), Err(Error::NotProvisioned));
        assert_eq!(store.join_identity().unwrap(), identity());
    }

    #[test]
    fn stored_identity_wins_for_join() {
        let store = CredentialStore::new(MemoryStore::initialized());
        let other = DeviceIdentity::from_hex("FFFFFFFFFFFFFFFF", "70B3D57ED0000001", "000102030405060708090A0B0C0D0E0F")
            .unwrap();
        store.set_volatile(other);
        store.save(&identity()).unwrap();
        assert_eq!(store.join_identity().unwrap(), identity());
    }

    #[test]
    fn waiter_wakes_on_save() {
        let store = Arc::new(CredentialStore::new(MemoryStore::initialized()));
        let waiter = {
            let store = Arc::clone(&store);
            thread::spawn(move || store.wait_for_provisioning())
        };
        store.save(&identity()).unwrap();
        waiter.join().unwrap();
        assert!(store.is_complete());
    }
}
