//! Store providers.
//!
//! The orchestrator opens containers by name; a [`StoreProvider`] turns the
//! name into a byte store. Repeated requests for the same name must yield
//! stores over the same underlying bytes, since subfiling opens one
//! container per group and the verifier reopens them all afterwards.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use seismio_storage::{FilesystemStore, MemoryStore, SharedStore, StorageError, StoreKey};

/// A source of byte stores, one per container name.
pub trait StoreProvider: Send + Sync {
    /// The store backing the container `name`.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the store cannot be opened or created.
    fn store(&self, name: &str) -> Result<SharedStore, StorageError>;
}

/// An in-memory provider. Named stores live as long as the provider.
#[derive(Debug, Default)]
pub struct MemoryStoreProvider {
    stores: Mutex<HashMap<String, Arc<MemoryStore>>>,
}

impl MemoryStoreProvider {
    /// Create an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreProvider for MemoryStoreProvider {
    fn store(&self, name: &str) -> Result<SharedStore, StorageError> {
        StoreKey::new(name)?;
        let mut stores = self.stores.lock().unwrap_or_else(|err| err.into_inner());
        let store = stores
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryStore::new()));
        Ok(store.clone())
    }
}

/// A filesystem provider mapping each container name to a subdirectory of a
/// base directory.
#[derive(Debug)]
pub struct FilesystemStoreProvider {
    base_path: PathBuf,
}

impl FilesystemStoreProvider {
    /// Create a provider rooted at `base_path`.
    #[must_use]
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }
}

impl StoreProvider for FilesystemStoreProvider {
    fn store(&self, name: &str) -> Result<SharedStore, StorageError> {
        // Container names obey store key syntax, so they cannot escape the
        // base directory.
        StoreKey::new(name)?;
        let store = FilesystemStore::new(self.base_path.join(name))
            .map_err(|err| StorageError::from(err.to_string()))?;
        Ok(Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_stores_are_stable_per_name() {
        let provider = MemoryStoreProvider::new();
        let first = provider.store("a").unwrap();
        first
            .set(&StoreKey::new("k").unwrap(), vec![1u8].into())
            .unwrap();
        // A second request for "a" sees the same bytes; "b" does not.
        assert!(provider
            .store("a")
            .unwrap()
            .get(&StoreKey::new("k").unwrap())
            .unwrap()
            .is_some());
        assert!(provider
            .store("b")
            .unwrap()
            .get(&StoreKey::new("k").unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn filesystem_stores_map_to_subdirectories() {
        let dir = tempfile::TempDir::new().unwrap();
        let provider = FilesystemStoreProvider::new(dir.path());
        let store = provider.store("seism-test").unwrap();
        store
            .set(&StoreKey::new("k").unwrap(), vec![1u8, 2].into())
            .unwrap();
        assert!(dir.path().join("seism-test").join("k").is_file());
        assert!(provider.store("../escape").is_err());
    }
}
