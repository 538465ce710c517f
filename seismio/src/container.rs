//! Storage containers.
//!
//! A [`Container`] is the root namespace of one benchmark output: datasets
//! below their own prefixes and write-once attributes below `attributes/`.
//! It owns no policy; creation/reopen ordering between workers is the
//! orchestrator's job.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use seismio_storage::{SharedStore, StorageError, StoreKey, StoreKeyError};

use crate::dataset::{Dataset, DatasetError, DatasetMetadata};

/// The key prefix attributes live under.
const ATTRIBUTE_PREFIX: &str = "attributes";

/// A container error.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// An underlying storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// An invalid attribute name.
    #[error(transparent)]
    InvalidName(#[from] StoreKeyError),
    /// An attribute written twice.
    #[error("attribute {0} already exists")]
    AttributeExists(String),
    /// An attribute read before being written.
    #[error("attribute {0} does not exist")]
    AttributeMissing(String),
    /// An attribute document that cannot be serialized or parsed.
    #[error("invalid attribute document for {name}: {err}")]
    InvalidAttribute {
        /// The attribute name.
        name: String,
        /// The serialization error.
        err: serde_json::Error,
    },
}

/// A container of datasets and attributes over a byte store.
#[derive(Debug)]
pub struct Container {
    store: SharedStore,
}

impl Container {
    /// Create a container, truncating anything already below the store.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the store cannot be cleared.
    pub fn create(store: SharedStore) -> Result<Self, StorageError> {
        store.erase_prefix("")?;
        Ok(Self { store })
    }

    /// Open an existing container without touching its contents.
    #[must_use]
    pub fn open(store: SharedStore) -> Self {
        Self { store }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Create a dataset named `name` in the container.
    ///
    /// # Errors
    /// Returns a [`DatasetError`] if the metadata is invalid or storage
    /// fails.
    pub fn create_dataset(
        &self,
        name: &str,
        metadata: DatasetMetadata,
    ) -> Result<Dataset, DatasetError> {
        Dataset::create(self.store.clone(), name, metadata)
    }

    /// Open the dataset named `name`.
    ///
    /// # Errors
    /// Returns [`DatasetError::Missing`] if it does not exist.
    pub fn open_dataset(&self, name: &str) -> Result<Dataset, DatasetError> {
        Dataset::open(self.store.clone(), name)
    }

    /// Write the attribute `name`, failing if it already exists.
    ///
    /// Attributes are write-once; a reader sees either nothing or the full
    /// document, never a replacement.
    ///
    /// # Errors
    /// Returns [`ContainerError::AttributeExists`] on a second write, or a
    /// [`ContainerError`] if serialization or storage fails.
    pub fn write_attribute<T: Serialize>(
        &self,
        name: &str,
        value: &T,
    ) -> Result<(), ContainerError> {
        let key = StoreKey::new(format!("{ATTRIBUTE_PREFIX}/{name}"))?;
        if self.store.size_key(&key)?.is_some() {
            return Err(ContainerError::AttributeExists(name.to_string()));
        }
        let document = serde_json::to_vec(value).map_err(|err| {
            ContainerError::InvalidAttribute {
                name: name.to_string(),
                err,
            }
        })?;
        self.store.set(&key, document.into())?;
        Ok(())
    }

    /// Read the attribute `name`.
    ///
    /// # Errors
    /// Returns [`ContainerError::AttributeMissing`] if it has not been
    /// written, or a [`ContainerError`] if parsing fails.
    pub fn read_attribute<T: DeserializeOwned>(&self, name: &str) -> Result<T, ContainerError> {
        let key = StoreKey::new(format!("{ATTRIBUTE_PREFIX}/{name}"))?;
        let document = self
            .store
            .get(&key)?
            .ok_or_else(|| ContainerError::AttributeMissing(name.to_string()))?;
        serde_json::from_slice(&document).map_err(|err| ContainerError::InvalidAttribute {
            name: name.to_string(),
            err,
        })
    }

    /// List the attribute names below `prefix` (pass `""` for all).
    ///
    /// # Errors
    /// Returns a [`ContainerError`] if the store cannot be listed.
    pub fn attribute_names(&self, prefix: &str) -> Result<Vec<String>, ContainerError> {
        let prefix = if prefix.is_empty() {
            ATTRIBUTE_PREFIX.to_string()
        } else {
            format!("{ATTRIBUTE_PREFIX}/{prefix}")
        };
        Ok(self
            .store
            .list_prefix(&prefix)?
            .into_iter()
            .map(|key| key.as_str()[ATTRIBUTE_PREFIX.len() + 1..].to_string())
            .collect())
    }

    /// The total storage consumed by the container, in bytes.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the store cannot be listed.
    pub fn storage_size(&self) -> Result<u64, StorageError> {
        self.store.size_prefix("")
    }
}
