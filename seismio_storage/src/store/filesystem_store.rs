//! A synchronous filesystem store.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use bytes::BytesMut;
use thiserror::Error;
use walkdir::WalkDir;

use crate::{
    ByteOffset, ByteRange, Bytes, ListableStoreTraits, MaybeBytes, ReadableStoreTraits,
    StorageError, StoreKey, WritableStoreTraits,
};

/// A synchronous filesystem store.
///
/// Each key maps to one file below the base path, with key segments as path
/// components. Partial writes seek within the file, so disjoint regions can
/// be written by independent workers without coordination.
#[derive(Debug)]
pub struct FilesystemStore {
    base_path: PathBuf,
    files: Mutex<HashMap<StoreKey, Arc<RwLock<()>>>>,
}

/// A filesystem store creation error.
#[derive(Debug, Error)]
pub enum FilesystemStoreCreateError {
    /// An IO error.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// The base path is a file rather than a directory.
    #[error("base path {0} exists and is not a directory")]
    ExistingFile(PathBuf),
}

impl FilesystemStore {
    /// Create a new filesystem store at a given `base_path`.
    ///
    /// The base directory is created if it does not exist.
    ///
    /// # Errors
    /// Returns a [`FilesystemStoreCreateError`] if the base path points to an
    /// existing file or cannot be created.
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self, FilesystemStoreCreateError> {
        let base_path = base_path.as_ref().to_path_buf();
        if base_path.is_file() {
            return Err(FilesystemStoreCreateError::ExistingFile(base_path));
        }
        std::fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            files: Mutex::default(),
        })
    }

    /// The base path of the store.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn key_to_path(&self, key: &StoreKey) -> PathBuf {
        self.base_path.join(key.as_str())
    }

    fn path_to_key(&self, path: &Path) -> Option<StoreKey> {
        let relative = path.strip_prefix(&self.base_path).ok()?;
        let key = relative.to_str()?.replace(std::path::MAIN_SEPARATOR, "/");
        StoreKey::new(key).ok()
    }

    fn file_lock(&self, key: &StoreKey) -> Arc<RwLock<()>> {
        let mut files = self.files.lock().unwrap_or_else(|err| err.into_inner());
        files.entry(key.clone()).or_default().clone()
    }

    fn set_impl(
        &self,
        key: &StoreKey,
        offset_values: &[(ByteOffset, Bytes)],
        truncate: bool,
    ) -> Result<(), StorageError> {
        let lock = self.file_lock(key);
        let _guard = lock.write().unwrap_or_else(|err| err.into_inner());

        let path = self.key_to_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(&path)?;
        for (offset, value) in offset_values {
            file.seek(SeekFrom::Start(*offset))?;
            file.write_all(value)?;
        }
        Ok(())
    }
}

impl ReadableStoreTraits for FilesystemStore {
    fn get(&self, key: &StoreKey) -> Result<MaybeBytes, StorageError> {
        let lock = self.file_lock(key);
        let _guard = lock.read().unwrap_or_else(|err| err.into_inner());

        let mut file = match std::fs::File::open(self.key_to_path(key)) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(Some(buf.into()))
    }

    fn get_partial(
        &self,
        key: &StoreKey,
        byte_ranges: &[ByteRange],
    ) -> Result<Option<Vec<Bytes>>, StorageError> {
        let lock = self.file_lock(key);
        let _guard = lock.read().unwrap_or_else(|err| err.into_inner());

        let mut file = match std::fs::File::open(self.key_to_path(key)) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let size = file.metadata()?.len();
        let mut out = Vec::with_capacity(byte_ranges.len());
        for byte_range in byte_ranges {
            if byte_range.end() > size {
                return Err(StorageError::InvalidByteRange {
                    key: key.clone(),
                    range: *byte_range,
                    size,
                });
            }
            let mut buf = BytesMut::zeroed(usize::try_from(byte_range.length).unwrap());
            file.seek(SeekFrom::Start(byte_range.offset))?;
            file.read_exact(&mut buf)?;
            out.push(buf.freeze());
        }
        Ok(Some(out))
    }

    fn size_key(&self, key: &StoreKey) -> Result<Option<u64>, StorageError> {
        match std::fs::metadata(self.key_to_path(key)) {
            Ok(metadata) => Ok(Some(metadata.len())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

impl WritableStoreTraits for FilesystemStore {
    fn set(&self, key: &StoreKey, value: Bytes) -> Result<(), StorageError> {
        self.set_impl(key, &[(0, value)], true)
    }

    fn set_partial(
        &self,
        key: &StoreKey,
        offset_values: &[(ByteOffset, Bytes)],
    ) -> Result<(), StorageError> {
        self.set_impl(key, offset_values, false)
    }

    fn erase_prefix(&self, prefix: &str) -> Result<(), StorageError> {
        for key in self.list_prefix(prefix)? {
            match std::fs::remove_file(self.key_to_path(&key)) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        let mut files = self.files.lock().unwrap_or_else(|err| err.into_inner());
        files.retain(|key, _| !key.has_prefix(prefix));
        Ok(())
    }
}

impl ListableStoreTraits for FilesystemStore {
    fn list_prefix(&self, prefix: &str) -> Result<Vec<StoreKey>, StorageError> {
        let mut keys: Vec<StoreKey> = WalkDir::new(&self.base_path)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| self.path_to_key(entry.path()))
            .filter(|key| key.has_prefix(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn size_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        let mut size = 0;
        for key in self.list_prefix(prefix)? {
            size += self.size_key(&key)?.unwrap_or(0);
        }
        Ok(size)
    }
}
