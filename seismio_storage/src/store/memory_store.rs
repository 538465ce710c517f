//! A synchronous in-memory store.

use std::collections::BTreeMap;
use std::sync::Mutex;

use bytes::BytesMut;

use crate::{
    ByteOffset, ByteRange, Bytes, ListableStoreTraits, MaybeBytes, ReadableStoreTraits,
    StorageError, StoreKey, WritableStoreTraits,
};

/// A synchronous in-memory store.
///
/// Workers in a local run share one `MemoryStore` through an
/// [`Arc`](std::sync::Arc); every store operation is atomic with respect to
/// its key.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data_map: Mutex<BTreeMap<StoreKey, BytesMut>>,
}

impl MemoryStore {
    /// Create a new memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn set_impl(&self, key: &StoreKey, value: &[u8], offset: ByteOffset, truncate: bool) {
        let mut data_map = self.data_map.lock().unwrap_or_else(|err| err.into_inner());
        let data = data_map.entry(key.clone()).or_default();

        if offset == 0 && data.is_empty() {
            data.extend_from_slice(value);
        } else {
            let length = usize::try_from(offset + value.len() as u64).unwrap();
            if data.len() < length {
                data.resize(length, 0);
            } else if truncate {
                data.truncate(length);
            }
            let offset = usize::try_from(offset).unwrap();
            data[offset..offset + value.len()].copy_from_slice(value);
        }
    }
}

impl ReadableStoreTraits for MemoryStore {
    fn get(&self, key: &StoreKey) -> Result<MaybeBytes, StorageError> {
        let data_map = self.data_map.lock().unwrap_or_else(|err| err.into_inner());
        Ok(data_map.get(key).map(|data| data.clone().freeze()))
    }

    fn get_partial(
        &self,
        key: &StoreKey,
        byte_ranges: &[ByteRange],
    ) -> Result<Option<Vec<Bytes>>, StorageError> {
        let data_map = self.data_map.lock().unwrap_or_else(|err| err.into_inner());
        let Some(data) = data_map.get(key) else {
            return Ok(None);
        };
        let data = data.clone().freeze();
        let mut out = Vec::with_capacity(byte_ranges.len());
        for byte_range in byte_ranges {
            if byte_range.end() > data.len() as u64 {
                return Err(StorageError::InvalidByteRange {
                    key: key.clone(),
                    range: *byte_range,
                    size: data.len() as u64,
                });
            }
            let start = usize::try_from(byte_range.offset).unwrap();
            let end = usize::try_from(byte_range.end()).unwrap();
            out.push(data.slice(start..end));
        }
        Ok(Some(out))
    }

    fn size_key(&self, key: &StoreKey) -> Result<Option<u64>, StorageError> {
        let data_map = self.data_map.lock().unwrap_or_else(|err| err.into_inner());
        Ok(data_map.get(key).map(|entry| entry.len() as u64))
    }
}

impl WritableStoreTraits for MemoryStore {
    fn set(&self, key: &StoreKey, value: Bytes) -> Result<(), StorageError> {
        self.set_impl(key, &value, 0, true);
        Ok(())
    }

    fn set_partial(
        &self,
        key: &StoreKey,
        offset_values: &[(ByteOffset, Bytes)],
    ) -> Result<(), StorageError> {
        for (offset, value) in offset_values {
            self.set_impl(key, value, *offset, false);
        }
        Ok(())
    }

    fn erase_prefix(&self, prefix: &str) -> Result<(), StorageError> {
        let mut data_map = self.data_map.lock().unwrap_or_else(|err| err.into_inner());
        data_map.retain(|key, _| !key.has_prefix(prefix));
        Ok(())
    }
}

impl ListableStoreTraits for MemoryStore {
    fn list_prefix(&self, prefix: &str) -> Result<Vec<StoreKey>, StorageError> {
        let data_map = self.data_map.lock().unwrap_or_else(|err| err.into_inner());
        Ok(data_map
            .keys()
            .filter(|key| key.has_prefix(prefix))
            .cloned()
            .collect())
    }

    fn size_prefix(&self, prefix: &str) -> Result<u64, StorageError> {
        let data_map = self.data_map.lock().unwrap_or_else(|err| err.into_inner());
        Ok(data_map
            .iter()
            .filter(|(key, _)| key.has_prefix(prefix))
            .map(|(_, data)| data.len() as u64)
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(key: &str) -> StoreKey {
        StoreKey::new(key).unwrap()
    }

    #[test]
    fn set_get() {
        let store = MemoryStore::new();
        store.set(&key("a/b"), Bytes::from_static(b"hello")).unwrap();
        assert_eq!(store.get(&key("a/b")).unwrap().unwrap().as_ref(), b"hello");
        assert!(store.get(&key("a/c")).unwrap().is_none());
        assert_eq!(store.size_key(&key("a/b")).unwrap(), Some(5));
    }

    #[test]
    fn set_partial_grows_and_preserves() {
        let store = MemoryStore::new();
        store
            .set_partial(&key("a"), &[(2, Bytes::from_static(b"xy"))])
            .unwrap();
        assert_eq!(store.get(&key("a")).unwrap().unwrap().as_ref(), b"\0\0xy");
        store
            .set_partial(&key("a"), &[(0, Bytes::from_static(b"ab"))])
            .unwrap();
        assert_eq!(store.get(&key("a")).unwrap().unwrap().as_ref(), b"abxy");
    }

    #[test]
    fn get_partial_bounds() {
        let store = MemoryStore::new();
        store.set(&key("a"), Bytes::from_static(b"0123456789")).unwrap();
        let ranges = [ByteRange::new(0, 2), ByteRange::new(8, 2)];
        let out = store.get_partial(&key("a"), &ranges).unwrap().unwrap();
        assert_eq!(out[0].as_ref(), b"01");
        assert_eq!(out[1].as_ref(), b"89");
        assert!(store
            .get_partial(&key("a"), &[ByteRange::new(8, 3)])
            .is_err());
    }

    #[test]
    fn list_and_erase_prefix() {
        let store = MemoryStore::new();
        store.set(&key("d/c/0"), Bytes::from_static(b"aa")).unwrap();
        store.set(&key("d/c/1"), Bytes::from_static(b"bb")).unwrap();
        store.set(&key("e"), Bytes::from_static(b"cc")).unwrap();
        assert_eq!(store.list_prefix("d").unwrap().len(), 2);
        assert_eq!(store.size_prefix("d").unwrap(), 4);
        store.erase_prefix("d").unwrap();
        assert!(store.list_prefix("d").unwrap().is_empty());
        assert_eq!(store.list_prefix("").unwrap().len(), 1);
    }
}
