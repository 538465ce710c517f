//! Store keys.

use derive_more::Display;
use thiserror::Error;

/// A store key.
///
/// Keys are `/` separated paths. A valid key is non-empty, has no leading or
/// trailing `/`, and has no empty segments.
#[derive(Clone, Debug, Display, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StoreKey(String);

/// An invalid store key.
#[derive(Clone, Debug, Error)]
#[error("invalid store key {0}")]
pub struct StoreKeyError(String);

impl StoreKey {
    /// Create a new store key from `key`.
    ///
    /// # Errors
    /// Returns [`StoreKeyError`] if `key` is not valid.
    pub fn new(key: impl Into<String>) -> Result<Self, StoreKeyError> {
        let key = key.into();
        if Self::validate(&key) {
            Ok(Self(key))
        } else {
            Err(StoreKeyError(key))
        }
    }

    /// Validate a store key.
    ///
    /// `.` and `..` segments are rejected so keys map cleanly onto
    /// filesystem paths.
    #[must_use]
    pub fn validate(key: &str) -> bool {
        !key.is_empty()
            && key
                .split('/')
                .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
    }

    /// Return the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the key starts with `prefix`.
    ///
    /// An empty prefix matches every key, and a non-empty prefix must match
    /// whole segments (so `a/bc` does not have prefix `a/b`).
    #[must_use]
    pub fn has_prefix(&self, prefix: &str) -> bool {
        if prefix.is_empty() {
            return true;
        }
        let prefix = prefix.strip_suffix('/').unwrap_or(prefix);
        self.0 == prefix
            || self
                .0
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_keys() {
        assert!(StoreKey::new("a").is_ok());
        assert!(StoreKey::new("a/b/c").is_ok());
        assert!(StoreKey::new("chunked/c/0/1/2/3").is_ok());
    }

    #[test]
    fn invalid_keys() {
        assert!(StoreKey::new("").is_err());
        assert!(StoreKey::new("/a").is_err());
        assert!(StoreKey::new("a/").is_err());
        assert!(StoreKey::new("a//b").is_err());
        assert!(StoreKey::new("../b").is_err());
        assert!(StoreKey::new("a/./b").is_err());
    }

    #[test]
    fn prefixes() {
        let key = StoreKey::new("chunked/c/0/1").unwrap();
        assert!(key.has_prefix(""));
        assert!(key.has_prefix("chunked"));
        assert!(key.has_prefix("chunked/"));
        assert!(key.has_prefix("chunked/c"));
        assert!(key.has_prefix("chunked/c/0/1"));
        assert!(!key.has_prefix("chunked/c/0/10"));
        assert!(!key.has_prefix("chunk"));
    }
}
