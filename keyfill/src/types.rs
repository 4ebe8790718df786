//! Core types shared by the cache, worker pool and merger

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Structured result of resolving one key
///
/// Ordered so checkpoint snapshots serialize deterministically.
pub type Record = BTreeMap<String, String>;

/// External identifier addressing one logical entity across many rows
///
/// Always trimmed and never blank; construct with [`Key::parse`].
/// Deserialization goes through the same check.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Key(String);

impl Key {
    /// Trim `raw` and reject blank values
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Key {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Key::parse(&raw).ok_or_else(|| "key must not be blank".to_string())
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Entries in the cache
    pub total: usize,
    /// Entries holding a record
    pub successful: usize,
    /// Entries holding null
    pub failed: usize,
}
