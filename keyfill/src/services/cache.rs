//! Thread-safe record cache
//!
//! Single source of truth for "already attempted": a key is present once it
//! has been resolved, either to a record or to null. The raw map is never
//! handed out; every access goes through the lock.

use crate::types::{CacheStats, Key, Record};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Key → record-or-null map shared by all workers
#[derive(Debug, Default)]
pub struct RecordCache {
    entries: Mutex<HashMap<Key, Option<Record>>>,
}

impl RecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a cache from checkpointed entries
    ///
    /// Blank keys in the snapshot are dropped.
    pub fn from_entries(entries: BTreeMap<String, Option<Record>>) -> Self {
        let map = entries
            .into_iter()
            .filter_map(|(raw, record)| Key::parse(&raw).map(|key| (key, record)))
            .collect();
        Self {
            entries: Mutex::new(map),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Key, Option<Record>>> {
        // Entries are plain data; a panic elsewhere cannot leave them half-written
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a key
    ///
    /// Outer `None`: never attempted. `Some(None)`: attempted, resolved to null.
    pub fn get(&self, key: &Key) -> Option<Option<Record>> {
        self.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.lock().contains_key(key)
    }

    /// Store the outcome for `key`
    ///
    /// An existing entry is never overwritten; returns `false` (and logs) when
    /// the key was already present. Forced re-resolution goes through
    /// [`RecordCache::remove_failed`] first.
    pub fn set(&self, key: Key, record: Option<Record>) -> bool {
        let mut entries = self.lock();
        if entries.contains_key(&key) {
            tracing::warn!(key = %key, "Ignoring repeated cache write for key");
            return false;
        }
        entries.insert(key, record);
        true
    }

    /// Drop every null entry and return the removed keys, sorted
    pub fn remove_failed(&self) -> Vec<Key> {
        let mut entries = self.lock();
        let mut removed: Vec<Key> = entries
            .iter()
            .filter(|(_, record)| record.is_none())
            .map(|(key, _)| key.clone())
            .collect();
        for key in &removed {
            entries.remove(key);
        }
        removed.sort();
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.lock();
        let successful = entries.values().filter(|r| r.is_some()).count();
        CacheStats {
            total: entries.len(),
            successful,
            failed: entries.len() - successful,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy the entries under the lock, ordered by key
    pub fn snapshot(&self) -> BTreeMap<String, Option<Record>> {
        self.lock()
            .iter()
            .map(|(key, record)| (key.as_str().to_string(), record.clone()))
            .collect()
    }
}
