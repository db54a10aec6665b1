//! Embedded key-value store backing the config store.
//!
//! Every write stamps its key with a revision drawn from one store-wide
//! counter, so revisions only grow and a deleted key that comes back never
//! reuses an old revision. Conditional writes compare against that revision,
//! which is what the config store builds its optimistic concurrency on.
//! Revision 0 stands for "key absent".

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::types::MetaError;

/// Key type for the KV store.
pub type Key = Vec<u8>;
/// Value type for the KV store.
pub type Value = Vec<u8>;
/// A key-value pair.
pub type KvPair = (Key, Value);

/// Revision of a stored key. 0 means the key does not exist.
pub type Revision = u64;

/// Key-value store trait for config metadata persistence.
pub trait KvStore: Send + Sync {
    /// Get a value together with its revision.
    fn get_versioned(&self, key: &[u8]) -> Result<Option<(Revision, Value)>, MetaError>;

    /// Put only if the key is currently at `expected` (0 = must be absent).
    /// Returns the new revision.
    fn put_if_revision(
        &self,
        key: Key,
        expected: Revision,
        value: Value,
    ) -> Result<Revision, MetaError>;

    /// Delete only if the key is currently at `expected`.
    fn delete_if_revision(&self, key: &[u8], expected: Revision) -> Result<(), MetaError>;

    /// Scan all keys with the given prefix, returning (key, value) pairs in sorted order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError>;
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<Key, (Revision, Value)>,
    last_revision: Revision,
}

impl Inner {
    fn revision_of(&self, key: &[u8]) -> Revision {
        self.entries.get(key).map(|(rev, _)| *rev).unwrap_or(0)
    }
}

/// In-memory KV store backed by a BTreeMap. Thread-safe via RwLock.
///
/// Durability comes from the replicated commit that precedes every write
/// (see [`crate::replication`]), not from this store.
pub struct MemoryKvStore {
    data: Arc<RwLock<Inner>>,
}

impl MemoryKvStore {
    /// Creates a new empty in-memory KV store.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(Inner::default())),
        }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

fn conflict(key: &[u8], expected: Revision, found: Revision) -> MetaError {
    MetaError::VersionConflict {
        key: String::from_utf8_lossy(key).into_owned(),
        expected: expected.to_string(),
        found: found.to_string(),
        current: None,
    }
}

impl KvStore for MemoryKvStore {
    fn get_versioned(&self, key: &[u8]) -> Result<Option<(Revision, Value)>, MetaError> {
        let data = self
            .data
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        Ok(data.entries.get(key).cloned())
    }

    fn put_if_revision(
        &self,
        key: Key,
        expected: Revision,
        value: Value,
    ) -> Result<Revision, MetaError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        let found = data.revision_of(&key);
        if found != expected {
            return Err(conflict(&key, expected, found));
        }
        data.last_revision += 1;
        let rev = data.last_revision;
        data.entries.insert(key, (rev, value));
        Ok(rev)
    }

    fn delete_if_revision(&self, key: &[u8], expected: Revision) -> Result<(), MetaError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        let found = data.revision_of(key);
        if found != expected {
            return Err(conflict(key, expected, found));
        }
        data.entries.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        let data = self
            .data
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        let mut result = Vec::new();
        for (k, (_, v)) in data.entries.range::<Vec<u8>, _>(prefix.to_vec()..) {
            if !k.starts_with(prefix) {
                break;
            }
            result.push((k.clone(), v.clone()));
        }
        Ok(result)
    }
}
