//! Storage engine boundary.
//!
//! The replica state machine never touches disk directly; it drives a
//! [`Storage`] implementation. The engine must apply each
//! [`ScopedRecord`] atomically: after `apply_write` returns, either every
//! scope of the record has been replaced or none has.
//!
//! [`MemoryStorage`] is the in-memory engine used by tests, simulation and
//! the in-process runtime. It supports fault injection through
//! [`MemoryStorage::fail_next_apply`].

use std::cell::Cell;
use std::collections::BTreeMap;

use bytes::Bytes;
use ebb_types::{Key, KeyRange};
use serde::{Deserialize, Serialize};

use crate::history::{BranchHistory, Version};
use crate::version_map::VersionMap;

// ============================================================================
// Records
// ============================================================================

/// One key/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KvEntry {
    pub key: Key,
    pub value: Bytes,
}

impl KvEntry {
    pub fn new(key: impl Into<Key>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A write scoped to one or more key ranges.
///
/// Applying the record makes the contents of each scope exactly `entries`
/// restricted to that scope: keys inside a scope but absent from `entries`
/// are removed. A backfill chunk and a live write are both expressed this
/// way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopedRecord {
    pub scopes: Vec<KeyRange>,
    pub version: Version,
    pub entries: Vec<KvEntry>,
}

impl ScopedRecord {
    pub fn new(scopes: Vec<KeyRange>, version: Version, entries: Vec<KvEntry>) -> Self {
        Self {
            scopes,
            version,
            entries,
        }
    }

    /// Returns the record narrowed to `scopes`, keeping only entries that
    /// fall inside one of them.
    pub fn narrowed(&self, scopes: Vec<KeyRange>) -> ScopedRecord {
        let entries = self
            .entries
            .iter()
            .filter(|e| scopes.iter().any(|s| s.contains_key(&e.key)))
            .cloned()
            .collect();
        ScopedRecord::new(scopes, self.version, entries)
    }
}

/// Errors reported by a storage engine.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The engine refused or failed to apply a record.
    #[error("apply failed: {0}")]
    ApplyFailed(String),

    /// A record carried an entry outside all of its scopes.
    #[error("entry {key} lies outside every scope of the record")]
    EntryOutsideScope { key: Key },

    /// Metadata could not be encoded or decoded.
    #[error("metadata codec error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// The storage engine contract consumed by the replica.
pub trait Storage {
    /// Applies one record atomically.
    fn apply_write(&mut self, record: &ScopedRecord) -> Result<(), StorageError>;

    /// Reads every entry whose key lies in `range`, in key order.
    fn read_range(&self, range: &KeyRange) -> Result<Vec<KvEntry>, StorageError>;

    /// Reads at most `limit` entries from the start of `range`, in key order.
    fn read_batch(&self, range: &KeyRange, limit: usize) -> Result<Vec<KvEntry>, StorageError>;

    /// Counts the entries whose key lies in `range` without reading values.
    fn count_range(&self, range: &KeyRange) -> Result<usize, StorageError>;

    /// Durably records the version map and history for the hosted region.
    fn persist_metadata(
        &mut self,
        map: &VersionMap,
        history: &BranchHistory,
    ) -> Result<(), StorageError>;

    /// Loads the last persisted version map and history, if any.
    fn load_metadata(&self) -> Result<Option<(VersionMap, BranchHistory)>, StorageError>;
}

// ============================================================================
// Memory Storage
// ============================================================================

#[derive(Serialize, Deserialize)]
struct PersistedMetadata {
    version_map: VersionMap,
    history: BranchHistory,
}

/// In-memory storage engine.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    data: BTreeMap<Key, Bytes>,
    metadata: Option<Vec<u8>>,
    fail_next_apply: bool,
    applied: u64,
    entries_read: Cell<u64>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates storage pre-populated with `entries`.
    pub fn with_entries(entries: impl IntoIterator<Item = KvEntry>) -> Self {
        Self {
            data: entries.into_iter().map(|e| (e.key, e.value)).collect(),
            ..Self::default()
        }
    }

    /// Makes the next `apply_write` fail without changing any data.
    pub fn fail_next_apply(&mut self) {
        self.fail_next_apply = true;
    }

    pub fn get(&self, key: &Key) -> Option<&Bytes> {
        self.data.get(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of records successfully applied.
    pub fn applied_records(&self) -> u64 {
        self.applied
    }

    /// Number of entries handed out by reads so far.
    pub fn entries_read(&self) -> u64 {
        self.entries_read.get()
    }

    fn scan<'a>(&'a self, range: &'a KeyRange) -> impl Iterator<Item = (&'a Key, &'a Bytes)> + 'a {
        self.data
            .range(range.start().clone()..)
            .take_while(|(key, _)| range.contains_key(key))
    }

    fn to_entries<'a>(&self, iter: impl Iterator<Item = (&'a Key, &'a Bytes)>) -> Vec<KvEntry> {
        let entries: Vec<KvEntry> = iter
            .map(|(key, value)| KvEntry {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();
        self.entries_read
            .set(self.entries_read.get() + entries.len() as u64);
        entries
    }
}

impl Storage for MemoryStorage {
    fn apply_write(&mut self, record: &ScopedRecord) -> Result<(), StorageError> {
        if self.fail_next_apply {
            self.fail_next_apply = false;
            return Err(StorageError::ApplyFailed("injected fault".to_string()));
        }
        if let Some(stray) = record
            .entries
            .iter()
            .find(|e| !record.scopes.iter().any(|s| s.contains_key(&e.key)))
        {
            return Err(StorageError::EntryOutsideScope {
                key: stray.key.clone(),
            });
        }

        for scope in &record.scopes {
            self.data.retain(|key, _| !scope.contains_key(key));
        }
        for entry in &record.entries {
            self.data.insert(entry.key.clone(), entry.value.clone());
        }
        self.applied += 1;
        Ok(())
    }

    fn read_range(&self, range: &KeyRange) -> Result<Vec<KvEntry>, StorageError> {
        Ok(self.to_entries(self.scan(range)))
    }

    fn read_batch(&self, range: &KeyRange, limit: usize) -> Result<Vec<KvEntry>, StorageError> {
        Ok(self.to_entries(self.scan(range).take(limit)))
    }

    fn count_range(&self, range: &KeyRange) -> Result<usize, StorageError> {
        Ok(self.scan(range).count())
    }

    fn persist_metadata(
        &mut self,
        map: &VersionMap,
        history: &BranchHistory,
    ) -> Result<(), StorageError> {
        let encoded = serde_json::to_vec(&PersistedMetadata {
            version_map: map.clone(),
            history: history.clone(),
        })?;
        self.metadata = Some(encoded);
        Ok(())
    }

    fn load_metadata(&self) -> Result<Option<(VersionMap, BranchHistory)>, StorageError> {
        let Some(bytes) = &self.metadata else {
            return Ok(None);
        };
        let decoded: PersistedMetadata = serde_json::from_slice(bytes)?;
        Ok(Some((decoded.version_map, decoded.history)))
    }
}
