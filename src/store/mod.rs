//! Keyed, kinded, versioned storage for flag configuration.
//!
//! The store exclusively owns the current item map; the evaluator and bulk
//! queries read through shared handles. All writes funnel through the data
//! source, so ordering per key is the order received off the wire.

pub mod memory;
pub mod persistent;

pub use memory::InMemoryDataStore;
pub use persistent::{
    CacheMode, CacheStats, PersistentDataStore, PersistentDataStoreWrapper, SerializedItem,
};

use crate::model::{Flag, Segment};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, sync::Arc};

#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Data store is not available: {0}")]
    Unavailable(String),

    #[error("Failed to decode stored item: {0}")]
    Decode(String),
}

/// The two kinds of records the store holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataKind {
    Flag,
    Segment,
}

impl DataKind {
    /// Namespace component used by persistent store implementations.
    pub fn namespace(&self) -> &'static str {
        match self {
            DataKind::Flag => "features",
            DataKind::Segment => "segments",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.namespace())
    }
}

pub trait Versioned {
    fn version(&self) -> u64;
}

impl Versioned for Flag {
    fn version(&self) -> u64 {
        self.version
    }
}

impl Versioned for Segment {
    fn version(&self) -> u64 {
        self.version
    }
}

impl<T: Versioned> Versioned for Arc<T> {
    fn version(&self) -> u64 {
        self.as_ref().version()
    }
}

/// A present item or the tombstone left by a delete.
///
/// Tombstones participate in version comparisons so a delete is not undone
/// by a stale patch arriving late, but they are never returned as items.
#[derive(Clone, Debug)]
pub enum StorageItem<T> {
    Item(T),
    Tombstone(u64),
}

impl<T: Versioned> StorageItem<T> {
    pub fn version(&self) -> u64 {
        match self {
            StorageItem::Item(item) => item.version(),
            StorageItem::Tombstone(version) => *version,
        }
    }

    pub fn item(&self) -> Option<&T> {
        match self {
            StorageItem::Item(item) => Some(item),
            StorageItem::Tombstone(_) => None,
        }
    }
}

impl<T> StorageItem<T> {
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> StorageItem<U> {
        match self {
            StorageItem::Item(item) => StorageItem::Item(f(item)),
            StorageItem::Tombstone(version) => StorageItem::Tombstone(version),
        }
    }
}

/// Serialized tombstone form shared by the wire and persistent stores.
#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct TombstonePlaceholder {
    pub version: u64,
    pub deleted: bool,
}

/// A full dataset, as carried by a stream `put` or a poll response.
#[derive(Clone, Debug, Default)]
pub struct AllData {
    pub flags: HashMap<String, StorageItem<Flag>>,
    pub segments: HashMap<String, StorageItem<Segment>>,
}

/// A single-item mutation produced by the data source.
#[derive(Clone, Debug)]
pub enum PatchTarget {
    Flag(StorageItem<Flag>),
    Segment(StorageItem<Segment>),
}

impl PatchTarget {
    pub fn kind(&self) -> DataKind {
        match self {
            PatchTarget::Flag(_) => DataKind::Flag,
            PatchTarget::Segment(_) => DataKind::Segment,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            PatchTarget::Flag(item) => item.version(),
            PatchTarget::Segment(item) => item.version(),
        }
    }
}

/// Storage for the local replica of flag configuration.
///
/// Reads are fallible because persistent-backed implementations can lose
/// their backing store; the in-memory implementation never errors.
pub trait DataStore: Send + Sync {
    /// Atomically replace all contents and mark the store initialized.
    fn init(&self, data: AllData) -> Result<(), StoreError>;

    fn flag(&self, key: &str) -> Result<Option<Arc<Flag>>, StoreError>;

    fn segment(&self, key: &str) -> Result<Option<Arc<Segment>>, StoreError>;

    /// Snapshot of all live (non-deleted) flags.
    fn all_flags(&self) -> Result<HashMap<String, Arc<Flag>>, StoreError>;

    /// Apply a single mutation iff its version is newer than what is stored.
    /// Returns whether the write took effect.
    fn upsert(&self, key: &str, item: PatchTarget) -> Result<bool, StoreError>;

    /// Whether a full dataset has ever been stored.
    fn is_initialized(&self) -> bool;

    fn close(&self) {}
}

impl<T: DataStore + ?Sized> DataStore for Arc<T> {
    fn init(&self, data: AllData) -> Result<(), StoreError> {
        self.as_ref().init(data)
    }

    fn flag(&self, key: &str) -> Result<Option<Arc<Flag>>, StoreError> {
        self.as_ref().flag(key)
    }

    fn segment(&self, key: &str) -> Result<Option<Arc<Segment>>, StoreError> {
        self.as_ref().segment(key)
    }

    fn all_flags(&self) -> Result<HashMap<String, Arc<Flag>>, StoreError> {
        self.as_ref().all_flags()
    }

    fn upsert(&self, key: &str, item: PatchTarget) -> Result<bool, StoreError> {
        self.as_ref().upsert(key, item)
    }

    fn is_initialized(&self) -> bool {
        self.as_ref().is_initialized()
    }

    fn close(&self) {
        self.as_ref().close()
    }
}
