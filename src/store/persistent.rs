//! Read-through caching wrapper for persistent (external) data stores.
//!
//! The core hands serialized items across the boundary; the external store
//! never needs to understand the data model. The wrapper owns a TTL cache,
//! cache statistics, and the store-status machine that lets the data source
//! react to outages and recoveries.

use crate::{
    model::{Flag, Segment},
    status::{DataStoreStatus, DataStoreStatusProvider},
    store::{
        AllData, DataKind, DataStore, PatchTarget, StorageItem, StoreError, TombstonePlaceholder,
        Versioned,
    },
};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tokio::sync::Notify;
use tracing::{info, warn};

/// How long the wrapper trusts a cached read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheMode {
    /// Every read goes to the backing store.
    Disabled,
    /// Entries expire after the given TTL.
    Ttl(Duration),
    /// Entries never expire; the cache mirrors every successful write.
    Infinite,
}

/// An item in the form the persistent boundary carries: version alongside
/// the serialized JSON so stores can guard upserts without parsing.
#[derive(Clone, Debug, PartialEq)]
pub struct SerializedItem {
    pub version: u64,
    pub serialized: String,
}

/// External storage boundary. Implementations adapt Redis, DynamoDB and
/// friends; all datamodel knowledge stays on this side.
pub trait PersistentDataStore: Send + Sync {
    fn init(&self, data: Vec<(DataKind, Vec<(String, SerializedItem)>)>)
        -> Result<(), StoreError>;

    fn get(&self, kind: DataKind, key: &str) -> Result<Option<SerializedItem>, StoreError>;

    fn get_all(&self, kind: DataKind) -> Result<Vec<(String, SerializedItem)>, StoreError>;

    /// Apply iff newer; returns whether the write took effect.
    fn upsert(&self, kind: DataKind, key: &str, item: SerializedItem) -> Result<bool, StoreError>;

    fn initialized(&self) -> Result<bool, StoreError>;

    /// Cheap health probe used by the outage poller.
    fn is_available(&self) -> bool {
        self.initialized().is_ok()
    }
}

/// Read-through cache statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub load_exceptions: u64,
    pub total_load_time_micros: u64,
}

#[derive(Default)]
struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    load_exceptions: AtomicU64,
    total_load_time_micros: AtomicU64,
}

type Cached<T> = (Instant, Option<Arc<T>>);

pub struct PersistentDataStoreWrapper {
    core: Arc<dyn PersistentDataStore>,
    mode: CacheMode,
    flag_cache: Mutex<LruCache<String, Cached<Flag>>>,
    segment_cache: Mutex<LruCache<String, Cached<Segment>>>,
    initialized: AtomicBool,
    stats: StatCounters,
    status: Arc<DataStoreStatusProvider>,
    outage: Notify,
}

impl PersistentDataStoreWrapper {
    pub fn new(core: Arc<dyn PersistentDataStore>, mode: CacheMode, cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity.max(1)).unwrap();
        Self {
            core,
            mode,
            flag_cache: Mutex::new(LruCache::new(capacity)),
            segment_cache: Mutex::new(LruCache::new(capacity)),
            initialized: AtomicBool::new(false),
            stats: StatCounters::default(),
            status: Arc::new(DataStoreStatusProvider::new()),
            outage: Notify::new(),
        }
    }

    pub fn status_provider(&self) -> Arc<DataStoreStatusProvider> {
        Arc::clone(&self.status)
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            loads: self.stats.loads.load(Ordering::Relaxed),
            load_exceptions: self.stats.load_exceptions.load(Ordering::Relaxed),
            total_load_time_micros: self.stats.total_load_time_micros.load(Ordering::Relaxed),
        }
    }

    /// Watch for outages and poll the backing store until it recovers.
    ///
    /// Run this on the client's runtime; it parks until a store error is
    /// reported and exits never.
    pub async fn run_availability_monitor(self: Arc<Self>) {
        loop {
            self.outage.notified().await;
            if self.status.status().available {
                continue;
            }
            info!("data store reported unavailable, polling for recovery");
            while !self.core.is_available() {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            // with an everlasting cache every write is still in memory, so
            // recovery needs no refresh; otherwise reads may have missed
            // updates and the data source must re-sync
            let refresh_needed = self.mode != CacheMode::Infinite;
            info!(refresh_needed, "data store recovered");
            self.status.update(DataStoreStatus {
                available: true,
                refresh_needed,
            });
        }
    }

    fn note_error(&self, error: &StoreError) {
        warn!(%error, "persistent data store operation failed");
        if self.status.status().available {
            self.status.update(DataStoreStatus {
                available: false,
                refresh_needed: false,
            });
        }
        self.outage.notify_one();
    }

    fn fresh(&self, at: Instant) -> bool {
        match self.mode {
            CacheMode::Disabled => false,
            CacheMode::Ttl(ttl) => at.elapsed() < ttl,
            CacheMode::Infinite => true,
        }
    }

    fn load<T: DeserializeOwned + Versioned>(
        &self,
        kind: DataKind,
        key: &str,
        preprocess: fn(&mut T),
    ) -> Result<Option<Arc<T>>, StoreError> {
        let started = Instant::now();
        self.stats.loads.fetch_add(1, Ordering::Relaxed);
        let loaded = self.core.get(kind, key);
        self.stats
            .total_load_time_micros
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        match loaded {
            Ok(item) => Ok(item
                .and_then(|serialized| deserialize_item::<T>(&serialized).transpose())
                .transpose()?
                .map(|mut item| {
                    preprocess(&mut item);
                    Arc::new(item)
                })),
            Err(error) => {
                self.stats.load_exceptions.fetch_add(1, Ordering::Relaxed);
                self.note_error(&error);
                Err(error)
            }
        }
    }

    fn get_cached<T: DeserializeOwned + Versioned>(
        &self,
        cache: &Mutex<LruCache<String, Cached<T>>>,
        kind: DataKind,
        key: &str,
        preprocess: fn(&mut T),
    ) -> Result<Option<Arc<T>>, StoreError> {
        if self.mode != CacheMode::Disabled {
            if let Some((at, item)) = cache.lock().get(key) {
                if self.fresh(*at) {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(item.clone());
                }
            }
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        let loaded = self.load(kind, key, preprocess)?;
        if self.mode != CacheMode::Disabled {
            cache
                .lock()
                .put(key.to_owned(), (Instant::now(), loaded.clone()));
        }
        Ok(loaded)
    }
}

impl DataStore for PersistentDataStoreWrapper {
    fn init(&self, data: AllData) -> Result<(), StoreError> {
        let serialized = vec![
            (
                DataKind::Flag,
                data.flags
                    .iter()
                    .map(|(key, item)| (key.clone(), serialize_item(item)))
                    .collect::<Vec<_>>(),
            ),
            (
                DataKind::Segment,
                data.segments
                    .iter()
                    .map(|(key, item)| (key.clone(), serialize_item(item)))
                    .collect::<Vec<_>>(),
            ),
        ];
        if let Err(error) = self.core.init(serialized) {
            self.note_error(&error);
            return Err(error);
        }
        self.initialized.store(true, Ordering::SeqCst);
        if self.mode != CacheMode::Disabled {
            let now = Instant::now();
            let mut flags = self.flag_cache.lock();
            flags.clear();
            for (key, item) in data.flags {
                let entry = item.map(|mut flag| {
                    flag.preprocess();
                    Arc::new(flag)
                });
                flags.put(key, (now, entry.item().cloned()));
            }
            drop(flags);
            let mut segments = self.segment_cache.lock();
            segments.clear();
            for (key, item) in data.segments {
                let entry = item.map(|mut segment| {
                    segment.preprocess();
                    Arc::new(segment)
                });
                segments.put(key, (now, entry.item().cloned()));
            }
        }
        Ok(())
    }

    fn flag(&self, key: &str) -> Result<Option<Arc<Flag>>, StoreError> {
        self.get_cached(&self.flag_cache, DataKind::Flag, key, Flag::preprocess)
    }

    fn segment(&self, key: &str) -> Result<Option<Arc<Segment>>, StoreError> {
        self.get_cached(
            &self.segment_cache,
            DataKind::Segment,
            key,
            Segment::preprocess,
        )
    }

    fn all_flags(&self) -> Result<HashMap<String, Arc<Flag>>, StoreError> {
        let items = match self.core.get_all(DataKind::Flag) {
            Ok(items) => items,
            Err(error) => {
                self.note_error(&error);
                return Err(error);
            }
        };
        let mut flags = HashMap::with_capacity(items.len());
        for (key, serialized) in items {
            if let Some(mut flag) = deserialize_item::<Flag>(&serialized)? {
                flag.preprocess();
                flags.insert(key, Arc::new(flag));
            }
        }
        Ok(flags)
    }

    fn upsert(&self, key: &str, item: PatchTarget) -> Result<bool, StoreError> {
        let kind = item.kind();
        let serialized = match &item {
            PatchTarget::Flag(flag_item) => serialize_item(flag_item),
            PatchTarget::Segment(segment_item) => serialize_item(segment_item),
        };
        let applied = match self.core.upsert(kind, key, serialized) {
            Ok(applied) => applied,
            Err(error) => {
                self.note_error(&error);
                return Err(error);
            }
        };
        if applied && self.mode != CacheMode::Disabled {
            let now = Instant::now();
            match item {
                PatchTarget::Flag(flag_item) => {
                    let entry = flag_item.map(|mut flag| {
                        flag.preprocess();
                        Arc::new(flag)
                    });
                    self.flag_cache
                        .lock()
                        .put(key.to_owned(), (now, entry.item().cloned()));
                }
                PatchTarget::Segment(segment_item) => {
                    let entry = segment_item.map(|mut segment| {
                        segment.preprocess();
                        Arc::new(segment)
                    });
                    self.segment_cache
                        .lock()
                        .put(key.to_owned(), (now, entry.item().cloned()));
                }
            }
        }
        Ok(applied)
    }

    fn is_initialized(&self) -> bool {
        if self.initialized.load(Ordering::SeqCst) {
            return true;
        }
        match self.core.initialized() {
            Ok(true) => {
                self.initialized.store(true, Ordering::SeqCst);
                true
            }
            Ok(false) => false,
            Err(error) => {
                self.note_error(&error);
                false
            }
        }
    }
}

fn serialize_item<T: Serialize + Versioned>(item: &StorageItem<T>) -> SerializedItem {
    match item {
        StorageItem::Item(value) => SerializedItem {
            version: value.version(),
            serialized: serde_json::to_string(value).unwrap_or_else(|_| "null".into()),
        },
        StorageItem::Tombstone(version) => SerializedItem {
            version: *version,
            serialized: serde_json::to_string(&TombstonePlaceholder {
                version: *version,
                deleted: true,
            })
            .unwrap_or_else(|_| "null".into()),
        },
    }
}

/// `Ok(None)` for tombstones; a payload that fails to parse is a decode
/// error, not a missing item.
fn deserialize_item<T: DeserializeOwned>(item: &SerializedItem) -> Result<Option<T>, StoreError> {
    let value: Value = serde_json::from_str(&item.serialized)
        .map_err(|e| StoreError::Decode(e.to_string()))?;
    if value.get("deleted").and_then(Value::as_bool) == Some(true) {
        return Ok(None);
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| StoreError::Decode(e.to_string()))
}
