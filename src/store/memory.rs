use crate::{
    model::{Flag, Segment},
    store::{AllData, DataStore, PatchTarget, StorageItem, StoreError},
};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::debug;

type ItemMap<T> = HashMap<String, StorageItem<Arc<T>>>;

/// Default in-process store.
///
/// Each kind holds an immutable snapshot map behind an [ArcSwap]: readers
/// load the current snapshot lock-free, writers clone-and-swap under a
/// mutex so concurrent upserts serialize and version checks stay sound.
pub struct InMemoryDataStore {
    flags: ArcSwap<ItemMap<Flag>>,
    segments: ArcSwap<ItemMap<Segment>>,
    init: AtomicBool,
    write_lock: Mutex<()>,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn upsert_map<T: crate::store::Versioned>(
        map: &ArcSwap<ItemMap<T>>,
        key: &str,
        item: StorageItem<Arc<T>>,
    ) -> bool {
        let current = map.load();
        if let Some(existing) = current.get(key) {
            if item.version() <= existing.version() {
                debug!(key, "ignoring stale update");
                return false;
            }
        }
        let mut updated = current.as_ref().clone();
        updated.insert(key.to_owned(), item);
        map.store(Arc::new(updated));
        true
    }
}

impl Default for InMemoryDataStore {
    fn default() -> Self {
        Self {
            flags: ArcSwap::new(Arc::new(HashMap::new())),
            segments: ArcSwap::new(Arc::new(HashMap::new())),
            init: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        }
    }
}

impl DataStore for InMemoryDataStore {
    fn init(&self, data: AllData) -> Result<(), StoreError> {
        let flags = data
            .flags
            .into_iter()
            .map(|(key, item)| (key, item.map(Arc::new)))
            .collect();
        let segments = data
            .segments
            .into_iter()
            .map(|(key, item)| (key, item.map(Arc::new)))
            .collect();
        let _guard = self.write_lock.lock();
        self.flags.store(Arc::new(flags));
        self.segments.store(Arc::new(segments));
        self.init.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn flag(&self, key: &str) -> Result<Option<Arc<Flag>>, StoreError> {
        Ok(self
            .flags
            .load()
            .get(key)
            .and_then(|entry| entry.item().cloned()))
    }

    fn segment(&self, key: &str) -> Result<Option<Arc<Segment>>, StoreError> {
        Ok(self
            .segments
            .load()
            .get(key)
            .and_then(|entry| entry.item().cloned()))
    }

    fn all_flags(&self) -> Result<HashMap<String, Arc<Flag>>, StoreError> {
        Ok(self
            .flags
            .load()
            .iter()
            .filter_map(|(key, entry)| entry.item().map(|flag| (key.clone(), Arc::clone(flag))))
            .collect())
    }

    fn upsert(&self, key: &str, item: PatchTarget) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();
        let applied = match item {
            PatchTarget::Flag(item) => {
                Self::upsert_map(&self.flags, key, item.map(Arc::new))
            }
            PatchTarget::Segment(item) => {
                Self::upsert_map(&self.segments, key, item.map(Arc::new))
            }
        };
        Ok(applied)
    }

    fn is_initialized(&self) -> bool {
        self.init.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::Flag, test_utils::FlagBuilder};

    fn flag_patch(key: &str, version: u64) -> PatchTarget {
        PatchTarget::Flag(StorageItem::Item(
            FlagBuilder::new(key).version(version).into_flag(),
        ))
    }

    fn init_data(flags: Vec<Flag>) -> AllData {
        AllData {
            flags: flags
                .into_iter()
                .map(|f| (f.key.clone(), StorageItem::Item(f)))
                .collect(),
            segments: HashMap::new(),
        }
    }

    #[test]
    fn starts_uninitialized_and_empty() {
        let store = InMemoryDataStore::new();
        assert!(!store.is_initialized());
        assert!(store.flag("any").unwrap().is_none());
        assert!(store.all_flags().unwrap().is_empty());
    }

    #[test]
    fn init_replaces_all_contents() {
        let store = InMemoryDataStore::new();
        store
            .init(init_data(vec![FlagBuilder::new("a").into_flag()]))
            .unwrap();
        assert!(store.is_initialized());
        assert!(store.flag("a").unwrap().is_some());

        store
            .init(init_data(vec![FlagBuilder::new("b").into_flag()]))
            .unwrap();
        assert!(store.flag("a").unwrap().is_none());
        assert!(store.flag("b").unwrap().is_some());
    }

    #[test]
    fn upsert_applies_only_newer_versions() {
        let store = InMemoryDataStore::new();
        assert!(store.upsert("f", flag_patch("f", 5)).unwrap());
        // equal and lower versions are rejected
        assert!(!store.upsert("f", flag_patch("f", 5)).unwrap());
        assert!(!store.upsert("f", flag_patch("f", 4)).unwrap());
        assert_eq!(5, store.flag("f").unwrap().unwrap().version);
        assert!(store.upsert("f", flag_patch("f", 6)).unwrap());
        assert_eq!(6, store.flag("f").unwrap().unwrap().version);
    }

    #[test]
    fn stored_version_is_maximum_ever_offered() {
        let store = InMemoryDataStore::new();
        for version in [3u64, 9, 1, 7, 9, 2].iter() {
            let _ = store.upsert("f", flag_patch("f", *version)).unwrap();
        }
        assert_eq!(9, store.flag("f").unwrap().unwrap().version);
    }

    #[test]
    fn tombstone_deletes_and_blocks_stale_resurrection() {
        let store = InMemoryDataStore::new();
        assert!(store.upsert("f", flag_patch("f", 2)).unwrap());
        assert!(store
            .upsert("f", PatchTarget::Flag(StorageItem::Tombstone(3)))
            .unwrap());
        assert!(store.flag("f").unwrap().is_none());
        assert!(store.all_flags().unwrap().is_empty());
        // a patch older than the tombstone must not resurrect the flag
        assert!(!store.upsert("f", flag_patch("f", 3)).unwrap());
        assert!(store.flag("f").unwrap().is_none());
        // a genuinely newer patch does
        assert!(store.upsert("f", flag_patch("f", 4)).unwrap());
        assert!(store.flag("f").unwrap().is_some());
    }

    #[test]
    fn tombstone_in_init_data_is_not_served() {
        let store = InMemoryDataStore::new();
        let mut data = init_data(vec![FlagBuilder::new("live").into_flag()]);
        data.flags
            .insert("dead".into(), StorageItem::Tombstone(8));
        store.init(data).unwrap();
        assert!(store.flag("live").unwrap().is_some());
        assert!(store.flag("dead").unwrap().is_none());
        assert_eq!(1, store.all_flags().unwrap().len());
    }

    #[test]
    fn segments_are_stored_separately_from_flags() {
        use crate::test_utils::SegmentBuilder;
        let store = InMemoryDataStore::new();
        let segment = SegmentBuilder::new("same-key").into_segment();
        store
            .upsert(
                "same-key",
                PatchTarget::Segment(StorageItem::Item(segment)),
            )
            .unwrap();
        assert!(store.segment("same-key").unwrap().is_some());
        assert!(store.flag("same-key").unwrap().is_none());
    }
}
