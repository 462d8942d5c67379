//! Context-key deduplication for index event synthesis.

use lru::LruCache;
use std::num::NonZeroUsize;

/// Tracks which contexts have already been described by an index event in
/// the current window. The dispatcher rotates it wholesale on the
/// context-keys flush interval, so eviction does not depend on insertion
/// order alone.
pub(crate) struct ContextKeyDedup {
    cache: LruCache<String, ()>,
}

impl ContextKeyDedup {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap()),
        }
    }

    /// Record the key; returns whether it was already known this window.
    pub(crate) fn notice(&mut self, canonical_key: &str) -> bool {
        self.cache.put(canonical_key.to_owned(), ()).is_some()
    }

    pub(crate) fn clear(&mut self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_is_new_repeat_is_not() {
        let mut dedup = ContextKeyDedup::new(10);
        assert!(!dedup.notice("user-a"));
        assert!(dedup.notice("user-a"));
        assert!(!dedup.notice("org:acme"));
    }

    #[test]
    fn rotation_forgets_everything() {
        let mut dedup = ContextKeyDedup::new(10);
        dedup.notice("user-a");
        dedup.clear();
        assert!(!dedup.notice("user-a"));
    }

    #[test]
    fn capacity_evicts_least_recent() {
        let mut dedup = ContextKeyDedup::new(2);
        dedup.notice("a");
        dedup.notice("b");
        dedup.notice("c");
        // "a" was evicted, so it reads as new again
        assert!(!dedup.notice("a"));
    }
}
