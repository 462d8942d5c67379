//! Big-segment membership: segments whose context lists are too large to
//! ship in the streamed configuration and live in an external store instead.
//!
//! The evaluator only sees the [BigSegmentResolver] seam; the wrapper adds
//! context-hash computation, a short-lived membership cache, and staleness
//! tracking over the raw [BigSegmentStore] boundary.

use crate::eval::BigSegmentsStatus;
use base64::Engine;
use chrono::Utc;
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::{
    collections::HashSet,
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::warn;

#[derive(Clone, Debug, thiserror::Error)]
pub enum BigSegmentError {
    #[error("Big segment store error: {0}")]
    Store(String),
}

/// Membership of one context across all big segments, as returned by the
/// external oracle. Refs are `<segmentKey>.g<generation>`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Membership {
    included: HashSet<String>,
    excluded: HashSet<String>,
}

impl Membership {
    pub fn new<I, E>(included: I, excluded: E) -> Self
    where
        I: IntoIterator<Item = String>,
        E: IntoIterator<Item = String>,
    {
        Self {
            included: included.into_iter().collect(),
            excluded: excluded.into_iter().collect(),
        }
    }

    /// Explicit inclusion wins over explicit exclusion; `None` means the
    /// segment's own rules decide.
    pub fn check(&self, segment_ref: &str) -> Option<bool> {
        if self.included.contains(segment_ref) {
            Some(true)
        } else if self.excluded.contains(segment_ref) {
            Some(false)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct BigSegmentStoreMetadata {
    /// Epoch millis of the last time the backing data was written.
    pub last_up_to_date: Option<u64>,
}

/// External storage boundary for big-segment membership.
pub trait BigSegmentStore: Send + Sync {
    fn get_metadata(&self) -> Result<BigSegmentStoreMetadata, BigSegmentError>;

    /// Look up membership by hashed context key; `None` means the context is
    /// in no big segment.
    fn get_membership(&self, context_hash: &str) -> Result<Option<Membership>, BigSegmentError>;
}

/// What the evaluator asks during `segmentMatch` on an unbounded segment.
pub trait BigSegmentResolver: Send + Sync {
    fn query(&self, context_key: &str) -> (Option<Membership>, BigSegmentsStatus);
}

/// Point-in-time health of the big segment store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BigSegmentStoreStatus {
    pub available: bool,
    pub stale: bool,
}

/// Caching layer over a [BigSegmentStore].
///
/// Metadata is probed at most once per `status_poll_interval`; memberships
/// are cached per context key with a TTL so a burst of evaluations for the
/// same context costs one oracle round-trip.
pub struct BigSegmentStoreWrapper {
    store: Arc<dyn BigSegmentStore>,
    stale_after: Duration,
    status_poll_interval: Duration,
    membership_ttl: Duration,
    cache: Mutex<LruCache<String, (Instant, Option<Membership>)>>,
    last_status: Mutex<Option<(Instant, BigSegmentStoreStatus)>>,
}

impl BigSegmentStoreWrapper {
    pub fn new(
        store: Arc<dyn BigSegmentStore>,
        stale_after: Duration,
        context_cache_capacity: usize,
        membership_ttl: Duration,
    ) -> Self {
        let capacity = NonZeroUsize::new(context_cache_capacity.max(1)).unwrap();
        Self {
            store,
            stale_after,
            status_poll_interval: Duration::from_secs(5),
            membership_ttl,
            cache: Mutex::new(LruCache::new(capacity)),
            last_status: Mutex::new(None),
        }
    }

    /// Current store health, re-probing the metadata when the cached probe
    /// has aged out.
    pub fn status(&self) -> BigSegmentStoreStatus {
        let mut last = self.last_status.lock();
        if let Some((at, status)) = *last {
            if at.elapsed() < self.status_poll_interval {
                return status;
            }
        }
        let status = match self.store.get_metadata() {
            Ok(metadata) => BigSegmentStoreStatus {
                available: true,
                stale: self.is_stale(metadata.last_up_to_date),
            },
            Err(error) => {
                warn!(%error, "big segment store metadata probe failed");
                BigSegmentStoreStatus {
                    available: false,
                    stale: false,
                }
            }
        };
        *last = Some((Instant::now(), status));
        status
    }

    fn is_stale(&self, last_up_to_date: Option<u64>) -> bool {
        let last = match last_up_to_date {
            Some(millis) => millis,
            // a store that has never been written is as good as stale
            None => return true,
        };
        let now = Utc::now().timestamp_millis().max(0) as u64;
        now.saturating_sub(last) > self.stale_after.as_millis() as u64
    }

    fn membership_for(&self, context_key: &str) -> Result<Option<Membership>, BigSegmentError> {
        {
            let mut cache = self.cache.lock();
            if let Some((at, membership)) = cache.get(context_key) {
                if at.elapsed() < self.membership_ttl {
                    return Ok(membership.clone());
                }
            }
        }
        let membership = self.store.get_membership(&hash_context_key(context_key))?;
        self.cache
            .lock()
            .put(context_key.to_owned(), (Instant::now(), membership.clone()));
        Ok(membership)
    }
}

impl BigSegmentResolver for BigSegmentStoreWrapper {
    fn query(&self, context_key: &str) -> (Option<Membership>, BigSegmentsStatus) {
        match self.membership_for(context_key) {
            Ok(membership) => {
                let status = self.status();
                let eval_status = if !status.available {
                    BigSegmentsStatus::StoreError
                } else if status.stale {
                    BigSegmentsStatus::Stale
                } else {
                    BigSegmentsStatus::Healthy
                };
                (membership, eval_status)
            }
            Err(error) => {
                warn!(%error, context_key, "big segment membership query failed");
                (None, BigSegmentsStatus::StoreError)
            }
        }
    }
}

/// Contexts are identified to the oracle by an irreversible hash of their
/// key: base64 of SHA-256 over the UTF-8 bytes.
pub fn hash_context_key(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(digest)
}
