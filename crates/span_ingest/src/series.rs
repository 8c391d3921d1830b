//! Series fingerprints and the cache of fingerprints already written.

use fnv::FnvHasher;
use std::collections::HashSet;
use std::hash::Hasher;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Computes the series id of a set of low-cardinality tag pairs.
///
/// Pairs are hashed in key order, so the result does not depend on input
/// order. Each key and value is followed by a zero byte, which keeps
/// `("ab", "c")` and `("a", "bc")` apart.
pub fn series_id<'a, I>(pairs: I) -> u64
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut sorted: Vec<(&str, &str)> = pairs.into_iter().collect();
    sorted.sort_unstable();
    series_id_sorted(&sorted)
}

/// Like [`series_id`] for pairs already sorted by key.
pub fn series_id_sorted(sorted: &[(&str, &str)]) -> u64 {
    let mut hasher = FnvHasher::default();
    for (key, value) in sorted {
        hasher.write(key.as_bytes());
        hasher.write_u8(0);
        hasher.write(value.as_bytes());
        hasher.write_u8(0);
    }
    hasher.finish()
}

#[derive(Debug, Default)]
struct Entries {
    members: HashSet<u64>,
    /// Insertion order of `members`, oldest first
    order: Vec<u64>,
}

/// Set of series ids with insertion-ordered eviction.
///
/// The cache is advisory: losing an id only causes its meta rows to be
/// written again.
#[derive(Debug, Default)]
pub struct SeriesIdCache {
    entries: RwLock<Entries>,
}

impl SeriesIdCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, id: u64) -> bool {
        self.read().members.contains(&id)
    }

    /// Inserts `id`; a no-op if it is already cached.
    pub fn add(&self, id: u64) {
        let mut entries = self.write();
        if entries.members.insert(id) {
            entries.order.push(id);
        }
    }

    pub fn add_batch<I: IntoIterator<Item = u64>>(&self, ids: I) {
        let mut entries = self.write();
        for id in ids {
            if entries.members.insert(id) {
                entries.order.push(id);
            }
        }
    }

    /// Evicts the oldest half of the cached ids, returning how many were
    /// removed.
    pub fn clean_old_part(&self) -> usize {
        let mut entries = self.write();
        let mid = entries.order.len() / 2;
        let evicted: Vec<u64> = entries.order.drain(..mid).collect();
        for id in &evicted {
            entries.members.remove(id);
        }
        evicted.len()
    }

    pub fn len(&self) -> usize {
        self.read().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // A writer that panicked leaves the sets consistent: both are updated
    // together under one guard and neither operation can panic midway.
    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}
