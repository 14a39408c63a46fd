//! Coordinator counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters shared by the components of one coordinator
#[derive(Debug, Default)]
pub(crate) struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    fetch_failures: AtomicU64,
    mutation_failures: AtomicU64,
    group_evictions: AtomicU64,
    evicted_entries: AtomicU64,
    discarded_results: AtomicU64,
}

impl CacheStats {
    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fetch_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_mutation_failure(&self) {
        self.mutation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_eviction(&self, entries: usize) {
        self.group_evictions.fetch_add(1, Ordering::Relaxed);
        self.evicted_entries.fetch_add(entries as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self) {
        self.discarded_results.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            mutation_failures: self.mutation_failures.load(Ordering::Relaxed),
            group_evictions: self.group_evictions.load(Ordering::Relaxed),
            evicted_entries: self.evicted_entries.load(Ordering::Relaxed),
            discarded_results: self.discarded_results.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the coordinator counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    /// Reads answered from a resolved entry
    pub hits: u64,
    /// Reads that issued an underlying fetch
    pub misses: u64,
    /// Reads that attached to an in-flight fetch
    pub coalesced: u64,
    /// Underlying fetches that failed or were aborted
    pub fetch_failures: u64,
    /// Mutations that failed (and therefore evicted nothing)
    pub mutation_failures: u64,
    /// Number of group evictions, including evictions of empty groups
    pub group_evictions: u64,
    /// Entries removed by group evictions
    pub evicted_entries: u64,
    /// Fetch results not stored because their group was evicted mid-flight
    pub discarded_results: u64,
}
