//! Operational counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Which backend served a hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitSource {
    Remote,
    Local,
}

/// Process-wide cache counters, updated lock-free
#[derive(Debug, Default)]
pub struct CacheStats {
    remote_hits: AtomicU64,
    local_hits: AtomicU64,
    negative_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    clears: AtomicU64,
    errors: AtomicU64,
    coalesced: AtomicU64,
    failovers: AtomicU64,
}

/// Point-in-time copy of [`CacheStats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub remote_hits: u64,
    pub local_hits: u64,
    /// Subset of the hits above that decoded to "no result"
    pub negative_hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub clears: u64,
    pub errors: u64,
    /// Callers that joined an in-flight source query instead of issuing one
    pub coalesced: u64,
    pub failovers: u64,
    pub hit_rate: f64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_hit(&self, source: HitSource, negative: bool) {
        match source {
            HitSource::Remote => self.remote_hits.fetch_add(1, Ordering::Relaxed),
            HitSource::Local => self.local_hits.fetch_add(1, Ordering::Relaxed),
        };
        if negative {
            self.negative_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_set(&self) {
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_clears(&self, n: u64) {
        self.clears.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failover(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let remote_hits = self.remote_hits.load(Ordering::Relaxed);
        let local_hits = self.local_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let hits = remote_hits + local_hits;
        let total = hits + misses;
        StatsSnapshot {
            remote_hits,
            local_hits,
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            misses,
            sets: self.sets.load(Ordering::Relaxed),
            clears: self.clears.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}
