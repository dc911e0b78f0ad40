//! Short-lived cache of provider samples.
//!
//! Between refresh cycles the registry answers repeated availability probes
//! from this cache instead of calling the provider again. Entries older than
//! the TTL are never served: a lookup of an expired entry is a miss and the
//! entry is dropped.
//!
//! Uses `DashMap` so concurrent probes from many submissions do not contend
//! on a single lock. Ages are measured with `tokio::time::Instant`, so paused
//! test clocks apply.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;

use crate::backend::BackendAvailability;
use crate::resource::ResourceId;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    stored_at: Instant,
}

/// A TTL-bounded concurrent map.
#[derive(Debug)]
pub struct TtlCache<K: Eq + Hash, V> {
    entries: DashMap<K, Entry<V>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the value if it is younger than the TTL.
    pub fn get(&self, key: &K) -> Option<V> {
        let fresh = self.entries.get(key).and_then(|entry| {
            (entry.stored_at.elapsed() <= self.ttl).then(|| entry.value.clone())
        });
        match fresh {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.entries
                    .remove_if(key, |_, entry| entry.stored_at.elapsed() > self.ttl);
                None
            }
        }
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn remove(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drops every expired entry.
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.stored_at.elapsed() <= self.ttl);
        before - self.entries.len()
    }

    pub fn stats(&self) -> ValueCacheStats {
        let mut fresh = 0;
        let mut oldest = Duration::ZERO;
        for entry in self.entries.iter() {
            let age = entry.stored_at.elapsed();
            if age <= self.ttl {
                fresh += 1;
            }
            oldest = oldest.max(age);
        }
        ValueCacheStats {
            entries: self.entries.len(),
            fresh_entries: fresh,
            oldest_entry_age: (!self.entries.is_empty()).then_some(oldest),
            ttl: self.ttl,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Availability samples keyed by resource.
pub type ValueCache = TtlCache<ResourceId, BackendAvailability>;

/// Occupancy and age of a [`TtlCache`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValueCacheStats {
    pub entries: usize,
    pub fresh_entries: usize,
    pub oldest_entry_age: Option<Duration>,
    pub ttl: Duration,
    pub hits: u64,
    pub misses: u64,
}

impl ValueCacheStats {
    /// Hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Read-only view of every cache the scheduler owns, for operators.
#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
    pub values: ValueCacheStats,
    pub executor_handles: usize,
    pub snapshot_generation: u64,
    pub snapshot_resources: usize,
    pub snapshot_refreshed_at: Option<DateTime<Utc>>,
}
