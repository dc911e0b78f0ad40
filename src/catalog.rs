//! Resource catalog: the single source of truth the selector reads.
//!
//! The catalog holds the registered pools and a pointer to the current
//! [`CatalogSnapshot`]. Snapshots are immutable and replaced wholesale; the
//! pointer lives in a `tokio::sync::watch` channel, so a reader either gets
//! the previous complete snapshot or the next complete one, never a mix.
//!
//! ```text
//!   BackgroundMonitor ──build──→ CatalogSnapshot ──publish──→ ResourceCatalog
//!                                                                 │
//!                           selections ←──current() (Arc clone)───┘
//! ```

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::pool::{PoolDescriptor, PoolId, ResourcePool};
use crate::resource::{QuantumResource, ResourceId};

/// Immutable point-in-time view of every known resource.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    resources: FxHashMap<ResourceId, QuantumResource>,
    generation: u64,
    refreshed_at: Option<DateTime<Utc>>,
}

impl CatalogSnapshot {
    /// The generation-0 snapshot a catalog starts with.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(generation: u64, resources: impl IntoIterator<Item = QuantumResource>) -> Self {
        Self {
            resources: resources.into_iter().map(|r| (r.id.clone(), r)).collect(),
            generation,
            refreshed_at: Some(Utc::now()),
        }
    }

    pub fn get(&self, id: &ResourceId) -> Option<&QuantumResource> {
        self.resources.get(id)
    }

    pub fn resources(&self) -> impl Iterator<Item = &QuantumResource> {
        self.resources.values()
    }

    pub fn in_pool<'a>(&'a self, pool: &'a PoolId) -> impl Iterator<Item = &'a QuantumResource> {
        self.resources.values().filter(move |r| &r.pool_id == pool)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.refreshed_at
    }

    /// Whether any snapshot has ever been published.
    pub fn is_bootstrapped(&self) -> bool {
        self.generation > 0
    }

    /// Number of entries older than `ttl` at `now`.
    pub fn stale_count(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> usize {
        self.resources
            .values()
            .filter(|r| r.is_stale(now, ttl))
            .count()
    }

    /// A copy without the resources of `pool`, at the given generation.
    fn without_pool(&self, pool: &PoolId, generation: u64) -> Self {
        Self {
            resources: self
                .resources
                .iter()
                .filter(|(_, r)| &r.pool_id != pool)
                .map(|(id, r)| (id.clone(), r.clone()))
                .collect(),
            generation,
            refreshed_at: self.refreshed_at,
        }
    }
}

/// Registered pools plus the current snapshot pointer.
#[derive(Debug)]
pub struct ResourceCatalog {
    snapshot: watch::Sender<Arc<CatalogSnapshot>>,
    pools: RwLock<FxHashMap<PoolId, ResourcePool>>,
}

impl Default for ResourceCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceCatalog {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(Arc::new(CatalogSnapshot::empty()));
        Self {
            snapshot,
            pools: RwLock::new(FxHashMap::default()),
        }
    }

    /// The latest published snapshot. O(1): clones an `Arc`.
    pub fn current(&self) -> Arc<CatalogSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// Observes every publication.
    pub fn subscribe(&self) -> watch::Receiver<Arc<CatalogSnapshot>> {
        self.snapshot.subscribe()
    }

    /// Atomically replaces the current snapshot.
    ///
    /// Returns `false` and keeps the current snapshot when `snapshot` is not
    /// newer, so a slow refresh can never overwrite a faster later one.
    pub fn publish(&self, snapshot: CatalogSnapshot) -> bool {
        let generation = snapshot.generation;
        let resources = snapshot.len();
        let published = self.snapshot.send_if_modified(|current| {
            if snapshot.generation > current.generation {
                *current = Arc::new(snapshot);
                true
            } else {
                false
            }
        });
        if published {
            debug!(generation, resources, "Catalog snapshot published");
        } else {
            debug!(generation, "Discarded out-of-date catalog snapshot");
        }
        published
    }

    /// Generation a new snapshot should carry.
    pub fn next_generation(&self) -> u64 {
        self.snapshot.borrow().generation + 1
    }

    /// Adds or replaces a pool. Its resources appear on the next refresh.
    pub fn register_pool(&self, descriptor: PoolDescriptor) -> ResourcePool {
        let pool = ResourcePool::new(descriptor);
        info!(
            pool = %pool.id(),
            backend = %pool.backend_kind(),
            fingerprint = %pool.fingerprint(),
            "Registered resource pool"
        );
        self.pools
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pool.id().clone(), pool.clone());
        pool
    }

    /// Removes a pool and immediately prunes its resources from the catalog.
    pub fn deregister_pool(&self, pool_id: &PoolId) -> Option<ResourcePool> {
        let removed = self
            .pools
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(pool_id);
        if removed.is_some() {
            self.snapshot.send_if_modified(|current| {
                if current.in_pool(pool_id).next().is_none() {
                    return false;
                }
                let pruned = current.without_pool(pool_id, current.generation + 1);
                *current = Arc::new(pruned);
                true
            });
            info!(pool = %pool_id, "Deregistered resource pool");
        }
        removed
    }

    pub fn pool(&self, pool_id: &PoolId) -> Option<ResourcePool> {
        self.pools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(pool_id)
            .cloned()
    }

    /// All registered pools, sorted by id.
    pub fn pools(&self) -> Vec<ResourcePool> {
        let mut pools: Vec<_> = self
            .pools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        pools.sort_by(|a, b| a.id().cmp(b.id()));
        pools
    }

    pub fn has_pools(&self) -> bool {
        !self
            .pools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }
}
