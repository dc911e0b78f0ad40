//! Schedulable resources as they appear in the catalog.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::capability::{Capabilities, CapabilitySet};
use crate::pool::{PoolId, ResourcePool};

/// Identifier of a catalog resource: `<pool>/<device>`.
///
/// Prefixing with the pool id keeps device names from different pools
/// (e.g. two pools both exposing `aer_simulator`) from colliding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(pool: impl fmt::Display, device: impl fmt::Display) -> Self {
        Self(format!("{pool}/{device}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One schedulable device in a resource pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuantumResource {
    pub id: ResourceId,
    pub pool_id: PoolId,
    pub backend_kind: BackendKind,
    /// Device name inside the pool's backend.
    pub device: String,
    /// Capacity attribute (qubit count).
    pub capacity: u32,
    pub capabilities: CapabilitySet,
    /// In `[0.0, 1.0]`, higher is better.
    pub quality_score: f64,
    /// `>= 0`, lower is better.
    pub error_rate: f64,
    pub queue_depth: u32,
    /// Queue length at which the resource accepts no more batch assignments.
    pub queue_limit: u32,
    pub cost_weight: f64,
    /// Result of the most recent health probe.
    pub available: bool,
    pub last_updated: DateTime<Utc>,
}

impl QuantumResource {
    /// Builds a catalog entry from a device description and the pool it belongs to.
    ///
    /// Pool-level declarations narrow the device: capacity is the minimum of
    /// both, and a non-empty pool capability set is intersected with the
    /// device's. The entry starts unavailable until a probe says otherwise.
    pub fn from_device(pool: &ResourcePool, caps: &Capabilities, default_queue_limit: u32) -> Self {
        let descriptor = pool.descriptor();
        let capacity = descriptor
            .capacity
            .map_or(caps.capacity, |limit| limit.min(caps.capacity));
        let capabilities = match &descriptor.capability_set {
            Some(declared) if !declared.is_empty() => caps.capability_set.intersection(declared),
            _ => caps.capability_set.clone(),
        };
        let defaults = &descriptor.optimization_defaults;
        Self {
            id: ResourceId::new(&descriptor.pool_id, &caps.name),
            pool_id: descriptor.pool_id.clone(),
            backend_kind: descriptor.backend_kind.clone(),
            device: caps.name.clone(),
            capacity,
            capabilities,
            quality_score: caps.quality_score.clamp(0.0, 1.0),
            error_rate: caps.error_rate.max(0.0),
            queue_depth: 0,
            queue_limit: defaults.queue_limit.unwrap_or(default_queue_limit),
            cost_weight: defaults.cost_weight.unwrap_or(caps.cost_weight).max(0.0),
            available: false,
            last_updated: Utc::now(),
        }
    }

    /// Whether this entry is older than `ttl` at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_updated) > ttl
    }

    /// Remaining queue headroom once `inflight` locally dispatched tasks are counted.
    pub fn headroom(&self, inflight: u32) -> u32 {
        self.queue_limit
            .saturating_sub(self.queue_depth.saturating_add(inflight))
    }
}
