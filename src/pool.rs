//! Resource pools and backend configuration fingerprints.
//!
//! A pool groups the devices exposed by one backend configuration. Two pools
//! with the same backend kind and identical configuration share one
//! [`ExecutorHandle`](crate::registry::ExecutorHandle); the
//! [`ConfigFingerprint`] is what makes them identical.

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::capability::CapabilitySet;

/// Backend configuration as given in the pool descriptor.
///
/// A `BTreeMap` so that serialization, and therefore the fingerprint, does not
/// depend on insertion order.
pub type BackendConfig = BTreeMap<String, serde_json::Value>;

/// Identifier of a resource pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolId(pub String);

impl PoolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PoolId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-pool overrides applied to every resource the pool contributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationDefaults {
    /// Overrides the device-reported cost.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_weight: Option<f64>,
    /// Queue length beyond which batch selection stops assigning to a resource.
    /// Unset, the limit follows the reported queue plus `default_queue_limit`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_limit: Option<u32>,
}

/// Resource pool descriptor, consumed by
/// [`ResourceCatalog::register_pool`](crate::catalog::ResourceCatalog::register_pool).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolDescriptor {
    pub pool_id: PoolId,
    pub backend_kind: BackendKind,
    #[serde(default)]
    pub backend_config: BackendConfig,
    /// Upper bound on the capacity of any resource in this pool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
    /// When set and non-empty, restricts the capabilities of the pool's resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_set: Option<CapabilitySet>,
    #[serde(default)]
    pub optimization_defaults: OptimizationDefaults,
}

impl PoolDescriptor {
    pub fn new(pool_id: impl Into<String>, backend_kind: BackendKind) -> Self {
        Self {
            pool_id: PoolId::new(pool_id),
            backend_kind,
            backend_config: BackendConfig::new(),
            capacity: None,
            capability_set: None,
            optimization_defaults: OptimizationDefaults::default(),
        }
    }

    /// Adds a backend configuration entry.
    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.backend_config.insert(key.into(), value);
        self
    }

    pub fn with_optimization_defaults(mut self, defaults: OptimizationDefaults) -> Self {
        self.optimization_defaults = defaults;
        self
    }
}

/// Stable hash of a backend kind plus its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigFingerprint(pub u64);

impl ConfigFingerprint {
    pub fn compute(kind: &BackendKind, config: &BackendConfig) -> Self {
        let mut hasher = FxHasher::default();
        kind.hash(&mut hasher);
        for (key, value) in config {
            key.hash(&mut hasher);
            // serde_json maps are ordered, so nested objects serialize canonically.
            value.to_string().hash(&mut hasher);
        }
        Self(hasher.finish())
    }
}

impl fmt::Display for ConfigFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A registered pool: its descriptor and derived fingerprint.
#[derive(Debug, Clone)]
pub struct ResourcePool {
    descriptor: PoolDescriptor,
    fingerprint: ConfigFingerprint,
}

impl ResourcePool {
    pub fn new(descriptor: PoolDescriptor) -> Self {
        let fingerprint =
            ConfigFingerprint::compute(&descriptor.backend_kind, &descriptor.backend_config);
        Self {
            descriptor,
            fingerprint,
        }
    }

    pub fn id(&self) -> &PoolId {
        &self.descriptor.pool_id
    }

    pub fn backend_kind(&self) -> &BackendKind {
        &self.descriptor.backend_kind
    }

    pub fn backend_config(&self) -> &BackendConfig {
        &self.descriptor.backend_config
    }

    pub fn fingerprint(&self) -> ConfigFingerprint {
        self.fingerprint
    }

    pub fn descriptor(&self) -> &PoolDescriptor {
        &self.descriptor
    }
}
