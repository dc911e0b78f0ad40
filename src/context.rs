//! Shared state of one scheduler instance.
//!
//! There are no process globals: the catalog, executor registry, sample
//! cache, metrics log and in-flight overlay all hang off a
//! [`SchedulerContext`], which the scheduler and the monitor share through an
//! `Arc`.

use std::sync::Arc;

use tracing::info;

use crate::cache::{CacheInfo, ValueCache};
use crate::catalog::ResourceCatalog;
use crate::compute::ComputePlane;
use crate::config::SchedulerConfig;
use crate::error::SchedulerResult;
use crate::metrics::MetricsLog;
use crate::registry::ExecutorRegistry;
use crate::selector::{InflightLoad, ResourceSelector};

#[derive(Debug)]
pub struct SchedulerContext<W> {
    config: SchedulerConfig,
    catalog: ResourceCatalog,
    registry: Arc<ExecutorRegistry<W>>,
    values: Arc<ValueCache>,
    selector: ResourceSelector,
    inflight: InflightLoad,
    metrics: MetricsLog,
    compute: ComputePlane,
}

impl<W: Send + Sync + 'static> SchedulerContext<W> {
    pub fn new(config: SchedulerConfig, metrics: MetricsLog, compute: ComputePlane) -> SchedulerResult<Self> {
        config.validate()?;
        let values = Arc::new(ValueCache::new(config.cache_ttl()));
        let registry = Arc::new(ExecutorRegistry::new(
            Arc::clone(&values),
            config.probe_failure_threshold,
            config.provider_timeout(),
        ));
        let selector = ResourceSelector::new(
            config.scoring_weights,
            config.cache_ttl(),
            config.exact_match_limit,
        );
        info!(
            mode = ?config.optimization_mode,
            cache_ttl_secs = config.cache_ttl_seconds,
            monitor_interval_secs = config.monitor_interval_seconds,
            "Scheduler context initialized"
        );
        Ok(Self {
            config,
            catalog: ResourceCatalog::new(),
            registry,
            values,
            selector,
            inflight: InflightLoad::new(),
            metrics,
            compute,
        })
    }

    /// Replaces the selector, e.g. to plug in a custom scorer or matcher.
    pub fn with_selector(mut self, selector: ResourceSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn catalog(&self) -> &ResourceCatalog {
        &self.catalog
    }

    pub fn registry(&self) -> &Arc<ExecutorRegistry<W>> {
        &self.registry
    }

    pub fn values(&self) -> &Arc<ValueCache> {
        &self.values
    }

    pub fn selector(&self) -> &ResourceSelector {
        &self.selector
    }

    pub fn inflight(&self) -> &InflightLoad {
        &self.inflight
    }

    pub fn metrics(&self) -> &MetricsLog {
        &self.metrics
    }

    pub fn compute(&self) -> &ComputePlane {
        &self.compute
    }

    pub fn cache_info(&self) -> CacheInfo {
        let snapshot = self.catalog.current();
        CacheInfo {
            values: self.values.stats(),
            executor_handles: self.registry.handle_count(),
            snapshot_generation: snapshot.generation(),
            snapshot_resources: snapshot.len(),
            snapshot_refreshed_at: snapshot.refreshed_at(),
        }
    }

    /// Drops cached handles and samples. The catalog snapshot is kept.
    pub fn clear_cache(&self) {
        self.registry.clear_cache();
    }

    /// Releases cached state and flushes the metrics log.
    pub fn shutdown(&self) {
        self.clear_cache();
        self.metrics.flush();
        info!(records = self.metrics.appended(), "Scheduler context shut down");
    }
}
