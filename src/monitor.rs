//! Background catalog refresh.
//!
//! # Architecture
//!
//! One refresh cycle:
//! 1. Takes the registered pools and resolves each pool's executor handle
//! 2. Queries every described device concurrently, each call bounded by the
//!    provider timeout
//! 3. Builds a brand-new [`CatalogSnapshot`] and publishes it atomically
//!
//! A device whose query fails keeps its previous entry, with the old
//! `last_updated`, so it goes stale and the selector stops picking it. If
//! every pool fails, nothing is published and the previous snapshot stays.
//!
//! The periodic loop is a cancellable task owned by a [`MonitorHandle`]:
//!
//! ```ignore
//! let handle = BackgroundMonitor::new(ctx).spawn(Duration::from_secs(60));
//! // ...
//! handle.stop().await;
//! ```
//!
//! Between two cycles a catalog entry is at most
//! `interval + provider_timeout` old ([`BackgroundMonitor::staleness_bound`]).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::BackendAvailability;
use crate::catalog::CatalogSnapshot;
use crate::context::SchedulerContext;
use crate::error::HalResult;
use crate::pool::PoolId;
use crate::resource::QuantumResource;

/// A failed bootstrap, or a wake-up from selection, does not start another
/// refresh sooner than this after the previous one.
pub const REFRESH_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Outcome of one refresh cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub pools: usize,
    pub failed_pools: Vec<PoolId>,
    pub resources: usize,
    /// Entries carried over from the previous snapshot after a failed query.
    pub carried_over: usize,
    /// Generation published, if any.
    pub generation: Option<u64>,
}

impl RefreshReport {
    pub fn published(&self) -> bool {
        self.generation.is_some()
    }
}

/// Refreshes the catalog from the providers.
pub struct BackgroundMonitor<W> {
    ctx: Arc<SchedulerContext<W>>,
    refresh_lock: Mutex<Option<Instant>>,
    wake: Notify,
}

impl<W: Send + Sync + 'static> BackgroundMonitor<W> {
    pub fn new(ctx: Arc<SchedulerContext<W>>) -> Self {
        Self {
            ctx,
            refresh_lock: Mutex::new(None),
            wake: Notify::new(),
        }
    }

    /// Upper bound on entry age while the loop runs at `interval`.
    pub fn staleness_bound(&self, interval: Duration) -> Duration {
        interval + self.ctx.config().provider_timeout()
    }

    /// Runs one refresh cycle. Concurrent callers are serialized.
    pub async fn refresh_once(&self) -> RefreshReport {
        let mut last = self.refresh_lock.lock().await;
        let report = self.refresh().await;
        *last = failed_at(&report);
        report
    }

    /// Prepares the catalog for selection without waiting on the loop.
    ///
    /// On cold start (pools registered, nothing published yet) this refreshes
    /// synchronously. Callers that queued behind a bootstrap which already
    /// published return without starting another one. Stale entries only wake
    /// the loop: selection fails closed on them until a cycle republishes.
    pub async fn ensure_fresh(&self) {
        let catalog = self.ctx.catalog();
        let seen = catalog.current();
        if seen.is_bootstrapped() {
            if self.has_stale(&seen) {
                self.wake.notify_one();
            }
            return;
        }
        if !catalog.has_pools() {
            return;
        }

        let mut last = self.refresh_lock.lock().await;
        if catalog.current().is_bootstrapped() {
            return;
        }
        if last.is_some_and(|at| at.elapsed() < REFRESH_RETRY_BACKOFF) {
            return;
        }

        debug!("Catalog never published, bootstrapping before selection");
        let report = self.refresh().await;
        *last = failed_at(&report);
        if !report.published() {
            warn!(failed_pools = report.failed_pools.len(), "Bootstrap catalog refresh published nothing");
        }
    }

    fn has_stale(&self, snapshot: &CatalogSnapshot) -> bool {
        let ttl = chrono::Duration::from_std(self.ctx.config().cache_ttl())
            .unwrap_or_else(|_| chrono::Duration::weeks(5200));
        snapshot.stale_count(Utc::now(), ttl) > 0
    }

    async fn refresh(&self) -> RefreshReport {
        let ctx = &self.ctx;
        let catalog = ctx.catalog();
        let pools = catalog.pools();
        let previous = catalog.current();
        let purged = ctx.values().purge_expired();
        if purged > 0 {
            debug!(purged, "Dropped expired availability samples");
        }
        let mut report = RefreshReport {
            pools: pools.len(),
            ..RefreshReport::default()
        };
        if pools.is_empty() {
            debug!("No resource pools registered, skipping refresh");
            return report;
        }

        let mut queries: JoinSet<(usize, HalResult<BackendAvailability>)> = JoinSet::new();
        let mut devices: Vec<QuantumResource> = Vec::new();
        let mut pool_of_device: Vec<usize> = Vec::new();
        let mut handle_failed = vec![false; pools.len()];
        let mut described_per_pool = vec![0usize; pools.len()];

        for (p, pool) in pools.iter().enumerate() {
            let handle = match ctx.registry().handle_for(pool) {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(pool = %pool.id(), error = %e, "Cannot resolve executor for pool");
                    handle_failed[p] = true;
                    continue;
                }
            };
            described_per_pool[p] = handle.backend().describe().len();
            for caps in handle.backend().describe() {
                let resource =
                    QuantumResource::from_device(pool, caps, ctx.config().default_queue_limit);
                let index = devices.len();
                let registry = Arc::clone(ctx.registry());
                let handle = handle.clone();
                let id = resource.id.clone();
                let device = caps.name.clone();
                queries.spawn(async move {
                    let sample = registry.sample(&handle, &id, &device).await;
                    (index, sample)
                });
                devices.push(resource);
                pool_of_device.push(p);
            }
        }

        let mut samples: FxHashMap<usize, HalResult<BackendAvailability>> = FxHashMap::default();
        while let Some(joined) = queries.join_next().await {
            match joined {
                Ok((index, sample)) => {
                    samples.insert(index, sample);
                }
                Err(e) => warn!(error = %e, "Availability query task failed"),
            }
        }

        let now = Utc::now();
        let mut fresh_per_pool = vec![0usize; pools.len()];
        let mut resources = Vec::with_capacity(devices.len());
        for (index, mut resource) in devices.into_iter().enumerate() {
            match samples.remove(&index) {
                Some(Ok(sample)) => {
                    apply_sample(&mut resource, &sample);
                    let declared = pools[pool_of_device[index]]
                        .descriptor()
                        .optimization_defaults
                        .queue_limit;
                    if declared.is_none() {
                        resource.queue_limit = resource
                            .queue_depth
                            .saturating_add(ctx.config().default_queue_limit);
                    }
                    resource.last_updated = now;
                    fresh_per_pool[pool_of_device[index]] += 1;
                    resources.push(resource);
                }
                _ => {
                    if let Some(old) = previous.get(&resource.id) {
                        report.carried_over += 1;
                        resources.push(old.clone());
                    }
                }
            }
        }

        for (p, pool) in pools.iter().enumerate() {
            if handle_failed[p] || (described_per_pool[p] > 0 && fresh_per_pool[p] == 0) {
                report.failed_pools.push(pool.id().clone());
                // Keep whatever the pool had, including devices no longer described.
                for old in previous.in_pool(pool.id()) {
                    if !resources.iter().any(|r| r.id == old.id) {
                        report.carried_over += 1;
                        resources.push(old.clone());
                    }
                }
            }
        }

        if report.failed_pools.len() == pools.len() {
            warn!(pools = pools.len(), "Every pool failed to refresh, keeping previous snapshot");
            return report;
        }

        // Pools deregistered while the queries ran must not come back.
        resources.retain(|r| catalog.pool(&r.pool_id).is_some());
        report.resources = resources.len();

        let generation = catalog.next_generation();
        if catalog.publish(CatalogSnapshot::new(generation, resources)) {
            report.generation = Some(generation);
            info!(
                generation,
                resources = report.resources,
                failed_pools = report.failed_pools.len(),
                carried_over = report.carried_over,
                "Catalog refreshed"
            );
        }
        report
    }

    /// Runs refresh cycles every `interval` until `shutdown` is cancelled.
    ///
    /// The first cycle runs immediately. Selection reading stale entries
    /// wakes the loop for an early cycle.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        info!(
            interval_secs = interval.as_secs(),
            staleness_bound_secs = self.staleness_bound(interval).as_secs(),
            "Background monitor starting"
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_cycle: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Background monitor shutting down");
                    break;
                }

                _ = ticker.tick() => {
                    let report = self.refresh_once().await;
                    last_cycle = Some(Instant::now());
                    debug!(
                        published = report.published(),
                        resources = report.resources,
                        "Monitor cycle finished"
                    );
                }

                _ = self.wake.notified() => {
                    if last_cycle.is_some_and(|at| at.elapsed() < REFRESH_RETRY_BACKOFF) {
                        debug!("Ignoring wake-up, a cycle just ran");
                    } else {
                        let report = self.refresh_once().await;
                        last_cycle = Some(Instant::now());
                        debug!(
                            published = report.published(),
                            "Woken cycle finished"
                        );
                    }
                }
            }
        }
    }

    /// Spawns [`run`](Self::run) on the current runtime.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> MonitorHandle {
        let token = CancellationToken::new();
        let join = tokio::spawn(Arc::clone(&self).run(interval, token.clone()));
        MonitorHandle { token, join }
    }
}

/// When a refresh that published nothing happened, for the retry backoff.
fn failed_at(report: &RefreshReport) -> Option<Instant> {
    (!report.published() && report.pools > 0).then(Instant::now)
}

/// Applies a fresh sample. Live calibration overrides the static description.
fn apply_sample(resource: &mut QuantumResource, sample: &BackendAvailability) {
    resource.available = sample.is_available;
    resource.queue_depth = sample.queue_depth.unwrap_or(0);
    if let Some(quality) = sample.quality_score {
        resource.quality_score = quality.clamp(0.0, 1.0);
    }
    if let Some(error_rate) = sample.error_rate {
        resource.error_rate = error_rate.max(0.0);
    }
}

/// Owner of a running monitor loop.
#[derive(Debug)]
pub struct MonitorHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn is_running(&self) -> bool {
        !self.join.is_finished()
    }

    /// Signals the loop to exit without waiting for it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancels the loop and waits for it to exit.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.join.await {
            warn!(error = %e, "Background monitor task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::capability::Capabilities;
    use crate::compute::ComputePlane;
    use crate::config::SchedulerConfig;
    use crate::error::HalError;
    use crate::metrics::MetricsLog;
    use crate::pool::PoolDescriptor;
    use crate::resource::ResourceId;
    use crate::simulator::SimulatorBackend;

    fn setup(
        kinds: &[(&str, Arc<SimulatorBackend>)],
    ) -> (Arc<SchedulerContext<()>>, Arc<BackgroundMonitor<()>>) {
        let ctx = Arc::new(
            SchedulerContext::new(
                SchedulerConfig::default(),
                MetricsLog::default(),
                ComputePlane::current().unwrap(),
            )
            .unwrap(),
        );
        for (pool, sim) in kinds {
            let kind = BackendKind::new(format!("sim-{pool}"));
            ctx.registry().register_factory(kind.clone(), sim.shared_factory::<()>());
            ctx.catalog().register_pool(PoolDescriptor::new(*pool, kind));
        }
        let monitor = Arc::new(BackgroundMonitor::new(Arc::clone(&ctx)));
        (ctx, monitor)
    }

    fn sim(devices: &[&str]) -> Arc<SimulatorBackend> {
        Arc::new(SimulatorBackend::new(
            devices.iter().map(|d| Capabilities::simulator(*d, 8)).collect(),
        ))
    }

    #[tokio::test]
    async fn test_refresh_publishes_new_snapshot() {
        let a = sim(&["x", "y"]);
        a.set_queue_depth("y", 4);
        a.set_calibration("x", 0.7, 0.02);
        let (ctx, monitor) = setup(&[("pool-a", a)]);

        let report = monitor.refresh_once().await;
        assert_eq!(report.generation, Some(1));
        assert_eq!(report.resources, 2);

        let snap = ctx.catalog().current();
        let x = snap.get(&ResourceId::new("pool-a", "x")).unwrap();
        assert!(x.available);
        assert_eq!(x.quality_score, 0.7);
        let y = snap.get(&ResourceId::new("pool-a", "y")).unwrap();
        assert_eq!(y.queue_depth, 4);
        assert_eq!(y.queue_limit, 4 + ctx.config().default_queue_limit);
        assert_eq!(ctx.values().stats().entries, 2);
    }

    #[tokio::test]
    async fn test_failing_pool_keeps_previous_entries() {
        let a = sim(&["x"]);
        let b = sim(&["y"]);
        let (ctx, monitor) = setup(&[("pool-a", Arc::clone(&a)), ("pool-b", Arc::clone(&b))]);
        monitor.refresh_once().await;
        let before = ctx.catalog().current();
        let old_b = before.get(&ResourceId::new("pool-b", "y")).unwrap().last_updated;

        b.fail_provider(Some(HalError::BackendUnavailable("maintenance".into())));
        let report = monitor.refresh_once().await;
        assert_eq!(report.failed_pools, vec![PoolId::from("pool-b")]);
        assert_eq!(report.carried_over, 1);

        let after = ctx.catalog().current();
        assert_eq!(after.generation(), 2);
        assert_eq!(after.get(&ResourceId::new("pool-b", "y")).unwrap().last_updated, old_b);
    }

    #[tokio::test]
    async fn test_all_pools_failing_publishes_nothing() {
        let a = sim(&["x"]);
        let (ctx, monitor) = setup(&[("pool-a", Arc::clone(&a))]);
        monitor.refresh_once().await;

        a.fail_provider(Some(HalError::Timeout("down".into())));
        let report = monitor.refresh_once().await;
        assert!(!report.published());
        assert_eq!(ctx.catalog().current().generation(), 1);
    }

    #[tokio::test]
    async fn test_unknown_kind_pool_is_skipped() {
        let a = sim(&["x"]);
        let (ctx, monitor) = setup(&[("pool-a", a)]);
        ctx.catalog()
            .register_pool(PoolDescriptor::new("pool-q", BackendKind::new("unregistered")));
        let report = monitor.refresh_once().await;
        assert!(report.published());
        assert_eq!(report.failed_pools, vec![PoolId::from("pool-q")]);
        assert_eq!(ctx.catalog().current().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_drops_expired_samples() {
        let a = sim(&["x"]);
        let (ctx, monitor) = setup(&[("pool-a", a)]);
        ctx.values().insert(
            ResourceId::new("gone", "x"),
            BackendAvailability::always_available(),
        );
        monitor.refresh_once().await;
        assert_eq!(ctx.values().stats().entries, 2);

        tokio::time::advance(ctx.config().cache_ttl() + Duration::from_secs(1)).await;
        monitor.refresh_once().await;
        assert_eq!(ctx.values().stats().entries, 1);
        assert!(ctx.values().get(&ResourceId::new("pool-a", "x")).is_some());
    }

    #[tokio::test]
    async fn test_ensure_fresh_bootstraps_once() {
        let a = sim(&["x"]);
        let (ctx, monitor) = setup(&[("pool-a", Arc::clone(&a))]);

        tokio::join!(monitor.ensure_fresh(), monitor.ensure_fresh());
        assert_eq!(ctx.catalog().current().generation(), 1);
        assert_eq!(a.availability_calls(), 1);

        // Fresh snapshot: no further provider calls.
        monitor.ensure_fresh().await;
        assert_eq!(a.availability_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_entries_wake_the_loop() {
        let a = sim(&["x"]);
        let (ctx, monitor) = setup(&[("pool-a", Arc::clone(&a))]);
        let handle = Arc::clone(&monitor).spawn(Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ctx.catalog().current().generation(), 1);

        let catalog = ctx.catalog();
        let aged: Vec<_> = catalog
            .current()
            .resources()
            .map(|r| {
                let mut r = r.clone();
                r.last_updated -= chrono::Duration::hours(1);
                r
            })
            .collect();
        assert!(catalog.publish(CatalogSnapshot::new(2, aged)));
        tokio::time::sleep(Duration::from_secs(2)).await;

        let calls = a.availability_calls();
        monitor.ensure_fresh().await;
        assert_eq!(a.availability_calls(), calls);
        assert_eq!(catalog.current().generation(), 2);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let snap = catalog.current();
        assert_eq!(snap.generation(), 3);
        assert_eq!(snap.stale_count(Utc::now(), chrono::Duration::seconds(30)), 0);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_refreshes_until_stopped() {
        let a = sim(&["x"]);
        let (ctx, monitor) = setup(&[("pool-a", a)]);
        let handle = Arc::clone(&monitor).spawn(Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ctx.catalog().current().generation(), 1);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(ctx.catalog().current().generation(), 3);

        assert!(handle.is_running());
        handle.stop().await;
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(ctx.catalog().current().generation(), 3);
        assert_eq!(
            monitor.staleness_bound(Duration::from_secs(60)),
            Duration::from_secs(70)
        );
    }
}
