//! Task scheduler: submission, selection, dispatch and lifecycle tracking.
//!
//! ```text
//!   submit() ──→ validate ──→ select (caller's task) ──→ probe ──→ dispatch ──→ Ok(handle)
//!                                 │                        │           │
//!                          NoFeasibleResource     reselect ≤ N times   └──→ compute plane
//!                                                                            execute()
//! ```
//!
//! `submit` returns once the task is on the compute plane. It never waits
//! for the execution; use [`TaskScheduler::wait`] and
//! [`TaskScheduler::results`] for that.
//!
//! Every task that reaches a terminal state appends exactly one
//! [`TaskRecord`] to the metrics log, and it does so before any error about
//! that task is returned to the caller.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::backend::{BackendFactory, BackendKind};
use crate::cache::CacheInfo;
use crate::catalog::CatalogSnapshot;
use crate::compute::ComputePlane;
use crate::config::SchedulerConfig;
use crate::context::SchedulerContext;
use crate::error::{SchedulerError, SchedulerResult};
use crate::lifecycle::{Lifecycle, TaskRecord};
use crate::metrics::MetricsLog;
use crate::monitor::{BackgroundMonitor, MonitorHandle, RefreshReport};
use crate::pool::{PoolDescriptor, PoolId, ResourcePool};
use crate::resource::ResourceId;
use crate::result::ExecutionResult;
use crate::selector::{Selection, SelectionRequest};
use crate::task::{Task, TaskDescriptor, TaskId, TaskStatus};

/// Caller's reference to a submitted task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: TaskId,
    correlation_id: String,
    status: watch::Receiver<TaskStatus>,
}

impl TaskHandle {
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.borrow()
    }

    /// Waits until the task reaches a terminal state.
    pub async fn finished(&mut self) -> TaskStatus {
        let done = self.status.wait_for(|s| s.is_terminal()).await.map(|s| *s);
        match done {
            Ok(status) => status,
            Err(_) => *self.status.borrow(),
        }
    }
}

/// Result of [`TaskScheduler::wait`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitOutcome {
    pub finished: Vec<TaskId>,
    pub pending: Vec<TaskId>,
}

impl WaitOutcome {
    pub fn all_finished(&self) -> bool {
        self.pending.is_empty()
    }
}

struct TaskEntry<W> {
    descriptor: TaskDescriptor,
    lifecycle: Lifecycle,
    /// The task until it is handed to the compute plane.
    task: Mutex<Option<Task<W>>>,
    abort: Mutex<Option<AbortHandle>>,
}

impl<W> TaskEntry<W> {
    fn id(&self) -> TaskId {
        self.lifecycle.record().task_id
    }

    fn release_work(&self) {
        self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

/// Decrements a resource's in-flight count when dropped, including when the
/// execution is aborted before it starts.
struct InflightGuard<W: Send + Sync + 'static> {
    ctx: Arc<SchedulerContext<W>>,
    resource: ResourceId,
}

impl<W: Send + Sync + 'static> InflightGuard<W> {
    fn new(ctx: Arc<SchedulerContext<W>>, resource: ResourceId) -> Self {
        ctx.inflight().increment(&resource);
        Self { ctx, resource }
    }
}

impl<W: Send + Sync + 'static> Drop for InflightGuard<W> {
    fn drop(&mut self) {
        self.ctx.inflight().decrement(&self.resource);
    }
}

/// Matches tasks to resources and hands them to the compute plane.
pub struct TaskScheduler<W: Send + Sync + 'static> {
    ctx: Arc<SchedulerContext<W>>,
    monitor: Arc<BackgroundMonitor<W>>,
    tasks: DashMap<TaskId, Arc<TaskEntry<W>>>,
    monitoring: Mutex<Option<MonitorHandle>>,
}

impl<W: Send + Sync + 'static> TaskScheduler<W> {
    /// A scheduler on the current tokio runtime with no metrics sink.
    pub fn new(config: SchedulerConfig) -> SchedulerResult<Self> {
        Self::with_metrics(config, MetricsLog::default())
    }

    pub fn with_metrics(config: SchedulerConfig, metrics: MetricsLog) -> SchedulerResult<Self> {
        let ctx = SchedulerContext::new(config, metrics, ComputePlane::current()?)?;
        Ok(Self::from_context(ctx))
    }

    pub fn from_context(ctx: SchedulerContext<W>) -> Self {
        let ctx = Arc::new(ctx);
        Self {
            monitor: Arc::new(BackgroundMonitor::new(Arc::clone(&ctx))),
            ctx,
            tasks: DashMap::new(),
            monitoring: Mutex::new(None),
        }
    }

    pub fn context(&self) -> &Arc<SchedulerContext<W>> {
        &self.ctx
    }

    pub fn register_factory(&self, kind: BackendKind, factory: impl BackendFactory<W> + 'static) {
        self.ctx.registry().register_factory(kind, factory);
    }

    /// Registers a pool. Its backend kind must already have a factory.
    pub fn register_pool(&self, descriptor: PoolDescriptor) -> SchedulerResult<ResourcePool> {
        if !self.ctx.registry().is_supported(&descriptor.backend_kind) {
            return Err(SchedulerError::UnknownBackendKind(descriptor.backend_kind));
        }
        Ok(self.ctx.catalog().register_pool(descriptor))
    }

    pub fn deregister_pool(&self, pool_id: &PoolId) -> Option<ResourcePool> {
        self.ctx.catalog().deregister_pool(pool_id)
    }

    /// Validates and records a task without selecting a resource yet.
    ///
    /// A created task can be cancelled before [`schedule`](Self::schedule)
    /// without ever touching a resource.
    pub fn create(&self, work: W, descriptor: TaskDescriptor) -> SchedulerResult<TaskHandle> {
        let task = Task::new(work, descriptor);
        let mut record = TaskRecord::new(task.id.clone(), task.descriptor.correlation_id.clone());

        if let Err(err) = task.descriptor.validate() {
            record.status = TaskStatus::Failed;
            record.completion_time = Some(Utc::now());
            record.error_kind = Some(err.kind().to_string());
            record.error_message = Some(err.to_string());
            self.ctx.metrics().append(&record);
            warn!(task_id = %task.id, error = %err, "Rejected invalid task");
            return Err(err);
        }

        let lifecycle = Lifecycle::new(record);
        let handle = TaskHandle {
            id: task.id.clone(),
            correlation_id: task.descriptor.correlation_id.clone(),
            status: lifecycle.subscribe(),
        };
        let entry = Arc::new(TaskEntry {
            descriptor: task.descriptor.clone(),
            lifecycle,
            task: Mutex::new(Some(task)),
            abort: Mutex::new(None),
        });
        self.tasks.insert(handle.id.clone(), entry);
        debug!(task_id = %handle.id, correlation_id = %handle.correlation_id, "Task created");
        Ok(handle)
    }

    /// Selects a resource for a created task and dispatches it.
    pub async fn schedule(&self, handle: &TaskHandle) -> SchedulerResult<()> {
        let entry = self.entry(&handle.id)?;
        self.run(&entry, None).await
    }

    /// [`create`](Self::create) followed by [`schedule`](Self::schedule).
    pub async fn submit(&self, work: W, descriptor: TaskDescriptor) -> SchedulerResult<TaskHandle> {
        let handle = self.create(work, descriptor)?;
        info!(task_id = %handle.id, correlation_id = %handle.correlation_id, "Task submitted");
        self.schedule(&handle).await?;
        Ok(handle)
    }

    /// Submits several tasks with one joint assignment.
    ///
    /// Returns one result per task, in input order.
    pub async fn submit_batch(
        &self,
        items: impl IntoIterator<Item = (W, TaskDescriptor)>,
    ) -> Vec<SchedulerResult<TaskHandle>> {
        let mut results: Vec<SchedulerResult<TaskHandle>> =
            items.into_iter().map(|(w, d)| self.create(w, d)).collect();

        let mut live = Vec::new();
        for (index, result) in results.iter().enumerate() {
            if let Ok(handle) = result {
                if let Ok(entry) = self.entry(&handle.id) {
                    if entry.lifecycle.transition(TaskStatus::Selecting, |_| {}).is_some() {
                        live.push((index, entry));
                    }
                }
            }
        }
        if live.is_empty() {
            return results;
        }
        info!(tasks = live.len(), "Batch submitted");

        let mut outcomes: Vec<(usize, SchedulerResult<()>)> = Vec::with_capacity(live.len());
        match self.prepared_snapshot("batch").await {
            Err(err) => {
                for (index, entry) in &live {
                    let err = match &err {
                        SchedulerError::NoFeasibleResource { reason, .. } => {
                            SchedulerError::infeasible(entry.descriptor.correlation_id.clone(), reason.clone())
                        }
                        SchedulerError::SelectorNotInitialized(message) => {
                            SchedulerError::SelectorNotInitialized(message.clone())
                        }
                        other => SchedulerError::SelectorNotInitialized(other.to_string()),
                    };
                    outcomes.push((*index, Err(self.fail(entry, err))));
                }
            }
            Ok(snapshot) => {
                let none = BTreeSet::new();
                let mode = self.ctx.config().optimization_mode;
                let requests: Vec<_> = live
                    .iter()
                    .map(|(_, entry)| SelectionRequest::new(&entry.descriptor, mode, &none))
                    .collect();
                let batch = self.ctx.selector().select_batch(
                    &snapshot,
                    &requests,
                    self.ctx.inflight(),
                    Utc::now(),
                );
                match batch {
                    Ok(batch) => {
                        if batch.approximate {
                            info!(tasks = live.len(), "Batch assigned greedily; total score may be below optimum");
                        }
                        for ((index, entry), assignment) in live.iter().zip(batch.assignments) {
                            let outcome = match assignment {
                                Ok(selection) => self.run(entry, Some(selection)).await,
                                Err(err) => Err(self.fail(entry, err)),
                            };
                            outcomes.push((*index, outcome));
                        }
                    }
                    Err(err) => {
                        let message = match err {
                            SchedulerError::SelectorNotInitialized(message) => message,
                            other => other.to_string(),
                        };
                        for (index, entry) in &live {
                            let err = SchedulerError::SelectorNotInitialized(message.clone());
                            outcomes.push((*index, Err(self.fail(entry, err))));
                        }
                    }
                }
            }
        }

        for (index, outcome) in outcomes {
            if let Err(err) = outcome {
                results[index] = Err(err);
            }
        }
        results
    }

    fn entry(&self, id: &TaskId) -> SchedulerResult<Arc<TaskEntry<W>>> {
        self.tasks
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| SchedulerError::TaskNotFound(id.clone()))
    }

    /// A bootstrapped snapshot to select against. Its stale entries fail closed.
    async fn prepared_snapshot(&self, correlation_id: &str) -> SchedulerResult<Arc<CatalogSnapshot>> {
        if !self.ctx.catalog().has_pools() {
            return Err(SchedulerError::SelectorNotInitialized(
                "no resource pools registered".into(),
            ));
        }
        self.monitor.ensure_fresh().await;
        let snapshot = self.ctx.catalog().current();
        if !snapshot.is_bootstrapped() {
            return Err(SchedulerError::infeasible(
                correlation_id,
                "initial catalog refresh failed for every pool",
            ));
        }
        Ok(snapshot)
    }

    async fn select(
        &self,
        entry: &TaskEntry<W>,
        excluded: &BTreeSet<ResourceId>,
    ) -> SchedulerResult<Selection> {
        let descriptor = &entry.descriptor;
        let snapshot = self.prepared_snapshot(&descriptor.correlation_id).await?;
        let request = SelectionRequest::new(descriptor, self.ctx.config().optimization_mode, excluded);
        self.ctx
            .selector()
            .select(&snapshot, &request, self.ctx.inflight(), Utc::now())
    }

    /// Selection and dispatch with the probe-failure retry loop.
    ///
    /// `preselected` comes from a batch assignment; the task is then already
    /// in `Selecting`.
    async fn run(&self, entry: &Arc<TaskEntry<W>>, mut preselected: Option<Selection>) -> SchedulerResult<()> {
        let task_id = entry.id();
        let retries = self.ctx.config().feasibility_retry_count;
        let mut excluded = BTreeSet::new();
        let mut last_unavailable: Option<SchedulerError> = None;
        let mut probe_failures = 0u32;

        loop {
            let selection = match preselected.take() {
                Some(selection) => selection,
                None => {
                    if entry.lifecycle.transition(TaskStatus::Selecting, |_| {}).is_none() {
                        return Err(self.not_schedulable(entry));
                    }
                    match self.select(entry, &excluded).await {
                        Ok(selection) => selection,
                        Err(err) => {
                            let err = with_source(err, last_unavailable.take());
                            return Err(self.fail(entry, err));
                        }
                    }
                }
            };

            let resource_id = selection.resource_id().clone();
            if entry
                .lifecycle
                .assign(selection.pool_id(), &resource_id)
                .is_none()
            {
                return Err(self.not_schedulable(entry));
            }
            info!(
                task_id = %task_id,
                resource = %resource_id,
                feasible = selection.feasible,
                score = selection.score,
                "Resource selected"
            );

            match self.dispatch(entry, &selection).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() => {
                    probe_failures += 1;
                    warn!(
                        task_id = %task_id,
                        resource = %resource_id,
                        attempt = probe_failures,
                        error = %err,
                        "Selected resource failed its dispatch probe"
                    );
                    excluded.insert(resource_id);
                    if probe_failures > retries {
                        let err = SchedulerError::NoFeasibleResource {
                            correlation_id: entry.descriptor.correlation_id.clone(),
                            reason: format!("selected resource unavailable after {probe_failures} attempts"),
                            source: Some(Box::new(err)),
                        };
                        return Err(self.fail(entry, err));
                    }
                    last_unavailable = Some(err);
                }
                Err(err) => return Err(self.fail(entry, err)),
            }
        }
    }

    async fn dispatch(&self, entry: &Arc<TaskEntry<W>>, selection: &Selection) -> SchedulerResult<()> {
        let resource = &selection.resource;
        let unavailable = |reason: &str| SchedulerError::ResourceUnavailable {
            resource_id: resource.id.clone(),
            reason: reason.to_string(),
        };

        let pool = self
            .ctx
            .catalog()
            .pool(&resource.pool_id)
            .ok_or_else(|| unavailable("pool was deregistered"))?;
        let handle = self.ctx.registry().handle_for(&pool)?;
        if !self
            .ctx
            .registry()
            .is_available(&handle, &resource.id, &resource.device)
            .await
        {
            return Err(unavailable("health probe failed"));
        }

        let task = entry
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| self.not_schedulable(entry))?;
        if entry.lifecycle.transition(TaskStatus::Dispatched, |_| {}).is_none() {
            return Err(self.not_schedulable(entry));
        }

        let load = InflightGuard::new(Arc::clone(&self.ctx), resource.id.clone());
        let ctx = Arc::clone(&self.ctx);
        let running = Arc::clone(entry);
        let backend = Arc::clone(handle.backend());
        let device = resource.device.clone();
        let task_id = task.id.clone();
        let requirements = task.descriptor.requirements.clone();

        let execution = async move {
            if running.lifecycle.transition(TaskStatus::Running, |_| {}).is_none() {
                return;
            }
            let outcome = backend.execute(&device, &task).await;
            let settled = match outcome {
                Ok(result) => running.lifecycle.complete(result),
                Err(err) => {
                    warn!(task_id = %task.id, kind = err.kind(), error = %err, "Task execution failed");
                    running.lifecycle.fail(err.kind(), err.to_string())
                }
            };
            // Waiters wake only after the record is logged and the load released.
            let Some(settled) = settled else { return };
            ctx.metrics().append(settled.record());
            drop(load);
            let record = settled.publish();
            info!(
                task_id = %record.task_id,
                status = %record.status,
                execution_secs = record.execution_time,
                "Task finished"
            );
        };

        let dispatched = self.ctx.compute().dispatch(&task_id, &requirements, execution);
        {
            // `cancel` moves to Cancelled before it takes the slot.
            let mut slot = entry.abort.lock().unwrap_or_else(|e| e.into_inner());
            if entry.lifecycle.recorded_status() == TaskStatus::Cancelled {
                dispatched.abort.abort();
            } else {
                *slot = Some(dispatched.abort);
            }
        }
        info!(task_id = %task_id, resource = %resource.id, "Task dispatched");
        Ok(())
    }

    /// Moves the task to `Failed`, appends its record and hands `err` back.
    fn fail(&self, entry: &TaskEntry<W>, err: SchedulerError) -> SchedulerError {
        if matches!(err, SchedulerError::NoFeasibleResource { .. })
            && entry.lifecycle.status() == TaskStatus::Selecting
        {
            entry.lifecycle.transition(TaskStatus::Infeasible, |_| {});
        }
        entry.release_work();
        match entry.lifecycle.fail(err.kind(), err.to_string()) {
            Some(settled) => {
                self.ctx.metrics().append(settled.record());
                let record = settled.publish();
                warn!(task_id = %record.task_id, error = %err, "Task failed");
            }
            None => debug!(error = %err, "Task already terminal, failure not recorded"),
        }
        err
    }

    fn not_schedulable(&self, entry: &TaskEntry<W>) -> SchedulerError {
        let id = entry.id();
        match entry.lifecycle.recorded_status() {
            TaskStatus::Cancelled => SchedulerError::TaskCancelled(id),
            status => SchedulerError::Validation(format!("task {id} cannot be scheduled from {status}")),
        }
    }

    /// Cancels a task. Returns `false` if it had already finished.
    ///
    /// Before dispatch nothing has been consumed. After dispatch the
    /// execution is aborted on a best-effort basis and any late result is
    /// discarded.
    pub fn cancel(&self, handle: &TaskHandle) -> SchedulerResult<bool> {
        let entry = self.entry(&handle.id)?;
        let Some(settled) = entry.lifecycle.cancel() else {
            return Ok(false);
        };
        entry.release_work();
        if let Some(abort) = entry.abort.lock().unwrap_or_else(|e| e.into_inner()).take() {
            abort.abort();
        }
        self.ctx.metrics().append(settled.record());
        settled.publish();
        info!(task_id = %handle.id, "Task cancelled");
        Ok(true)
    }

    /// Waits until every task is terminal or `timeout` elapses.
    ///
    /// Timing out cancels nothing.
    pub async fn wait(&self, handles: &[TaskHandle], timeout: Option<Duration>) -> WaitOutcome {
        let mut receivers: Vec<_> = handles.iter().map(|h| h.status.clone()).collect();
        let all = async {
            for rx in &mut receivers {
                let _ = rx.wait_for(|s| s.is_terminal()).await;
            }
        };
        match timeout {
            Some(limit) => {
                let _ = tokio::time::timeout(limit, all).await;
            }
            None => all.await,
        }

        let mut outcome = WaitOutcome::default();
        for handle in handles {
            if handle.status().is_terminal() {
                outcome.finished.push(handle.id.clone());
            } else {
                outcome.pending.push(handle.id.clone());
            }
        }
        outcome
    }

    /// Results of finished tasks, in handle order.
    ///
    /// The first task that did not complete turns the call into an error:
    /// `TaskExecution` for a failure (with the original kind and message),
    /// `TaskCancelled` or `TaskNotFinished`.
    pub fn results(&self, handles: &[TaskHandle]) -> SchedulerResult<Vec<ExecutionResult>> {
        handles
            .iter()
            .map(|handle| {
                let entry = self.entry(&handle.id)?;
                match entry.lifecycle.status() {
                    TaskStatus::Completed => entry
                        .lifecycle
                        .result()
                        .ok_or_else(|| SchedulerError::TaskNotFinished(handle.id.clone())),
                    TaskStatus::Failed => {
                        let record = entry.lifecycle.record();
                        Err(SchedulerError::execution(
                            handle.id.clone(),
                            record.error_kind.unwrap_or_default(),
                            record.error_message.unwrap_or_default(),
                        ))
                    }
                    TaskStatus::Cancelled => Err(SchedulerError::TaskCancelled(handle.id.clone())),
                    _ => Err(SchedulerError::TaskNotFinished(handle.id.clone())),
                }
            })
            .collect()
    }

    pub fn status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.tasks.get(id).map(|e| e.lifecycle.status())
    }

    pub fn record(&self, id: &TaskId) -> Option<TaskRecord> {
        self.tasks.get(id).map(|e| e.lifecycle.record())
    }

    /// Records of every tracked task, oldest submission first.
    pub fn records(&self) -> Vec<TaskRecord> {
        let mut records: Vec<_> = self.tasks.iter().map(|e| e.lifecycle.record()).collect();
        records.sort_by(|a, b| {
            a.submit_time
                .cmp(&b.submit_time)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        records
    }

    /// Stops tracking terminal tasks. Their records stay in the metrics log.
    pub fn purge_finished(&self) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, e| !e.lifecycle.status().is_terminal());
        before - self.tasks.len()
    }

    pub fn cache_info(&self) -> CacheInfo {
        self.ctx.cache_info()
    }

    pub fn clear_cache(&self) {
        self.ctx.clear_cache();
    }

    /// Runs one catalog refresh now.
    pub async fn refresh_catalog(&self) -> RefreshReport {
        self.monitor.refresh_once().await
    }

    /// Starts the periodic refresh. Returns `false` if it is already running.
    pub fn start_background_monitoring(&self, interval: Option<Duration>) -> bool {
        let mut monitoring = self.monitoring.lock().unwrap_or_else(|e| e.into_inner());
        if monitoring.as_ref().is_some_and(MonitorHandle::is_running) {
            return false;
        }
        let interval = interval.unwrap_or_else(|| self.ctx.config().monitor_interval());
        *monitoring = Some(Arc::clone(&self.monitor).spawn(interval));
        true
    }

    /// Stops the periodic refresh and waits for it. Returns `false` if it
    /// was not running.
    pub async fn stop_background_monitoring(&self) -> bool {
        let handle = self
            .monitoring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match handle {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(MonitorHandle::is_running)
    }

    /// Stops monitoring and releases caches. Dispatched tasks keep running.
    pub async fn shutdown(&self) {
        self.stop_background_monitoring().await;
        self.ctx.shutdown();
    }
}

impl<W: Send + Sync + 'static> Drop for TaskScheduler<W> {
    fn drop(&mut self) {
        if let Some(handle) = self
            .monitoring
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            handle.cancel();
        }
    }
}

/// Attaches the last dispatch failure to a reselection that found nothing.
fn with_source(err: SchedulerError, cause: Option<SchedulerError>) -> SchedulerError {
    match (err, cause) {
        (
            SchedulerError::NoFeasibleResource {
                correlation_id,
                reason,
                source: None,
            },
            Some(cause),
        ) => SchedulerError::NoFeasibleResource {
            correlation_id,
            reason,
            source: Some(Box::new(cause)),
        },
        (err, _) => err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capabilities;
    use crate::error::HalError;
    use crate::matching::Matcher;
    use crate::selector::{OptimizationMode, ResourceSelector};
    use crate::simulator::SimulatorBackend;

    fn scheduler(config: SchedulerConfig) -> TaskScheduler<String> {
        TaskScheduler::with_metrics(config, MetricsLog::in_memory()).unwrap()
    }

    /// Registers one pool per device, each with its own backend kind.
    fn add_pool(
        s: &TaskScheduler<String>,
        pool: &str,
        capacity: u32,
        quality: f64,
    ) -> Arc<SimulatorBackend> {
        let caps = Capabilities::simulator("dev", capacity)
            .with_capabilities(["g1", "g2"])
            .with_calibration(quality, 0.0);
        let sim = Arc::new(SimulatorBackend::new(vec![caps]));
        let kind = BackendKind::new(format!("sim-{pool}"));
        s.register_factory(kind.clone(), sim.shared_factory::<String>());
        s.register_pool(PoolDescriptor::new(pool, kind)).unwrap();
        sim
    }

    fn rid(pool: &str) -> ResourceId {
        ResourceId::new(pool, "dev")
    }

    #[tokio::test]
    async fn test_submit_runs_to_completion() {
        let s = scheduler(SchedulerConfig::default());
        let sim = add_pool(&s, "pool-a", 5, 0.9);

        let mut handle = s
            .submit("bell".into(), TaskDescriptor::new("corr-1", 2, ["g1"]))
            .await
            .unwrap();
        assert_eq!(handle.finished().await, TaskStatus::Completed);

        let results = s.results(&[handle.clone()]).unwrap();
        assert_eq!(results[0].counts.get("11"), 512);
        assert_eq!(sim.executions(), 1);

        let record = s.record(handle.id()).unwrap();
        assert_eq!(record.pool_scheduled, Some(PoolId::from("pool-a")));
        assert_eq!(record.resource_id, Some(rid("pool-a")));
        assert!(record.wait_time.is_some());
        assert!(record.execution_time.is_some());

        let logged = s.context().metrics().recorded().unwrap();
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].status, TaskStatus::Completed);
        assert_eq!(s.context().inflight().total(), 0);
    }

    #[tokio::test]
    async fn test_no_pools_is_not_initialized() {
        let s = scheduler(SchedulerConfig::default());
        let err = s
            .submit("w".into(), TaskDescriptor::new("c", 1, ["g1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::SelectorNotInitialized(_)));
        let logged = s.context().metrics().recorded().unwrap();
        assert_eq!(logged[0].status, TaskStatus::Failed);
        assert_eq!(logged[0].error_kind.as_deref(), Some("selector_not_initialized"));
    }

    #[tokio::test]
    async fn test_invalid_descriptor_is_recorded() {
        let s = scheduler(SchedulerConfig::default());
        add_pool(&s, "pool-a", 5, 0.9);
        let err = s
            .submit("w".into(), TaskDescriptor::new("c", 0, ["g1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Validation(_)));
        assert_eq!(s.context().metrics().appended(), 1);
        assert!(s.records().is_empty());
    }

    #[tokio::test]
    async fn test_infeasible_task_fails_with_record() {
        let s = scheduler(SchedulerConfig::default());
        add_pool(&s, "pool-a", 5, 0.9);
        let err = s
            .submit("w".into(), TaskDescriptor::new("corr-big", 10, ["g1"]))
            .await
            .unwrap_err();
        match err {
            SchedulerError::NoFeasibleResource { correlation_id, .. } => {
                assert_eq!(correlation_id, "corr-big");
            }
            other => panic!("unexpected: {other:?}"),
        }
        let record = &s.records()[0];
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.error_kind.as_deref(), Some("no_feasible_resource"));
        assert!(record.dispatch_time.is_none());
        assert_eq!(s.context().metrics().appended(), 1);
    }

    #[tokio::test]
    async fn test_unknown_backend_kind() {
        let s = scheduler(SchedulerConfig::default());
        let err = s
            .register_pool(PoolDescriptor::new("p", BackendKind::new("quantinuum")))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownBackendKind(_)));

        // A catalog entry whose pool kind has no factory fails at dispatch.
        let pool = s
            .context()
            .catalog()
            .register_pool(PoolDescriptor::new("p", BackendKind::new("quantinuum")));
        let mut resource = crate::resource::QuantumResource::from_device(
            &pool,
            &Capabilities::simulator("h1", 20),
            64,
        );
        resource.available = true;
        s.context()
            .catalog()
            .publish(CatalogSnapshot::new(1, [resource]));
        let err = s
            .submit("w".into(), TaskDescriptor::new("c", 1, ["measure"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownBackendKind(k) if k.as_str() == "quantinuum"));
    }

    #[tokio::test]
    async fn test_unavailable_at_dispatch_reselects() {
        let s = scheduler(SchedulerConfig::default());
        let best = add_pool(&s, "pool-a", 5, 0.99);
        let other = add_pool(&s, "pool-b", 5, 0.90);
        s.refresh_catalog().await;

        best.set_available("dev", false);
        s.context().values().clear();

        let mut handle = s
            .submit(
                "w".into(),
                TaskDescriptor::new("c", 1, ["g1"]).with_mode(OptimizationMode::HighQuality),
            )
            .await
            .unwrap();
        assert_eq!(handle.finished().await, TaskStatus::Completed);
        let record = s.record(handle.id()).unwrap();
        assert_eq!(record.resource_id, Some(rid("pool-b")));
        assert_eq!(record.selection_attempts, 2);
        assert_eq!(best.executions(), 0);
        assert_eq!(other.executions(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_wraps_resource_unavailable() {
        let s = scheduler(SchedulerConfig::default().with_feasibility_retry_count(0));
        let only = add_pool(&s, "pool-a", 5, 0.99);
        s.refresh_catalog().await;
        only.set_available("dev", false);
        s.context().values().clear();

        let err = s
            .submit("w".into(), TaskDescriptor::new("c", 1, ["g1"]))
            .await
            .unwrap_err();
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert!(matches!(err, SchedulerError::NoFeasibleResource { .. }));
        assert!(source.unwrap().contains("pool-a/dev"));
    }

    #[tokio::test]
    async fn test_cancel_before_dispatch_consumes_nothing() {
        let s = scheduler(SchedulerConfig::default());
        let sim = add_pool(&s, "pool-a", 5, 0.9);
        sim.set_queue_depth("dev", 2);
        s.refresh_catalog().await;
        let before = s.context().catalog().current().get(&rid("pool-a")).cloned().unwrap();
        let probes = sim.availability_calls();

        let handle = s
            .create("w".into(), TaskDescriptor::new("c", 1, ["g1"]))
            .unwrap();
        assert!(s.cancel(&handle).unwrap());
        assert!(!s.cancel(&handle).unwrap());

        let err = s.schedule(&handle).await.unwrap_err();
        assert!(matches!(err, SchedulerError::TaskCancelled(_)));
        assert_eq!(handle.status(), TaskStatus::Cancelled);
        assert_eq!(sim.executions(), 0);
        assert_eq!(sim.availability_calls(), probes);

        let snapshot = s.context().catalog().current();
        let after = snapshot.get(&rid("pool-a")).unwrap();
        assert_eq!(after.queue_depth, before.queue_depth);
        assert_eq!(after.available, before.available);
        assert_eq!(snapshot.generation(), 1);
        assert_eq!(s.context().inflight().total(), 0);
        assert_eq!(s.context().compute().in_flight(), 0);
        assert!(s.record(handle.id()).unwrap().resource_id.is_none());
        assert!(matches!(
            s.results(&[handle]),
            Err(SchedulerError::TaskCancelled(_))
        ));
        assert_eq!(s.context().metrics().appended(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_dispatch_discards_result() {
        let s = scheduler(SchedulerConfig::default());
        let sim = add_pool(&s, "pool-a", 5, 0.9);
        sim.set_execution_delay(Duration::from_secs(3600));

        let handle = s
            .submit("w".into(), TaskDescriptor::new("c", 1, ["g1"]))
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert!(handle.status().is_dispatched());
        assert_eq!(s.context().inflight().get(&rid("pool-a")), 1);

        assert!(s.cancel(&handle).unwrap());
        tokio::time::sleep(Duration::from_secs(7200)).await;

        assert_eq!(handle.status(), TaskStatus::Cancelled);
        assert!(s.context().metrics().recorded().unwrap().len() == 1);
        assert_eq!(s.context().inflight().total(), 0);
        assert_eq!(s.context().compute().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_execution_error_keeps_kind_and_message() {
        let s = scheduler(SchedulerConfig::default());
        let sim = add_pool(&s, "pool-a", 5, 0.9);
        sim.fail_executions(Some(HalError::JobFailed("division by zero".into())));

        let mut handle = s
            .submit("w".into(), TaskDescriptor::new("c", 1, ["g1"]))
            .await
            .unwrap();
        assert_eq!(handle.finished().await, TaskStatus::Failed);
        match s.results(&[handle]) {
            Err(SchedulerError::TaskExecution { kind, message, .. }) => {
                assert_eq!(kind, "job_failed");
                assert!(message.contains("division by zero"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    /// Sink that takes a while to persist each record.
    struct SlowSink {
        delay: Duration,
    }

    impl crate::metrics::MetricsSink for SlowSink {
        fn append(&mut self, _record: &TaskRecord) -> std::io::Result<()> {
            std::thread::sleep(self.delay);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failure_is_logged_before_waiters_wake() {
        let metrics = MetricsLog::new(SlowSink {
            delay: Duration::from_millis(300),
        });
        let s = TaskScheduler::<String>::with_metrics(SchedulerConfig::default(), metrics).unwrap();
        let sim = add_pool(&s, "pool-a", 5, 0.9);
        sim.fail_executions(Some(HalError::JobFailed("boom".into())));

        let handle = s
            .submit("w".into(), TaskDescriptor::new("c", 1, ["g1"]))
            .await
            .unwrap();
        let outcome = s.wait(std::slice::from_ref(&handle), None).await;
        assert!(outcome.all_finished());
        assert_eq!(s.context().metrics().appended(), 1);
        assert_eq!(s.context().inflight().total(), 0);
        assert!(matches!(
            s.results(&[handle]),
            Err(SchedulerError::TaskExecution { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_does_not_cancel() {
        let s = scheduler(SchedulerConfig::default());
        let sim = add_pool(&s, "pool-a", 5, 0.9);
        sim.set_execution_delay(Duration::from_secs(100));

        let handle = s
            .submit("w".into(), TaskDescriptor::new("c", 1, ["g1"]))
            .await
            .unwrap();
        let outcome = s
            .wait(&[handle.clone()], Some(Duration::from_secs(10)))
            .await;
        assert_eq!(outcome.pending, vec![handle.id().clone()]);
        assert!(matches!(
            s.results(&[handle.clone()]),
            Err(SchedulerError::TaskNotFinished(_))
        ));

        let outcome = s.wait(&[handle.clone()], None).await;
        assert!(outcome.all_finished());
        assert_eq!(handle.status(), TaskStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions() {
        let s = Arc::new(scheduler(SchedulerConfig::default()));
        add_pool(&s, "pool-a", 5, 0.9);
        add_pool(&s, "pool-b", 5, 0.8);

        let submitters: Vec<_> = (0..40)
            .map(|i| {
                let s = Arc::clone(&s);
                tokio::spawn(async move {
                    s.submit(format!("w{i}"), TaskDescriptor::new(format!("c{i}"), 1, ["g1"]))
                        .await
                })
            })
            .collect();
        let mut handles = Vec::new();
        for submitter in submitters {
            handles.push(submitter.await.unwrap().unwrap());
        }
        let outcome = s.wait(&handles, None).await;
        assert!(outcome.all_finished());
        assert_eq!(s.results(&handles).unwrap().len(), 40);
        assert_eq!(s.context().metrics().recorded().unwrap().len(), 40);
        assert_eq!(s.context().inflight().total(), 0);
    }

    #[tokio::test]
    async fn test_batch_submission() {
        let s = scheduler(SchedulerConfig::default());
        add_pool(&s, "pool-a", 5, 0.99);
        add_pool(&s, "pool-b", 5, 0.90);

        let results = s
            .submit_batch(vec![
                ("a".to_string(), TaskDescriptor::new("t1", 1, ["g1"])),
                ("b".to_string(), TaskDescriptor::new("t2", 50, ["g1"])),
                ("c".to_string(), TaskDescriptor::new("t3", 0, ["g1"])),
                ("d".to_string(), TaskDescriptor::new("t4", 2, ["g2"])),
            ])
            .await;
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(SchedulerError::NoFeasibleResource { .. })
        ));
        assert!(matches!(results[2], Err(SchedulerError::Validation(_))));
        assert!(results[3].is_ok());

        let handles: Vec<_> = results.into_iter().filter_map(Result::ok).collect();
        assert!(s.wait(&handles, None).await.all_finished());
        assert_eq!(s.results(&handles).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_batch_uses_device_with_long_queue() {
        let s = scheduler(SchedulerConfig::default());
        let sim = add_pool(&s, "pool-a", 5, 0.9);
        sim.set_queue_depth("dev", 100);

        let results = s
            .submit_batch((0..3).map(|i| (format!("w{i}"), TaskDescriptor::new(format!("t{i}"), 1, ["g1"]))))
            .await;
        assert!(results.iter().all(Result::is_ok), "{results:?}");
        assert_eq!(s.context().catalog().current().get(&rid("pool-a")).unwrap().queue_limit, 164);
    }

    #[tokio::test]
    async fn test_declared_queue_limit_caps_batch() {
        let s = scheduler(SchedulerConfig::default());
        let sim = Arc::new(SimulatorBackend::new(vec![
            Capabilities::simulator("dev", 5).with_capabilities(["g1"]),
        ]));
        sim.set_queue_depth("dev", 100);
        let kind = BackendKind::new("sim-capped");
        s.register_factory(kind.clone(), sim.shared_factory::<String>());
        let defaults = crate::pool::OptimizationDefaults {
            queue_limit: Some(101),
            ..Default::default()
        };
        s.register_pool(PoolDescriptor::new("capped", kind).with_optimization_defaults(defaults))
            .unwrap();

        let results = s
            .submit_batch((0..2).map(|i| (format!("w{i}"), TaskDescriptor::new(format!("t{i}"), 1, ["g1"]))))
            .await;
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let err = results.into_iter().find_map(Result::err).unwrap();
        assert!(err.to_string().contains("no queue headroom"), "{err}");
    }

    /// Delegates to the greedy matcher and counts how often it is asked.
    #[derive(Default)]
    struct CountingMatcher {
        calls: std::sync::atomic::AtomicUsize,
    }

    impl crate::matching::Matcher for CountingMatcher {
        fn assign(&self, scores: &crate::matching::ScoreMatrix) -> Vec<Option<usize>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            crate::matching::GreedyMatcher.assign(scores)
        }

        fn is_exact(&self) -> bool {
            false
        }
    }

    /// Prefers the worst-calibrated device, whatever the mode.
    struct LowestQuality;

    impl crate::selector::Scorer for LowestQuality {
        fn score(&self, c: &crate::selector::Candidate<'_>, _norm: &crate::selector::Normalizer) -> f64 {
            -c.resource.quality_score
        }
    }

    fn custom_scheduler(configure: impl FnOnce(ResourceSelector) -> ResourceSelector) -> TaskScheduler<String> {
        let config = SchedulerConfig::default();
        let selector = configure(ResourceSelector::new(
            config.scoring_weights,
            config.cache_ttl(),
            config.exact_match_limit,
        ));
        let ctx = SchedulerContext::new(config, MetricsLog::in_memory(), ComputePlane::current().unwrap())
            .unwrap()
            .with_selector(selector);
        TaskScheduler::from_context(ctx)
    }

    #[tokio::test]
    async fn test_custom_matcher_assigns_batches() {
        let matcher = Arc::new(CountingMatcher::default());
        let plugged = Arc::clone(&matcher);
        let s = custom_scheduler(move |selector| selector.with_matcher(plugged));
        let a = add_pool(&s, "pool-a", 5, 0.99);
        let b = add_pool(&s, "pool-b", 5, 0.90);

        let handles: Vec<_> = s
            .submit_batch((0..4).map(|i| (format!("w{i}"), TaskDescriptor::new(format!("t{i}"), 1, ["g1"]))))
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert!(s.wait(&handles, None).await.all_finished());
        assert_eq!(matcher.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(a.executions() + b.executions(), 4);
    }

    #[tokio::test]
    async fn test_custom_scorer_overrides_mode() {
        let s = custom_scheduler(|selector| selector.with_scorer(Arc::new(LowestQuality)));
        add_pool(&s, "pool-a", 5, 0.99);
        add_pool(&s, "pool-b", 5, 0.50);

        let desc = TaskDescriptor::new("c", 1, ["g1"]).with_mode(OptimizationMode::HighQuality);
        let handle = s.submit("w".into(), desc).await.unwrap();
        assert_eq!(s.record(handle.id()).unwrap().pool_scheduled, Some(PoolId::from("pool-b")));
    }

    #[tokio::test]
    async fn test_cold_start_bootstraps_catalog() {
        let s = scheduler(SchedulerConfig::default());
        let sim = add_pool(&s, "pool-a", 5, 0.9);
        assert_eq!(s.cache_info().snapshot_generation, 0);

        s.submit("w".into(), TaskDescriptor::new("c", 1, ["g1"]))
            .await
            .unwrap();
        assert_eq!(s.cache_info().snapshot_generation, 1);
        assert!(sim.availability_calls() >= 1);
    }

    /// Republishes the current snapshot with every entry aged by an hour.
    fn age_catalog(s: &TaskScheduler<String>) {
        let catalog = s.context().catalog();
        let aged: Vec<_> = catalog
            .current()
            .resources()
            .map(|r| {
                let mut r = r.clone();
                r.last_updated -= chrono::Duration::hours(1);
                r
            })
            .collect();
        assert!(catalog.publish(CatalogSnapshot::new(catalog.next_generation(), aged)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_catalog_wakes_monitor_then_recovers() {
        let s = scheduler(SchedulerConfig::default());
        add_pool(&s, "pool-a", 5, 0.9);
        assert!(s.start_background_monitoring(Some(Duration::from_secs(3600))));
        tokio::time::sleep(Duration::from_secs(1)).await;
        age_catalog(&s);
        let aged_generation = s.cache_info().snapshot_generation;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let err = s
            .submit("w".into(), TaskDescriptor::new("c", 1, ["g1"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("stale: 1"), "{err}");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(s.cache_info().snapshot_generation > aged_generation);
        let mut handle = s
            .submit("w".into(), TaskDescriptor::new("c2", 1, ["g1"]))
            .await
            .unwrap();
        assert_eq!(handle.finished().await, TaskStatus::Completed);
        s.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_does_not_wait_for_inflight_refresh() {
        let s = scheduler(SchedulerConfig::default());
        let sim = add_pool(&s, "pool-a", 5, 0.9);
        s.refresh_catalog().await;
        age_catalog(&s);
        sim.set_availability_delay(Duration::from_secs(8));
        s.context().values().clear();

        let (report, (waited, submitted)) = tokio::join!(s.refresh_catalog(), async {
            tokio::task::yield_now().await;
            let started = tokio::time::Instant::now();
            let submitted = s
                .submit("w".into(), TaskDescriptor::new("c", 1, ["g1"]))
                .await;
            (started.elapsed(), submitted)
        });
        assert!(waited < Duration::from_secs(1), "{waited:?}");
        let err = submitted.unwrap_err();
        assert!(err.to_string().contains("stale: 1"), "{err}");
        assert!(report.published());
    }

    #[tokio::test]
    async fn test_stale_catalog_fails_closed_without_monitor() {
        let s = scheduler(SchedulerConfig::default());
        let sim = add_pool(&s, "pool-a", 5, 0.9);
        s.refresh_catalog().await;
        age_catalog(&s);
        let calls = sim.availability_calls();

        let err = s
            .submit("w".into(), TaskDescriptor::new("c", 1, ["g1"]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("stale: 1"), "{err}");
        assert_eq!(sim.executions(), 0);
        assert_eq!(sim.availability_calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitoring_start_stop() {
        let s = scheduler(SchedulerConfig::default());
        add_pool(&s, "pool-a", 5, 0.9);
        assert!(s.start_background_monitoring(Some(Duration::from_secs(5))));
        assert!(!s.start_background_monitoring(None));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(s.cache_info().snapshot_generation, 3);

        assert!(s.stop_background_monitoring().await);
        assert!(!s.is_monitoring());
        assert!(!s.stop_background_monitoring().await);

        s.shutdown().await;
        assert_eq!(s.cache_info().executor_handles, 0);
    }

    #[tokio::test]
    async fn test_purge_finished() {
        let s = scheduler(SchedulerConfig::default());
        add_pool(&s, "pool-a", 5, 0.9);
        let mut handle = s
            .submit("w".into(), TaskDescriptor::new("c", 1, ["g1"]))
            .await
            .unwrap();
        handle.finished().await;
        assert_eq!(s.purge_finished(), 1);
        assert!(s.status(handle.id()).is_none());
        assert!(matches!(
            s.results(&[handle]),
            Err(SchedulerError::TaskNotFound(_))
        ));
    }
}
