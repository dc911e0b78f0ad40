//! Per-task lifecycle records.
//!
//! A [`Lifecycle`] owns the [`TaskRecord`] of one task and publishes its
//! status on a `watch` channel. Every transition is checked against
//! [`TaskStatus::can_transition_to`] under the record's lock, so a late
//! completion can never overwrite a cancellation (or the other way round).
//!
//! Terminal transitions are two-step. The record is stamped first and handed
//! back as a [`Settled`]; waiters only see the terminal status once it is
//! published, after the caller has appended the record to the metrics log.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::pool::PoolId;
use crate::resource::ResourceId;
use crate::result::ExecutionResult;
use crate::task::{TaskId, TaskStatus};

/// Lifecycle record appended to the metrics log.
///
/// Times are UTC; durations are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub correlation_id: String,
    pub pool_scheduled: Option<PoolId>,
    pub resource_id: Option<ResourceId>,
    pub submit_time: DateTime<Utc>,
    pub selection_time: Option<DateTime<Utc>>,
    pub dispatch_time: Option<DateTime<Utc>>,
    pub completion_time: Option<DateTime<Utc>>,
    /// Submission to dispatch.
    pub wait_time: Option<f64>,
    /// Dispatch to completion.
    pub execution_time: Option<f64>,
    pub status: TaskStatus,
    /// Error category, e.g. `job_failed` or `no_feasible_resource`.
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    /// Number of selections performed (more than one after a dispatch retry).
    pub selection_attempts: u32,
}

impl TaskRecord {
    pub fn new(task_id: TaskId, correlation_id: impl Into<String>) -> Self {
        Self {
            task_id,
            correlation_id: correlation_id.into(),
            pool_scheduled: None,
            resource_id: None,
            submit_time: Utc::now(),
            selection_time: None,
            dispatch_time: None,
            completion_time: None,
            wait_time: None,
            execution_time: None,
            status: TaskStatus::Created,
            error_kind: None,
            error_message: None,
            selection_attempts: 0,
        }
    }

    fn stamp(&mut self, next: TaskStatus, now: DateTime<Utc>) {
        match next {
            TaskStatus::Selecting => self.selection_attempts += 1,
            TaskStatus::Assigned | TaskStatus::Infeasible => self.selection_time = Some(now),
            TaskStatus::Dispatched => {
                self.dispatch_time = Some(now);
                self.wait_time = Some(seconds_between(self.submit_time, now));
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.completion_time = Some(now);
                if let Some(dispatched) = self.dispatch_time {
                    self.execution_time = Some(seconds_between(dispatched, now));
                }
            }
            TaskStatus::Created | TaskStatus::Running => {}
        }
        self.status = next;
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    to.signed_duration_since(from)
        .to_std()
        .map_or(0.0, |d| d.as_secs_f64())
}

#[derive(Debug)]
struct Inner {
    record: TaskRecord,
    result: Option<ExecutionResult>,
}

/// Thread-safe lifecycle of one task.
#[derive(Debug)]
pub struct Lifecycle {
    inner: Mutex<Inner>,
    status: watch::Sender<TaskStatus>,
}

impl Lifecycle {
    pub fn new(record: TaskRecord) -> Self {
        let (status, _) = watch::channel(record.status);
        Self {
            inner: Mutex::new(Inner {
                record,
                result: None,
            }),
            status,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskStatus> {
        self.status.subscribe()
    }

    pub fn record(&self) -> TaskRecord {
        self.lock().record.clone()
    }

    pub fn result(&self) -> Option<ExecutionResult> {
        self.lock().result.clone()
    }

    /// Status as stamped on the record, which may be terminal before
    /// [`status`](Self::status) reports it.
    pub fn recorded_status(&self) -> TaskStatus {
        self.lock().record.status
    }

    /// Moves to `next` and applies `update` to the record.
    ///
    /// Returns the updated record, or `None` (with nothing changed) if the
    /// transition is not legal from the current status.
    pub fn transition(
        &self,
        next: TaskStatus,
        update: impl FnOnce(&mut TaskRecord),
    ) -> Option<TaskRecord> {
        self.settle(next, update).map(Settled::publish)
    }

    fn settle(
        &self,
        next: TaskStatus,
        update: impl FnOnce(&mut TaskRecord),
    ) -> Option<Settled<'_>> {
        let mut inner = self.lock();
        if !inner.record.status.can_transition_to(next) {
            return None;
        }
        update(&mut inner.record);
        inner.record.stamp(next, Utc::now());
        Some(Settled {
            status: &self.status,
            record: inner.record.clone(),
        })
    }

    /// Records the resource a selection picked and moves to `Assigned`.
    pub fn assign(&self, pool: &PoolId, resource: &ResourceId) -> Option<TaskRecord> {
        self.transition(TaskStatus::Assigned, |r| {
            r.pool_scheduled = Some(pool.clone());
            r.resource_id = Some(resource.clone());
        })
    }

    /// Stores the result and stamps `Completed`.
    pub fn complete(&self, result: ExecutionResult) -> Option<Settled<'_>> {
        let mut inner = self.lock();
        if !inner.record.status.can_transition_to(TaskStatus::Completed) {
            return None;
        }
        inner.result = Some(result);
        inner.record.stamp(TaskStatus::Completed, Utc::now());
        Some(Settled {
            status: &self.status,
            record: inner.record.clone(),
        })
    }

    /// Records the error and stamps `Failed`.
    pub fn fail(&self, kind: &str, message: impl Into<String>) -> Option<Settled<'_>> {
        let message = message.into();
        self.settle(TaskStatus::Failed, |r| {
            r.error_kind = Some(kind.to_string());
            r.error_message = Some(message);
        })
    }

    pub fn cancel(&self) -> Option<Settled<'_>> {
        self.settle(TaskStatus::Cancelled, |_| {})
    }
}

/// A stamped record whose status waiters have not seen yet.
///
/// Publishing wakes them. Dropping publishes too.
#[must_use = "waiters are woken when this is published or dropped"]
#[derive(Debug)]
pub struct Settled<'a> {
    status: &'a watch::Sender<TaskStatus>,
    record: TaskRecord,
}

impl Settled<'_> {
    pub fn record(&self) -> &TaskRecord {
        &self.record
    }

    pub fn publish(self) -> TaskRecord {
        self.record.clone()
    }
}

impl Drop for Settled<'_> {
    fn drop(&mut self) {
        self.status.send_replace(self.record.status);
    }
}
