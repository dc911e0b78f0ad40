//! Compute plane: where task executions run.
//!
//! The scheduler never awaits an execution on the submitting task. Each
//! dispatched execution is spawned on a tokio runtime, and the returned
//! [`Dispatch`] lets the scheduler abort it on cancellation.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

use crate::error::{SchedulerError, SchedulerResult};
use crate::task::{Requirements, TaskId};

/// Spawns executions onto a tokio runtime.
#[derive(Debug, Clone)]
pub struct ComputePlane {
    runtime: Handle,
    in_flight: Arc<AtomicUsize>,
}

/// A running execution.
#[derive(Debug)]
pub struct Dispatch<T> {
    pub join: JoinHandle<T>,
    pub abort: AbortHandle,
}

/// Decrements the in-flight count when the execution ends or is aborted.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl ComputePlane {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The runtime the caller is running on.
    pub fn current() -> SchedulerResult<Self> {
        Handle::try_current().map(Self::new).map_err(|e| {
            SchedulerError::Configuration(format!("no tokio runtime for the compute plane: {e}"))
        })
    }

    /// Spawns `execution`. `requirements` are forwarded as hints only.
    pub fn dispatch<F>(&self, task_id: &TaskId, requirements: &Requirements, execution: F) -> Dispatch<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        debug!(
            task_id = %task_id,
            parallelism = ?requirements.parallelism,
            accelerators = ?requirements.accelerator_count,
            memory = ?requirements.memory,
            "Dispatching to compute plane"
        );
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let guard = InFlightGuard(Arc::clone(&self.in_flight));
        let join = self.runtime.spawn(async move {
            let _guard = guard;
            execution.await
        });
        let abort = join.abort_handle();
        Dispatch { join, abort }
    }

    /// Executions spawned and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}
