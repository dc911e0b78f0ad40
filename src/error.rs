//! Error types.
//!
//! Two error families live here:
//!
//! - [`HalError`] is what a [`Backend`](crate::backend::Backend) returns. It
//!   keeps the HAL contract's recoverability categories.
//! - [`SchedulerError`] is what callers of the scheduler see.
//!
//! | Category | `HalError` variants | Recovery |
//! |----------|---------------------|----------|
//! | **Transient** | `BackendUnavailable`, `Timeout` | Retry with backoff |
//! | **Permanent** | `InvalidWork`, `Unsupported` | Fix input |
//! | **Job-level** | `JobFailed`, `JobCancelled` | Resubmit or abort |
//! | **Config** | `Configuration`, `Backend` | Fix configuration |
//!
//! Scheduler errors split by where they surface:
//!
//! | Surfaces from | `SchedulerError` variants |
//! |---------------|---------------------------|
//! | `submit` (synchronous) | `Validation`, `NoFeasibleResource`, `UnknownBackendKind`, `SelectorNotInitialized` |
//! | dispatch retry path | `ResourceUnavailable` (wrapped as the source of `NoFeasibleResource`) |
//! | `results` only | `TaskExecution`, `TaskCancelled`, `TaskNotFinished` |

use thiserror::Error;

use crate::backend::BackendKind;
use crate::resource::ResourceId;
use crate::task::TaskId;

/// Errors raised by backend adapters.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum HalError {
    /// Backend is not available (transient).
    #[error("Backend not available: {0}")]
    BackendUnavailable(String),

    /// Provider call timed out (transient).
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The work payload cannot run on this backend (permanent).
    #[error("Invalid work: {0}")]
    InvalidWork(String),

    /// Unsupported feature or device (permanent).
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Execution failed on the backend.
    #[error("Job failed: {0}")]
    JobFailed(String),

    /// Execution was cancelled by the backend.
    #[error("Job cancelled")]
    JobCancelled,

    /// Backend configuration is invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Generic backend error.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl HalError {
    /// Returns `true` if this error is transient and the operation may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_) | Self::Timeout(_))
    }

    /// Stable category name, preserved when the error is wrapped by the scheduler.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::Timeout(_) => "timeout",
            Self::InvalidWork(_) => "invalid_work",
            Self::Unsupported(_) => "unsupported",
            Self::JobFailed(_) => "job_failed",
            Self::JobCancelled => "job_cancelled",
            Self::Configuration(_) => "configuration",
            Self::Backend(_) => "backend",
        }
    }
}

/// Result type for backend operations.
pub type HalResult<T> = Result<T, HalError>;

/// Errors surfaced by the scheduler.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SchedulerError {
    /// Malformed task descriptor.
    #[error("Invalid task: {0}")]
    Validation(String),

    /// Hard constraints could not be satisfied after any retries.
    #[error("No feasible resource for task {correlation_id}: {reason}")]
    NoFeasibleResource {
        correlation_id: String,
        reason: String,
        #[source]
        source: Option<Box<SchedulerError>>,
    },

    /// The chosen resource failed its probe between selection and dispatch.
    #[error("Resource {resource_id} unavailable: {reason}")]
    ResourceUnavailable {
        resource_id: ResourceId,
        reason: String,
    },

    /// No factory is registered for the backend kind.
    #[error("Unknown backend kind: {0}")]
    UnknownBackendKind(BackendKind),

    /// Selection was requested before any resource pool was registered.
    #[error("Selector not initialized: {0}")]
    SelectorNotInitialized(String),

    /// The compute plane raised an error while executing the task.
    #[error("Task {task_id} failed ({kind}): {message}")]
    TaskExecution {
        task_id: TaskId,
        kind: String,
        message: String,
    },

    /// The task id is not known to this scheduler.
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// Results were requested for a task that has not reached a terminal state.
    #[error("Task {0} has not finished")]
    TaskNotFinished(TaskId),

    /// The task was cancelled and has no result.
    #[error("Task {0} was cancelled")]
    TaskCancelled(TaskId),

    /// Scheduler configuration is invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl SchedulerError {
    /// Builds a `NoFeasibleResource` error without an underlying cause.
    pub fn infeasible(correlation_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NoFeasibleResource {
            correlation_id: correlation_id.into(),
            reason: reason.into(),
            source: None,
        }
    }

    /// A failure recorded for the task it occurred in.
    pub fn execution(task_id: TaskId, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TaskExecution {
            task_id,
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Stable category name recorded in lifecycle records.
    pub fn kind(&self) -> &str {
        match self {
            Self::Validation(_) => "validation",
            Self::NoFeasibleResource { .. } => "no_feasible_resource",
            Self::ResourceUnavailable { .. } => "resource_unavailable",
            Self::UnknownBackendKind(_) => "unknown_backend_kind",
            Self::SelectorNotInitialized(_) => "selector_not_initialized",
            Self::TaskExecution { kind, .. } => kind,
            Self::TaskNotFound(_) => "task_not_found",
            Self::TaskNotFinished(_) => "task_not_finished",
            Self::TaskCancelled(_) => "task_cancelled",
            Self::Configuration(_) => "configuration",
        }
    }

    /// Returns `true` if a fresh selection may succeed where this one failed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ResourceUnavailable { .. })
    }
}

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(HalError::BackendUnavailable("offline".into()).is_transient());
        assert!(HalError::Timeout("probe".into()).is_transient());
        assert!(!HalError::InvalidWork("bad".into()).is_transient());
        assert!(!HalError::JobFailed("error".into()).is_transient());
    }

    #[test]
    fn test_execution_error_preserves_kind_and_message() {
        let cause = HalError::JobFailed("division by zero".into());
        let err = SchedulerError::execution(TaskId::from("t-1"), cause.kind(), cause.to_string());
        match &err {
            SchedulerError::TaskExecution { kind, message, .. } => {
                assert_eq!(kind, "job_failed");
                assert!(message.contains("division by zero"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn test_infeasible_keeps_source() {
        let cause = SchedulerError::ResourceUnavailable {
            resource_id: ResourceId::new("pool-a", "aer"),
            reason: "probe failed".into(),
        };
        assert!(cause.is_retryable());
        let err = SchedulerError::NoFeasibleResource {
            correlation_id: "corr-7".into(),
            reason: "retries exhausted".into(),
            source: Some(Box::new(cause)),
        };
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(
            source.as_deref(),
            Some("Resource pool-a/aer unavailable: probe failed")
        );
        assert!(!err.is_retryable());
    }
}
