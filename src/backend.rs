//! Backend capability contract.
//!
//! Every provider adapter implements [`Backend`]. The scheduler only ever
//! talks to providers through this trait:
//!
//! ```text
//!   describe() ──→ availability() / probe() ──→ execute()
//!  (sync, &ref)        (async, dynamic)          (async, on the compute plane)
//! ```
//!
//! ## Method table
//!
//! | Method | Kind | Required | Returns |
//! |--------|------|----------|---------|
//! | `kind()` | sync | yes | `&BackendKind` |
//! | `describe()` | sync | yes | `&[Capabilities]` |
//! | `availability()` | async | yes | `HalResult<BackendAvailability>` |
//! | `probe()` | async | provided | `bool` |
//! | `execute()` | async | yes | `HalResult<ExecutionResult>` |
//!
//! Backends are generic over the work type `W`, the opaque work reference
//! carried by a [`Task`]. The scheduler never looks inside `W`.
//!
//! New backend kinds are added by registering a [`BackendFactory`] with the
//! [`ExecutorRegistry`](crate::registry::ExecutorRegistry); neither the
//! selector nor the scheduler changes.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::capability::Capabilities;
use crate::error::HalResult;
use crate::pool::BackendConfig;
use crate::result::ExecutionResult;
use crate::task::Task;

/// Typed key identifying a family of backends.
///
/// Lookups are exact. The well-known kinds are provided as constants; any
/// other kind can be registered at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendKind(Cow<'static, str>);

impl BackendKind {
    pub const SIMULATOR: BackendKind = BackendKind(Cow::Borrowed("simulator"));
    pub const QISKIT: BackendKind = BackendKind(Cow::Borrowed("qiskit"));
    pub const PENNYLANE: BackendKind = BackendKind(Cow::Borrowed("pennylane"));
    pub const BRAKET: BackendKind = BackendKind(Cow::Borrowed("braket"));
    pub const IBMQ: BackendKind = BackendKind(Cow::Borrowed("ibmq"));

    pub fn new(kind: impl Into<String>) -> Self {
        Self(Cow::Owned(kind.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackendKind {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Capability surface of one backend configuration.
///
/// # Contract
///
/// - `describe()` MUST be synchronous and infallible. Device descriptions
///   are cached at construction time.
/// - `availability()` SHOULD be a lightweight liveness and queue query. It
///   may be slow; callers bound it with a timeout.
/// - `execute()` runs on the compute plane and may take arbitrarily long.
///   It MUST tolerate being dropped mid-flight (cancellation).
#[async_trait]
pub trait Backend<W: Send + Sync + 'static>: Send + Sync {
    /// The backend family this handle belongs to.
    fn kind(&self) -> &BackendKind;

    /// Static descriptions of the devices this backend exposes.
    fn describe(&self) -> &[Capabilities];

    /// Current availability, queue depth and, if the provider reports them,
    /// live calibration figures for one device.
    async fn availability(&self, device: &str) -> HalResult<BackendAvailability>;

    /// Health probe: `true` only if the device answered and is accepting work.
    async fn probe(&self, device: &str) -> bool {
        matches!(self.availability(device).await, Ok(a) if a.is_available)
    }

    /// Executes a task on a device.
    async fn execute(&self, device: &str, task: &Task<W>) -> HalResult<ExecutionResult>;
}

/// Builds backend handles for one [`BackendKind`].
pub trait BackendFactory<W: Send + Sync + 'static>: Send + Sync {
    fn create(&self, config: &BackendConfig) -> HalResult<Arc<dyn Backend<W>>>;
}

impl<W, F> BackendFactory<W> for F
where
    W: Send + Sync + 'static,
    F: Fn(&BackendConfig) -> HalResult<Arc<dyn Backend<W>>> + Send + Sync,
{
    fn create(&self, config: &BackendConfig) -> HalResult<Arc<dyn Backend<W>>> {
        self(config)
    }
}

/// A point-in-time availability sample for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendAvailability {
    /// Whether the device is currently accepting work.
    pub is_available: bool,
    /// Number of jobs currently queued (if known).
    pub queue_depth: Option<u32>,
    /// Estimated wait time for a new job in seconds (if known).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_wait_secs: Option<f64>,
    /// Live quality score, overriding the static description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    /// Live error rate, overriding the static description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_rate: Option<f64>,
    /// Human-readable status message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
}

impl BackendAvailability {
    /// Typical for simulators: available, empty queue.
    pub fn always_available() -> Self {
        Self {
            is_available: true,
            queue_depth: Some(0),
            estimated_wait_secs: Some(0.0),
            quality_score: None,
            error_rate: None,
            status_message: None,
        }
    }

    /// An offline device.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            is_available: false,
            queue_depth: None,
            estimated_wait_secs: None,
            quality_score: None,
            error_rate: None,
            status_message: Some(reason.into()),
        }
    }

    pub fn with_queue_depth(mut self, depth: u32) -> Self {
        self.queue_depth = Some(depth);
        self
    }

    pub fn with_calibration(mut self, quality_score: f64, error_rate: f64) -> Self {
        self.quality_score = Some(quality_score);
        self.error_rate = Some(error_rate);
        self
    }
}
