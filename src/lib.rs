//! HAL Scheduler: resource selection and task orchestration for
//! heterogeneous quantum-HPC backends.
//!
//! The scheduler keeps a catalog of quantum resources discovered from
//! registered [`ResourcePool`]s, picks a resource for each submitted task
//! under an [`OptimizationMode`], probes it, and hands the task to the
//! compute plane. Every backend (simulator, cloud QPU, on-premise device)
//! plugs in through the [`Backend`] trait and a [`BackendFactory`].
//!
//! # Overview
//!
//! - [`TaskScheduler`] is the entry point: submission, batches, waiting,
//!   results, cancellation and operator controls
//! - [`ResourceCatalog`] publishes immutable [`CatalogSnapshot`]s
//! - [`ExecutorRegistry`] caches backend handles and availability samples
//! - [`ResourceSelector`] filters and scores candidates; batches go through
//!   a [`Matcher`]
//! - [`BackgroundMonitor`] refreshes the catalog periodically
//! - [`MetricsLog`] receives one [`TaskRecord`] per finished task
//!
//! # Lifecycle
//!
//! ```text
//!   CREATED ──→ SELECTING ──→ ASSIGNED ──→ DISPATCHED ──→ RUNNING ──→ COMPLETED
//!                   │   ↑          │                                 └──→ FAILED
//!                   │   └──────────┘ (probe failed, reselect)
//!                   └──→ INFEASIBLE ──→ FAILED
//! ```
//!
//! Any non-terminal task may move to `CANCELLED`.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hal_scheduler::{
//!     BackendKind, Capabilities, PoolDescriptor, SchedulerConfig, SimulatorBackend,
//!     TaskDescriptor, TaskScheduler,
//! };
//!
//! # async fn run() -> hal_scheduler::SchedulerResult<()> {
//! let scheduler = TaskScheduler::<String>::new(SchedulerConfig::default())?;
//! let sim = Arc::new(SimulatorBackend::new(vec![Capabilities::simulator("aer", 32)]));
//! scheduler.register_factory(BackendKind::SIMULATOR, sim.shared_factory::<String>());
//! scheduler.register_pool(PoolDescriptor::new("local", BackendKind::SIMULATOR))?;
//!
//! let handle = scheduler
//!     .submit("bell".to_string(), TaskDescriptor::new("job-1", 2, ["h", "cx"]))
//!     .await?;
//! scheduler.wait(&[handle.clone()], None).await;
//! let results = scheduler.results(&[handle])?;
//! # let _ = results;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod capability;
pub mod catalog;
pub mod compute;
pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod matching;
pub mod metrics;
pub mod monitor;
pub mod pool;
pub mod registry;
pub mod resource;
pub mod result;
pub mod scheduler;
pub mod selector;
pub mod simulator;
pub mod task;

pub use backend::{Backend, BackendAvailability, BackendFactory, BackendKind};
pub use cache::{CacheInfo, TtlCache, ValueCache, ValueCacheStats};
pub use capability::{Capabilities, CapabilitySet};
pub use catalog::{CatalogSnapshot, ResourceCatalog};
pub use compute::ComputePlane;
pub use config::SchedulerConfig;
pub use context::SchedulerContext;
pub use error::{HalError, HalResult, SchedulerError, SchedulerResult};
pub use lifecycle::{Lifecycle, Settled, TaskRecord};
pub use matching::{ExactMatcher, GreedyMatcher, Matcher, ScoreMatrix};
pub use metrics::{JsonLinesSink, MemorySink, MetricsLog, MetricsSink, NullSink};
pub use monitor::{BackgroundMonitor, MonitorHandle, RefreshReport};
pub use pool::{BackendConfig, OptimizationDefaults, PoolDescriptor, PoolId, ResourcePool};
pub use registry::{ExecutorHandle, ExecutorRegistry, HandleKey};
pub use resource::{QuantumResource, ResourceId};
pub use result::{Counts, ExecutionResult};
pub use scheduler::{TaskHandle, TaskScheduler, WaitOutcome};
pub use selector::{
    BatchAssignment, ModeScorer, OptimizationMode, ResourceSelector, Scorer, ScoringWeights,
    Selection,
};
pub use simulator::SimulatorBackend;
pub use task::{Requirements, Task, TaskDescriptor, TaskId, TaskStatus};
