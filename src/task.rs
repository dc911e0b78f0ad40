//! Task descriptors and the task lifecycle.
//!
//! The task state machine:
//!
//! ```text
//!   Created ──→ Selecting ──→ Infeasible ──→ Failed
//!      │            │
//!      │            └──→ Assigned ──→ Dispatched ──→ Running ──→ Completed
//!      │                    │             │             │
//!      │                    │             │             └──→ Failed
//!      └────────────────────┴─────────────┴─────────────┴──→ Cancelled
//! ```
//!
//! **Invariants:**
//! - Transitions are monotonic; a task never moves backward.
//! - Terminal states (`Completed`, `Failed`, `Cancelled`) are permanent.
//! - Cancelling before `Dispatched` consumes no resource.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capability::CapabilitySet;
use crate::error::{SchedulerError, SchedulerResult};
use crate::pool::PoolId;
use crate::selector::OptimizationMode;

/// Unique identifier for a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// A fresh random id.
    pub fn generate() -> Self {
        Self(format!("task-{}", uuid::Uuid::new_v4()))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Created,
    Selecting,
    /// No resource satisfies the hard constraints; about to fail.
    Infeasible,
    Assigned,
    Dispatched,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the task has been handed to the compute plane.
    pub fn is_dispatched(&self) -> bool {
        matches!(self, Self::Dispatched | Self::Running)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Created, Selecting) => true,
            (Selecting, Infeasible | Assigned | Failed) => true,
            (Infeasible, Failed) => true,
            (Assigned, Dispatched | Failed) => true,
            // A dispatch probe failure sends the task back through selection.
            (Assigned, Selecting) => true,
            (Dispatched, Running | Failed) => true,
            (Running, Completed | Failed) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "CREATED",
            Self::Selecting => "SELECTING",
            Self::Infeasible => "INFEASIBLE",
            Self::Assigned => "ASSIGNED",
            Self::Dispatched => "DISPATCHED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(name)
    }
}

/// Compute-side hints forwarded to the compute plane. Not used for selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerator_count: Option<u32>,
    /// Memory in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
}

/// Task submission descriptor: everything about a task except its work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub required_capacity: u32,
    pub required_capabilities: CapabilitySet,
    #[serde(default)]
    pub requirements: Requirements,
    pub correlation_id: String,
    /// Overrides the scheduler's default optimization mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimization_mode: Option<OptimizationMode>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub excluded_pools: BTreeSet<PoolId>,
}

impl TaskDescriptor {
    pub fn new<S: AsRef<str>>(
        correlation_id: impl Into<String>,
        required_capacity: u32,
        required_capabilities: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            required_capacity,
            required_capabilities: required_capabilities.into_iter().collect(),
            requirements: Requirements::default(),
            correlation_id: correlation_id.into(),
            optimization_mode: None,
            excluded_pools: BTreeSet::new(),
        }
    }

    pub fn with_mode(mut self, mode: OptimizationMode) -> Self {
        self.optimization_mode = Some(mode);
        self
    }

    pub fn excluding_pool(mut self, pool: impl Into<String>) -> Self {
        self.excluded_pools.insert(PoolId::new(pool));
        self
    }

    pub fn with_requirements(mut self, requirements: Requirements) -> Self {
        self.requirements = requirements;
        self
    }

    /// Checks the descriptor invariants.
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.required_capacity < 1 {
            return Err(SchedulerError::Validation(format!(
                "task {}: required_capacity must be >= 1",
                self.correlation_id
            )));
        }
        if self.required_capabilities.is_empty() {
            return Err(SchedulerError::Validation(format!(
                "task {}: required_capabilities must not be empty",
                self.correlation_id
            )));
        }
        Ok(())
    }
}

/// A submitted task: an id, the opaque work reference and its descriptor.
#[derive(Debug)]
pub struct Task<W> {
    pub id: TaskId,
    pub work: W,
    pub descriptor: TaskDescriptor,
}

impl<W> Task<W> {
    pub fn new(work: W, descriptor: TaskDescriptor) -> Self {
        Self {
            id: TaskId::generate(),
            work,
            descriptor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_status_terminal() {
        assert!(!TaskStatus::Created.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_transitions_are_monotonic() {
        use TaskStatus::*;
        assert!(Created.can_transition_to(Selecting));
        assert!(Selecting.can_transition_to(Infeasible));
        assert!(Infeasible.can_transition_to(Failed));
        assert!(Running.can_transition_to(Completed));
        assert!(Created.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Cancelled));

        assert!(!Running.can_transition_to(Selecting));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Created.can_transition_to(Running));
    }

    #[test]
    fn test_validation() {
        assert!(TaskDescriptor::new("c", 2, ["h"]).validate().is_ok());
        assert!(matches!(
            TaskDescriptor::new("c", 0, ["h"]).validate(),
            Err(SchedulerError::Validation(_))
        ));
        assert!(matches!(
            TaskDescriptor::new("c", 1, Vec::<String>::new()).validate(),
            Err(SchedulerError::Validation(_))
        ));
    }

    #[test]
    fn test_descriptor_from_json() {
        let d: TaskDescriptor = serde_json::from_value(serde_json::json!({
            "required_capacity": 2,
            "required_capabilities": ["g1", "g2"],
            "requirements": {"parallelism": 4},
            "correlation_id": "corr-1",
            "optimization_mode": "high_speed",
            "excluded_pools": ["pool-b"],
        }))
        .unwrap();
        assert_eq!(d.optimization_mode, Some(OptimizationMode::HighSpeed));
        assert_eq!(d.requirements.parallelism, Some(4));
        assert!(d.excluded_pools.contains(&PoolId::from("pool-b")));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(TaskStatus::Dispatched.to_string(), "DISPATCHED");
        assert_eq!(
            serde_json::to_string(&TaskStatus::Completed).unwrap(),
            "\"COMPLETED\""
        );
    }
}
