//! Scheduler configuration.
//!
//! All options have defaults, so an empty JSON object is a valid
//! configuration:
//!
//! ```
//! use hal_scheduler::SchedulerConfig;
//!
//! let config = SchedulerConfig::from_json(r#"{"optimization_mode": "high_quality"}"#).unwrap();
//! assert_eq!(config.cache_ttl_seconds, 30);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SchedulerError, SchedulerResult};
use crate::selector::{OptimizationMode, ScoringWeights};

/// Default TTL for cached probe samples and catalog entries.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 30;

/// Default interval between background refresh cycles.
pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 60;

/// Default number of reselections after a dispatch-time probe failure.
pub const DEFAULT_FEASIBILITY_RETRY_COUNT: u32 = 1;

/// Default consecutive probe failures before a handle is evicted.
pub const DEFAULT_PROBE_FAILURE_THRESHOLD: u32 = 1;

/// Default upper bound on a single provider call.
pub const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 10;

/// Largest batch (tasks × slots) solved exactly; larger batches go greedy.
pub const DEFAULT_EXACT_MATCH_LIMIT: usize = 4096;

/// Batch headroom above a device's reported queue when its pool declares no
/// queue limit.
pub const DEFAULT_QUEUE_LIMIT: u32 = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub optimization_mode: OptimizationMode,
    pub cache_ttl_seconds: u64,
    pub monitor_interval_seconds: u64,
    pub feasibility_retry_count: u32,
    pub scoring_weights: ScoringWeights,
    pub probe_failure_threshold: u32,
    pub provider_timeout_seconds: u64,
    pub exact_match_limit: usize,
    pub default_queue_limit: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            optimization_mode: OptimizationMode::default(),
            cache_ttl_seconds: DEFAULT_CACHE_TTL_SECS,
            monitor_interval_seconds: DEFAULT_MONITOR_INTERVAL_SECS,
            feasibility_retry_count: DEFAULT_FEASIBILITY_RETRY_COUNT,
            scoring_weights: ScoringWeights::default(),
            probe_failure_threshold: DEFAULT_PROBE_FAILURE_THRESHOLD,
            provider_timeout_seconds: DEFAULT_PROVIDER_TIMEOUT_SECS,
            exact_match_limit: DEFAULT_EXACT_MATCH_LIMIT,
            default_queue_limit: DEFAULT_QUEUE_LIMIT,
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json(json: &str) -> SchedulerResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| SchedulerError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.cache_ttl_seconds == 0 {
            return Err(SchedulerError::Configuration(
                "cache_ttl_seconds must be > 0".into(),
            ));
        }
        if self.monitor_interval_seconds == 0 {
            return Err(SchedulerError::Configuration(
                "monitor_interval_seconds must be > 0".into(),
            ));
        }
        if self.probe_failure_threshold == 0 {
            return Err(SchedulerError::Configuration(
                "probe_failure_threshold must be >= 1".into(),
            ));
        }
        self.scoring_weights.validate()
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_seconds)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_seconds)
    }

    pub fn with_optimization_mode(mut self, mode: OptimizationMode) -> Self {
        self.optimization_mode = mode;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_seconds = ttl.as_secs().max(1);
        self
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval_seconds = interval.as_secs().max(1);
        self
    }

    pub fn with_feasibility_retry_count(mut self, retries: u32) -> Self {
        self.feasibility_retry_count = retries;
        self
    }

    pub fn with_scoring_weights(mut self, weights: ScoringWeights) -> Self {
        self.scoring_weights = weights;
        self
    }

    pub fn with_probe_failure_threshold(mut self, threshold: u32) -> Self {
        self.probe_failure_threshold = threshold.max(1);
        self
    }
}
