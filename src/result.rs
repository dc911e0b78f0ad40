//! Execution results returned by backends.
//!
//! Bitstring ordering in [`Counts`]: the rightmost bit corresponds to the
//! lowest-indexed qubit (OpenQASM 3 convention).

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Measurement counts, bitstring to occurrences.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Counts(FxHashMap<String, u64>);

impl Counts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds occurrences; repeated bitstrings accumulate.
    pub fn insert(&mut self, bitstring: impl Into<String>, count: u64) {
        *self.0.entry(bitstring.into()).or_default() += count;
    }

    pub fn get(&self, bitstring: &str) -> u64 {
        self.0.get(bitstring).copied().unwrap_or(0)
    }

    pub fn total_shots(&self) -> u64 {
        self.0.values().sum()
    }

    /// Most frequent bitstring; ties resolve to the lexicographically smallest.
    pub fn most_frequent(&self) -> Option<(&str, u64)> {
        self.0
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(k, &v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, u64)> for Counts {
    fn from_iter<I: IntoIterator<Item = (S, u64)>>(iter: I) -> Self {
        let mut counts = Self::new();
        for (bitstring, count) in iter {
            counts.insert(bitstring, count);
        }
        counts
    }
}

/// Value produced by a successful execution.
///
/// `output` carries whatever the backend returns for the work payload
/// (expectation values, samples, a classical return value); `counts` is filled
/// by backends that measure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default, skip_serializing_if = "Counts::is_empty")]
    pub counts: Counts,
    #[serde(default)]
    pub output: serde_json::Value,
    /// Backend-reported execution time in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
}

impl ExecutionResult {
    pub fn from_counts(counts: Counts) -> Self {
        Self {
            counts,
            ..Self::default()
        }
    }

    pub fn from_output(output: serde_json::Value) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }

    pub fn with_execution_time(mut self, time_ms: u64) -> Self {
        self.execution_time_ms = Some(time_ms);
        self
    }
}
