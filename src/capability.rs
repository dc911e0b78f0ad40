//! Device capability descriptions.
//!
//! A backend describes each device it exposes with a [`Capabilities`] record:
//! capacity (qubit count), the set of operations it supports, and the static
//! quality figures the selector scores on. The monitor turns these records
//! into [`QuantumResource`](crate::resource::QuantumResource) catalog entries.
//!
//! Capability names follow the OpenQASM 3 convention (lowercase). Names are
//! normalized on insertion so that `CNOT`, `cnot` and `cx` compare equal.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Normalizes an operation name: lowercase, with `cnot` folded into `cx`.
pub fn normalize_capability(name: &str) -> String {
    let lowered = name.trim().to_ascii_lowercase();
    match lowered.as_str() {
        "cnot" => "cx".to_string(),
        _ => lowered,
    }
}

/// A normalized set of supported operation names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct CapabilitySet(BTreeSet<String>);

impl CapabilitySet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a capability, normalizing its name.
    pub fn insert(&mut self, name: &str) -> bool {
        self.0.insert(normalize_capability(name))
    }

    /// Checks whether a single capability is present.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(&normalize_capability(name))
    }

    /// Checks whether every capability in `required` is present.
    pub fn is_superset(&self, required: &CapabilitySet) -> bool {
        self.0.is_superset(&required.0)
    }

    /// Capabilities present in both sets.
    pub fn intersection(&self, other: &CapabilitySet) -> CapabilitySet {
        Self(self.0.intersection(&other.0).cloned().collect())
    }

    /// Capabilities in `required` that are missing from this set.
    pub fn missing<'a>(&self, required: &'a CapabilitySet) -> Vec<&'a str> {
        required
            .0
            .iter()
            .filter(|name| !self.0.contains(*name))
            .map(String::as_str)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: AsRef<str>> FromIterator<S> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|name| normalize_capability(name.as_ref()))
                .collect(),
        )
    }
}

impl From<Vec<String>> for CapabilitySet {
    fn from(names: Vec<String>) -> Self {
        names.into_iter().collect()
    }
}

impl From<CapabilitySet> for Vec<String> {
    fn from(set: CapabilitySet) -> Self {
        set.0.into_iter().collect()
    }
}

/// Static description of one device exposed by a backend.
///
/// Returned by [`Backend::describe`](crate::backend::Backend::describe).
/// Quality and error rate are the calibration figures known at construction;
/// the monitor may override them with live values from an availability sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    /// Device name, unique within its backend.
    pub name: String,
    /// Capacity attribute (number of qubits).
    pub capacity: u32,
    /// Supported operations.
    pub capability_set: CapabilitySet,
    /// Quality score in `[0.0, 1.0]`, higher is better.
    pub quality_score: f64,
    /// Average error rate, lower is better.
    pub error_rate: f64,
    /// Relative cost of running one task on this device.
    pub cost_weight: f64,
    /// Whether this is a simulator (not real hardware).
    pub is_simulator: bool,
}

const UNIVERSAL_GATES: &[&str] = &[
    "id", "x", "y", "z", "h", "s", "sdg", "t", "tdg", "sx", "rx", "ry", "rz", "p", "u", "cx",
    "cy", "cz", "swap", "ccx", "measure",
];

impl Capabilities {
    /// A noiseless simulator with a universal gate set.
    pub fn simulator(name: impl Into<String>, num_qubits: u32) -> Self {
        Self {
            name: name.into(),
            capacity: num_qubits,
            capability_set: UNIVERSAL_GATES.iter().collect(),
            quality_score: 1.0,
            error_rate: 0.0,
            cost_weight: 0.0,
            is_simulator: true,
        }
    }

    /// IQM devices (PRX + CZ native).
    pub fn iqm(name: impl Into<String>, num_qubits: u32) -> Self {
        Self::hardware(name, num_qubits, &["prx", "cz", "measure"])
    }

    /// IBM Heron processors (CZ native).
    pub fn ibm_heron(name: impl Into<String>, num_qubits: u32) -> Self {
        Self::hardware(
            name,
            num_qubits,
            &["rz", "sx", "x", "id", "rx", "h", "cz", "rzz", "measure"],
        )
    }

    /// IonQ trapped-ion devices.
    pub fn ionq(name: impl Into<String>, num_qubits: u32) -> Self {
        Self::hardware(name, num_qubits, &["rx", "ry", "rz", "xx", "measure"])
    }

    /// Rigetti superconducting devices.
    pub fn rigetti(name: impl Into<String>, num_qubits: u32) -> Self {
        Self::hardware(name, num_qubits, &["rx", "rz", "cz", "measure"])
    }

    fn hardware(name: impl Into<String>, num_qubits: u32, gates: &[&str]) -> Self {
        Self {
            name: name.into(),
            capacity: num_qubits,
            capability_set: gates.iter().collect(),
            quality_score: 0.9,
            error_rate: 0.01,
            cost_weight: 1.0,
            is_simulator: false,
        }
    }

    /// Overrides the supported operations.
    pub fn with_capabilities<S: AsRef<str>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.capability_set = names.into_iter().collect();
        self
    }

    /// Sets calibration figures. Quality is clamped to `[0, 1]`, error rate to `>= 0`.
    pub fn with_calibration(mut self, quality_score: f64, error_rate: f64) -> Self {
        self.quality_score = quality_score.clamp(0.0, 1.0);
        self.error_rate = error_rate.max(0.0);
        self
    }

    /// Sets the relative cost.
    pub fn with_cost(mut self, cost_weight: f64) -> Self {
        self.cost_weight = cost_weight.max(0.0);
        self
    }
}
