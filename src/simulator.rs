//! In-memory simulator backend.
//!
//! Executes any work type by returning an even split between the all-zeros
//! and all-ones bitstrings. Availability, queue depth, calibration and
//! failures can be scripted per device, which is what the scheduler's tests
//! and the demo rely on.
//!
//! ```
//! use std::sync::Arc;
//! use hal_scheduler::{Capabilities, SimulatorBackend};
//!
//! let sim = Arc::new(SimulatorBackend::new(vec![Capabilities::simulator("aer", 8)]));
//! sim.set_queue_depth("aer", 3);
//! sim.set_available("aer", false);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use crate::backend::{Backend, BackendAvailability, BackendKind};
use crate::capability::Capabilities;
use crate::error::{HalError, HalResult};
use crate::pool::BackendConfig;
use crate::result::{Counts, ExecutionResult};
use crate::task::Task;

/// Shots reported by every simulated execution.
pub const SIMULATED_SHOTS: u64 = 1024;

/// Qubits of the default device when the configuration names none.
const DEFAULT_NUM_QUBITS: u32 = 32;

#[derive(Debug, Clone)]
struct DeviceState {
    available: bool,
    queue_depth: u32,
    calibration: Option<(f64, f64)>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            available: true,
            queue_depth: 0,
            calibration: None,
        }
    }
}

#[derive(Debug, Default)]
struct Script {
    devices: FxHashMap<String, DeviceState>,
    provider_error: Option<HalError>,
    execution_error: Option<HalError>,
    availability_delay: Duration,
    execution_delay: Duration,
}

/// Scriptable in-memory backend.
#[derive(Debug)]
pub struct SimulatorBackend {
    kind: BackendKind,
    devices: Vec<Capabilities>,
    script: Mutex<Script>,
    availability_calls: AtomicU64,
    executions: AtomicU64,
}

impl SimulatorBackend {
    pub fn new(devices: Vec<Capabilities>) -> Self {
        let script = Script {
            devices: devices
                .iter()
                .map(|d| (d.name.clone(), DeviceState::default()))
                .collect(),
            ..Script::default()
        };
        Self {
            kind: BackendKind::SIMULATOR,
            devices,
            script: Mutex::new(script),
            availability_calls: AtomicU64::new(0),
            executions: AtomicU64::new(0),
        }
    }

    /// Builds a simulator from a pool's backend configuration.
    ///
    /// Recognized keys: `devices` (array of device descriptions) or
    /// `num_qubits` (one simulator device named `aer_simulator`).
    pub fn from_config(config: &BackendConfig) -> HalResult<Self> {
        if let Some(devices) = config.get("devices") {
            let devices: Vec<Capabilities> = serde_json::from_value(devices.clone())
                .map_err(|e| HalError::Configuration(format!("invalid 'devices': {e}")))?;
            if devices.is_empty() {
                return Err(HalError::Configuration("'devices' must not be empty".into()));
            }
            return Ok(Self::new(devices));
        }
        let num_qubits = match config.get("num_qubits") {
            None => DEFAULT_NUM_QUBITS,
            Some(value) => value
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| {
                    HalError::Configuration(format!("'num_qubits' must be a u32, got {value}"))
                })?,
        };
        Ok(Self::new(vec![Capabilities::simulator("aer_simulator", num_qubits)]))
    }

    /// Registers under a different backend kind, e.g. to stand in for a provider.
    pub fn with_kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }

    /// A factory that hands out this very instance, so scripted state is
    /// shared with whoever holds the `Arc`.
    pub fn shared_factory<W: Send + Sync + 'static>(
        self: &Arc<Self>,
    ) -> impl Fn(&BackendConfig) -> HalResult<Arc<dyn Backend<W>>> + Send + Sync + 'static {
        let backend = Arc::clone(self);
        move |_config: &BackendConfig| -> HalResult<Arc<dyn Backend<W>>> {
            Ok(Arc::clone(&backend) as Arc<dyn Backend<W>>)
        }
    }

    /// A factory that builds a fresh simulator per configuration.
    pub fn config_factory<W: Send + Sync + 'static>()
    -> impl Fn(&BackendConfig) -> HalResult<Arc<dyn Backend<W>>> + Send + Sync + 'static {
        |config: &BackendConfig| -> HalResult<Arc<dyn Backend<W>>> {
            Ok(Arc::new(Self::from_config(config)?))
        }
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_available(&self, device: &str, available: bool) {
        self.script()
            .devices
            .entry(device.to_string())
            .or_default()
            .available = available;
    }

    pub fn set_queue_depth(&self, device: &str, depth: u32) {
        self.script()
            .devices
            .entry(device.to_string())
            .or_default()
            .queue_depth = depth;
    }

    /// Live calibration reported by availability samples.
    pub fn set_calibration(&self, device: &str, quality_score: f64, error_rate: f64) {
        self.script()
            .devices
            .entry(device.to_string())
            .or_default()
            .calibration = Some((quality_score, error_rate));
    }

    /// Makes every availability query fail with `error` until reset with `None`.
    pub fn fail_provider(&self, error: Option<HalError>) {
        self.script().provider_error = error;
    }

    /// Makes every execution fail with `error` until reset with `None`.
    pub fn fail_executions(&self, error: Option<HalError>) {
        self.script().execution_error = error;
    }

    pub fn set_availability_delay(&self, delay: Duration) {
        self.script().availability_delay = delay;
    }

    pub fn set_execution_delay(&self, delay: Duration) {
        self.script().execution_delay = delay;
    }

    /// Number of availability queries answered or attempted.
    pub fn availability_calls(&self) -> u64 {
        self.availability_calls.load(Ordering::Relaxed)
    }

    /// Number of executions started.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    fn knows(&self, device: &str) -> HalResult<()> {
        if self.devices.iter().any(|d| d.name == device) {
            Ok(())
        } else {
            Err(HalError::Unsupported(format!("unknown device '{device}'")))
        }
    }
}

#[async_trait]
impl<W: Send + Sync + 'static> Backend<W> for SimulatorBackend {
    fn kind(&self) -> &BackendKind {
        &self.kind
    }

    fn describe(&self) -> &[Capabilities] {
        &self.devices
    }

    async fn availability(&self, device: &str) -> HalResult<BackendAvailability> {
        self.availability_calls.fetch_add(1, Ordering::Relaxed);
        self.knows(device)?;
        let delay = self.script().availability_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let script = self.script();
        if let Some(err) = &script.provider_error {
            return Err(err.clone());
        }
        let state = script.devices.get(device).cloned().unwrap_or_default();
        let mut sample = if state.available {
            BackendAvailability::always_available().with_queue_depth(state.queue_depth)
        } else {
            BackendAvailability::unavailable("device offline")
        };
        if let Some((quality, error_rate)) = state.calibration {
            sample = sample.with_calibration(quality, error_rate);
        }
        Ok(sample)
    }

    async fn execute(&self, device: &str, task: &Task<W>) -> HalResult<ExecutionResult> {
        self.executions.fetch_add(1, Ordering::Relaxed);
        self.knows(device)?;
        let (delay, error) = {
            let script = self.script();
            (script.execution_delay, script.execution_error.clone())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = error {
            return Err(err);
        }

        let width = task.descriptor.required_capacity as usize;
        let counts: Counts = [
            ("0".repeat(width), SIMULATED_SHOTS / 2),
            ("1".repeat(width), SIMULATED_SHOTS - SIMULATED_SHOTS / 2),
        ]
        .into_iter()
        .collect();
        let elapsed_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        Ok(ExecutionResult::from_counts(counts).with_execution_time(elapsed_ms))
    }
}
