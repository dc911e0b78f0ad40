//! Scheduling demo with a hand-written mock QPU and the bundled simulator.
//!
//! This example shows how to implement the `Backend` trait for a custom
//! provider, register it next to a simulator pool, and drive submissions
//! through the scheduler.
//!
//! Run with `RUST_LOG=hal_scheduler=debug` to see every selection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use hal_scheduler::logging::init_logging;
use hal_scheduler::{
    Backend, BackendAvailability, BackendConfig, BackendKind, Capabilities, Counts,
    ExecutionResult, HalError, HalResult, MetricsLog, OptimizationMode, PoolDescriptor,
    SchedulerConfig, SchedulerError, SimulatorBackend, Task, TaskDescriptor, TaskScheduler,
};

/// A simple circuit type for demonstration.
struct SimpleCircuit {
    name: String,
    gates: Vec<String>,
}

/// Mock superconducting QPU with a growing queue.
struct MockQpu {
    kind: BackendKind,
    devices: Vec<Capabilities>,
    queue: AtomicU32,
}

impl MockQpu {
    fn new() -> Self {
        Self {
            kind: BackendKind::new("mock-qpu"),
            devices: vec![Capabilities::ibm_heron("heron-r2", 133).with_cost(2.0)],
            queue: AtomicU32::new(3),
        }
    }
}

#[async_trait]
impl Backend<SimpleCircuit> for MockQpu {
    fn kind(&self) -> &BackendKind {
        &self.kind
    }

    fn describe(&self) -> &[Capabilities] {
        &self.devices
    }

    async fn availability(&self, device: &str) -> HalResult<BackendAvailability> {
        if !self.devices.iter().any(|d| d.name == device) {
            return Err(HalError::Unsupported(format!("unknown device '{device}'")));
        }
        Ok(BackendAvailability::always_available()
            .with_queue_depth(self.queue.load(Ordering::Relaxed))
            .with_calibration(0.97, 0.012))
    }

    async fn execute(&self, _device: &str, task: &Task<SimpleCircuit>) -> HalResult<ExecutionResult> {
        self.queue.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.queue.fetch_sub(1, Ordering::Relaxed);

        let width = task.descriptor.required_capacity as usize;
        let counts: Counts = [("0".repeat(width), 496), ("1".repeat(width), 528)]
            .into_iter()
            .collect();
        Ok(ExecutionResult::from_counts(counts).with_execution_time(50))
    }
}

fn circuit(name: &str, gates: &[&str]) -> SimpleCircuit {
    SimpleCircuit {
        name: name.to_string(),
        gates: gates.iter().map(|g| g.to_string()).collect(),
    }
}

fn describe(circuit: &SimpleCircuit, qubits: u32, correlation_id: &str) -> TaskDescriptor {
    TaskDescriptor::new(correlation_id, qubits, &circuit.gates)
}

#[tokio::main]
async fn main() -> Result<(), SchedulerError> {
    init_logging();

    let config = SchedulerConfig::default().with_optimization_mode(OptimizationMode::Balanced);
    let scheduler = TaskScheduler::<SimpleCircuit>::with_metrics(config, MetricsLog::in_memory())?;

    let qpu = Arc::new(MockQpu::new());
    scheduler.register_factory(
        BackendKind::new("mock-qpu"),
        move |_config: &BackendConfig| -> HalResult<Arc<dyn Backend<SimpleCircuit>>> {
            Ok(Arc::clone(&qpu) as Arc<dyn Backend<SimpleCircuit>>)
        },
    );
    scheduler.register_factory(
        BackendKind::SIMULATOR,
        SimulatorBackend::config_factory::<SimpleCircuit>(),
    );

    scheduler.register_pool(PoolDescriptor::new("cloud-qpu", BackendKind::new("mock-qpu")))?;
    scheduler.register_pool(
        PoolDescriptor::new("local-sim", BackendKind::SIMULATOR)
            .with_config("num_qubits", serde_json::json!(24)),
    )?;

    let report = scheduler.refresh_catalog().await;
    println!(
        "catalog: {} resources from {} pools (generation {:?})",
        report.resources, report.pools, report.generation
    );

    // Single submissions under different modes.
    let bell = circuit("bell", &["h", "cx", "measure"]);
    let wide = circuit("ghz-40", &["h", "cx", "measure"]);
    let bell_desc = describe(&bell, 2, "bell").with_mode(OptimizationMode::HighSpeed);
    let wide_desc = describe(&wide, 40, "ghz-40").with_mode(OptimizationMode::HighQuality);

    let mut handles = Vec::new();
    for (work, descriptor) in [(bell, bell_desc), (wide, wide_desc)] {
        let name = work.name.clone();
        match scheduler.submit(work, descriptor).await {
            Ok(handle) => {
                let record = scheduler.record(handle.id());
                let resource = record.and_then(|r| r.resource_id).map(|r| r.to_string());
                println!("{name}: dispatched to {}", resource.unwrap_or_default());
                handles.push(handle);
            }
            Err(e) => println!("{name}: {e}"),
        }
    }

    // Too wide for every device.
    let huge = circuit("qft-500", &["h", "cp", "measure"]);
    let huge_desc = describe(&huge, 500, "qft-500");
    if let Err(e) = scheduler.submit(huge, huge_desc).await {
        println!("qft-500: {e}");
    }

    // A batch assigned jointly.
    let batch: Vec<_> = (0..4)
        .map(|i| {
            let work = circuit(&format!("sample-{i}"), &["rx", "rz", "measure"]);
            let descriptor = describe(&work, 4, &format!("sample-{i}"));
            (work, descriptor)
        })
        .collect();
    for result in scheduler.submit_batch(batch).await {
        match result {
            Ok(handle) => handles.push(handle),
            Err(e) => println!("batch task: {e}"),
        }
    }

    let outcome = scheduler.wait(&handles, Some(Duration::from_secs(10))).await;
    println!("finished {}, pending {}", outcome.finished.len(), outcome.pending.len());

    for (handle, result) in handles.iter().zip(scheduler.results(&handles)?) {
        let (top, count) = result.counts.most_frequent().unwrap_or(("", 0));
        println!(
            "{}: {} shots, most frequent {top} ({count})",
            handle.correlation_id(),
            result.counts.total_shots()
        );
    }

    let info = scheduler.cache_info();
    println!(
        "cache: {} samples, hit rate {:.0}%, {} executor handles",
        info.values.entries,
        info.values.hit_rate() * 100.0,
        info.executor_handles
    );

    for record in scheduler.records() {
        println!(
            "{} {} wait={:?}s exec={:?}s",
            record.correlation_id, record.status, record.wait_time, record.execution_time
        );
    }

    scheduler.shutdown().await;
    Ok(())
}
