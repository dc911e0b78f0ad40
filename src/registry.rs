//! Executor registry: backend factories and cached handles.
//!
//! Handles are keyed by `(BackendKind, ConfigFingerprint)`, so pools with an
//! identical backend configuration share one handle. Lookups of unknown
//! kinds fail with [`SchedulerError::UnknownBackendKind`]; there is no
//! fallback to a default backend.
//!
//! ## Probe failures
//!
//! A provider error or timeout increments a per-handle counter; any answer
//! from the provider resets it, including one reporting the device offline.
//! A handle whose counter reaches the configured threshold is evicted, and
//! the next lookup rebuilds it from the factory. An offline device is a
//! property of the device, not of the connection, so it never costs the
//! pool its handle.
//!
//! ## Probe samples
//!
//! Successful availability samples are stored in the shared
//! [`ValueCache`](crate::cache::ValueCache) keyed by resource id.
//! [`ExecutorRegistry::is_available`] answers from a fresh cached sample and
//! only calls the provider on a miss.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::backend::{Backend, BackendAvailability, BackendFactory, BackendKind};
use crate::cache::ValueCache;
use crate::error::{HalError, HalResult, SchedulerError, SchedulerResult};
use crate::pool::{BackendConfig, ConfigFingerprint, ResourcePool};
use crate::resource::ResourceId;

/// Cache key of an executor handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandleKey {
    pub kind: BackendKind,
    pub fingerprint: ConfigFingerprint,
}

impl fmt::Display for HandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.fingerprint)
    }
}

/// A live backend for one configuration.
pub struct ExecutorHandle<W> {
    key: HandleKey,
    backend: Arc<dyn Backend<W>>,
}

impl<W> Clone for ExecutorHandle<W> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<W> fmt::Debug for ExecutorHandle<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorHandle").field("key", &self.key).finish()
    }
}

impl<W: Send + Sync + 'static> ExecutorHandle<W> {
    pub fn key(&self) -> &HandleKey {
        &self.key
    }

    pub fn backend(&self) -> &Arc<dyn Backend<W>> {
        &self.backend
    }
}

struct HandleEntry<W> {
    handle: ExecutorHandle<W>,
    failures: u32,
}

/// Maps backend kinds to factories and caches the handles they build.
pub struct ExecutorRegistry<W> {
    factories: RwLock<FxHashMap<BackendKind, Arc<dyn BackendFactory<W>>>>,
    handles: DashMap<HandleKey, HandleEntry<W>>,
    samples: Arc<ValueCache>,
    probe_failure_threshold: u32,
    provider_timeout: Duration,
}

impl<W> fmt::Debug for ExecutorRegistry<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("handles", &self.handles.len())
            .field("probe_failure_threshold", &self.probe_failure_threshold)
            .field("provider_timeout", &self.provider_timeout)
            .finish()
    }
}

impl<W: Send + Sync + 'static> ExecutorRegistry<W> {
    pub fn new(samples: Arc<ValueCache>, probe_failure_threshold: u32, provider_timeout: Duration) -> Self {
        Self {
            factories: RwLock::new(FxHashMap::default()),
            handles: DashMap::new(),
            samples,
            probe_failure_threshold: probe_failure_threshold.max(1),
            provider_timeout,
        }
    }

    /// Registers (or replaces) the factory for `kind`.
    pub fn register_factory(&self, kind: BackendKind, factory: impl BackendFactory<W> + 'static) {
        info!(backend = %kind, "Registered backend factory");
        self.factories
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind.clone(), Arc::new(factory));
        // Handles built by a replaced factory must not outlive it.
        self.handles.retain(|key, _| key.kind != kind);
    }

    /// Backend kinds with a registered factory, sorted.
    pub fn supported_kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<_> = self
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }

    pub fn is_supported(&self, kind: &BackendKind) -> bool {
        self.factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(kind)
    }

    /// The cached handle for this configuration, or a new one from the factory.
    pub fn get_handle(&self, kind: &BackendKind, config: &BackendConfig) -> SchedulerResult<ExecutorHandle<W>> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(kind)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownBackendKind(kind.clone()))?;

        let key = HandleKey {
            kind: kind.clone(),
            fingerprint: ConfigFingerprint::compute(kind, config),
        };
        match self.handles.entry(key.clone()) {
            Entry::Occupied(entry) => Ok(entry.get().handle.clone()),
            Entry::Vacant(entry) => {
                let backend = factory.create(config).map_err(|e| {
                    SchedulerError::Configuration(format!("cannot build {kind} backend: {e}"))
                })?;
                debug!(handle = %key, "Created executor handle");
                let handle = ExecutorHandle { key, backend };
                entry.insert(HandleEntry {
                    handle: handle.clone(),
                    failures: 0,
                });
                Ok(handle)
            }
        }
    }

    /// [`get_handle`](Self::get_handle) for a registered pool.
    pub fn handle_for(&self, pool: &ResourcePool) -> SchedulerResult<ExecutorHandle<W>> {
        self.get_handle(pool.backend_kind(), pool.backend_config())
    }

    /// Asks the provider for a fresh sample, bounded by the provider timeout.
    ///
    /// A successful sample is cached. Errors and timeouts count toward
    /// eviction.
    pub async fn sample(
        &self,
        handle: &ExecutorHandle<W>,
        resource: &ResourceId,
        device: &str,
    ) -> HalResult<BackendAvailability> {
        let result = match tokio::time::timeout(
            self.provider_timeout,
            handle.backend.availability(device),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(HalError::Timeout(format!(
                "availability of {resource} exceeded {:?}",
                self.provider_timeout
            ))),
        };

        match &result {
            Ok(sample) => {
                self.samples.insert(resource.clone(), sample.clone());
                self.record_success(&handle.key);
            }
            Err(e) => {
                self.samples.remove(resource);
                warn!(resource = %resource, error = %e, "Availability query failed");
                self.record_failure(&handle.key);
            }
        }
        result
    }

    /// Whether `device` is accepting work, from a fresh cached sample if any.
    pub async fn is_available(&self, handle: &ExecutorHandle<W>, resource: &ResourceId, device: &str) -> bool {
        if let Some(sample) = self.samples.get(resource) {
            return sample.is_available;
        }
        matches!(self.sample(handle, resource, device).await, Ok(s) if s.is_available)
    }

    fn record_success(&self, key: &HandleKey) {
        if let Some(mut entry) = self.handles.get_mut(key) {
            entry.failures = 0;
        }
    }

    fn record_failure(&self, key: &HandleKey) {
        let threshold = self.probe_failure_threshold;
        let evicted = self
            .handles
            .remove_if_mut(key, |_, entry| {
                entry.failures += 1;
                entry.failures >= threshold
            })
            .is_some();
        if evicted {
            info!(handle = %key, threshold, "Evicted executor handle after probe failures");
        }
    }

    /// Number of consecutive probe failures recorded for a live handle.
    pub fn failure_count(&self, key: &HandleKey) -> Option<u32> {
        self.handles.get(key).map(|e| e.failures)
    }

    /// Drops one handle; the next lookup rebuilds it.
    pub fn invalidate(&self, key: &HandleKey) -> bool {
        self.handles.remove(key).is_some()
    }

    /// Drops every handle and every cached sample.
    pub fn clear_cache(&self) {
        let handles = self.handles.len();
        self.handles.clear();
        self.samples.clear();
        info!(handles, "Cleared executor cache");
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    pub fn samples(&self) -> &Arc<ValueCache> {
        &self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capabilities;
    use crate::simulator::SimulatorBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry(threshold: u32) -> ExecutorRegistry<()> {
        let samples = Arc::new(ValueCache::new(Duration::from_secs(30)));
        ExecutorRegistry::new(samples, threshold, Duration::from_secs(10))
    }

    fn sim() -> Arc<SimulatorBackend> {
        Arc::new(SimulatorBackend::new(vec![Capabilities::simulator("aer", 4)]))
    }

    #[test]
    fn test_unknown_kind() {
        let reg = registry(1);
        let err = reg
            .get_handle(&BackendKind::new("quantinuum"), &BackendConfig::new())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownBackendKind(k) if k.as_str() == "quantinuum"));
    }

    #[test]
    fn test_handles_are_shared_per_fingerprint() {
        let reg = registry(1);
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        reg.register_factory(BackendKind::SIMULATOR, move |config: &BackendConfig| {
            counter.fetch_add(1, Ordering::SeqCst);
            SimulatorBackend::config_factory::<()>()(config)
        });

        let mut config = BackendConfig::new();
        config.insert("num_qubits".into(), serde_json::json!(4));
        let a = reg.get_handle(&BackendKind::SIMULATOR, &config).unwrap();
        let b = reg.get_handle(&BackendKind::SIMULATOR, &config).unwrap();
        assert_eq!(a.key(), b.key());
        assert!(Arc::ptr_eq(a.backend(), b.backend()));

        config.insert("num_qubits".into(), serde_json::json!(8));
        let c = reg.get_handle(&BackendKind::SIMULATOR, &config).unwrap();
        assert_ne!(a.key(), c.key());
        assert_eq!(built.load(Ordering::SeqCst), 2);
        assert_eq!(reg.handle_count(), 2);
        assert_eq!(reg.supported_kinds(), vec![BackendKind::SIMULATOR]);
    }

    #[test]
    fn test_factory_error_is_configuration() {
        let reg = registry(1);
        reg.register_factory(BackendKind::SIMULATOR, SimulatorBackend::config_factory::<()>());
        let mut config = BackendConfig::new();
        config.insert("num_qubits".into(), serde_json::json!(-3));
        assert!(matches!(
            reg.get_handle(&BackendKind::SIMULATOR, &config),
            Err(SchedulerError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_provider_errors_evict_handle() {
        let reg = registry(2);
        let backend = sim();
        reg.register_factory(BackendKind::SIMULATOR, backend.shared_factory::<()>());
        let config = BackendConfig::new();
        let handle = reg.get_handle(&BackendKind::SIMULATOR, &config).unwrap();
        let rid = ResourceId::new("p", "aer");

        backend.fail_provider(Some(HalError::BackendUnavailable("link down".into())));
        assert!(!reg.is_available(&handle, &rid, "aer").await);
        assert_eq!(reg.failure_count(handle.key()), Some(1));

        assert!(!reg.is_available(&handle, &rid, "aer").await);
        assert_eq!(reg.failure_count(handle.key()), None);
        assert_eq!(reg.handle_count(), 0);

        backend.fail_provider(None);
        let rebuilt = reg.get_handle(&BackendKind::SIMULATOR, &config).unwrap();
        assert!(reg.sample(&rebuilt, &rid, "aer").await.unwrap().is_available);
        assert_eq!(reg.failure_count(rebuilt.key()), Some(0));
    }

    #[tokio::test]
    async fn test_offline_device_keeps_handle() {
        let reg = registry(1);
        let backend = Arc::new(SimulatorBackend::new(vec![
            Capabilities::simulator("up", 4),
            Capabilities::simulator("down", 4),
        ]));
        backend.set_available("down", false);
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let shared = backend.shared_factory::<()>();
        reg.register_factory(BackendKind::SIMULATOR, move |config: &BackendConfig| {
            counter.fetch_add(1, Ordering::SeqCst);
            shared(config)
        });

        for _ in 0..5 {
            let handle = reg.get_handle(&BackendKind::SIMULATOR, &BackendConfig::new()).unwrap();
            let up = reg.sample(&handle, &ResourceId::new("p", "up"), "up").await.unwrap();
            let down = reg.sample(&handle, &ResourceId::new("p", "down"), "down").await.unwrap();
            assert!(up.is_available);
            assert!(!down.is_available);
            assert_eq!(reg.failure_count(handle.key()), Some(0));
        }
        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert_eq!(reg.handle_count(), 1);
    }

    #[tokio::test]
    async fn test_cached_sample_skips_provider() {
        let reg = registry(1);
        let backend = sim();
        reg.register_factory(BackendKind::SIMULATOR, backend.shared_factory::<()>());
        let handle = reg.get_handle(&BackendKind::SIMULATOR, &BackendConfig::new()).unwrap();
        let rid = ResourceId::new("p", "aer");

        assert!(reg.is_available(&handle, &rid, "aer").await);
        assert!(reg.is_available(&handle, &rid, "aer").await);
        assert_eq!(backend.availability_calls(), 1);

        reg.clear_cache();
        assert_eq!(reg.handle_count(), 0);
        assert_eq!(reg.samples().stats().entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_times_out() {
        let reg = registry(1);
        let backend = sim();
        backend.set_availability_delay(Duration::from_secs(60));
        reg.register_factory(BackendKind::SIMULATOR, backend.shared_factory::<()>());
        let handle = reg.get_handle(&BackendKind::SIMULATOR, &BackendConfig::new()).unwrap();
        let result = reg.sample(&handle, &ResourceId::new("p", "aer"), "aer").await;
        assert!(matches!(result, Err(HalError::Timeout(_))));
    }
}
