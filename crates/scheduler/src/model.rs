//! Model lifecycle management
//!
//! Exactly one model may be resident on the accelerator. The
//! [`ModelLifecycleManager`] owns every [`ModelState`] transition and
//! serializes switches: concurrent `ensure_active` calls for the same target
//! share a single in-flight switch, calls for a different target wait for it
//! to finish before starting their own.
//!
//! Generation streams hold a [`ResidencyLease`] (a read guard on the
//! residency lock). A switch takes the write side, so the resident model is
//! never evicted under a running stream.

use crate::backend::{GenerateRequest, InferenceBackend, ResourceMonitor, TokenEvent};
use chrono::{DateTime, Utc};
use llmq_common::{LlmqConfig, LlmqError, Result, METRICS};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, OwnedRwLockReadGuard, RwLock};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

/// Upper bound for the load verification generation
const PROBE_TIMEOUT: Duration = Duration::from_secs(120);

/// Residency status of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Unloaded,
    Loading,
    Active,
    Unloading,
}

impl ModelStatus {
    fn can_transition_to(self, next: ModelStatus) -> bool {
        use ModelStatus::*;
        matches!(
            (self, next),
            (Unloaded, Loading)
                | (Loading, Active)
                | (Loading, Unloaded)
                | (Active, Unloading)
                | (Unloading, Unloaded)
                // failed unload leaves the model where it was
                | (Unloading, Active)
        )
    }
}

/// State of one installed model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelState {
    pub model_id: String,
    pub status: ModelStatus,
    pub resident_since: Option<DateTime<Utc>>,

    /// Estimated accelerator footprint in bytes
    pub footprint_bytes: u64,
}

impl ModelState {
    fn new(model_id: &str, footprint_bytes: u64) -> Self {
        Self {
            model_id: model_id.to_string(),
            status: ModelStatus::Unloaded,
            resident_since: None,
            footprint_bytes,
        }
    }
}

/// Failure of a switch, shared with every coalesced waiter
#[derive(Debug, Clone)]
enum SwitchFailure {
    Capacity {
        model: String,
        required: u64,
        available: u64,
    },
    Switch {
        model: String,
        message: String,
    },
}

impl From<SwitchFailure> for LlmqError {
    fn from(failure: SwitchFailure) -> Self {
        match failure {
            SwitchFailure::Capacity {
                model,
                required,
                available,
            } => LlmqError::Capacity {
                model,
                required,
                available,
            },
            SwitchFailure::Switch { model, message } => LlmqError::Switch { model, message },
        }
    }
}

type SwitchOutcome = std::result::Result<(), SwitchFailure>;

struct InFlightSwitch {
    target: String,
    tx: broadcast::Sender<SwitchOutcome>,
}

#[derive(Default)]
struct LifecycleState {
    models: HashMap<String, ModelState>,
    active: Option<String>,
    in_flight: Option<InFlightSwitch>,
}

impl LifecycleState {
    /// Drop the in-flight marker if it still belongs to the switch behind `tx`
    fn finish_switch(&mut self, tx: &broadcast::Sender<SwitchOutcome>) -> bool {
        if self.in_flight.as_ref().map_or(false, |switch| switch.tx.same_channel(tx)) {
            self.in_flight = None;
            return true;
        }
        false
    }

    /// The only place a model status changes
    fn transition(&mut self, model: &str, next: ModelStatus) -> Result<()> {
        if next == ModelStatus::Active {
            if let Some(active) = self.active.as_deref().filter(|active| *active != model) {
                return Err(LlmqError::internal(format!(
                    "cannot activate {} while {} is active",
                    model, active
                )));
            }
        }

        let state = self
            .models
            .entry(model.to_string())
            .or_insert_with(|| ModelState::new(model, 0));
        if !state.status.can_transition_to(next) {
            return Err(LlmqError::internal(format!(
                "invalid model transition for {}: {:?} -> {:?}",
                model, state.status, next
            )));
        }
        state.status = next;

        match next {
            ModelStatus::Active => {
                if state.resident_since.is_none() {
                    state.resident_since = Some(Utc::now());
                }
                self.active = Some(model.to_string());
                METRICS.models.resident.set(1);
            }
            ModelStatus::Unloaded => {
                state.resident_since = None;
                if self.active.as_deref() == Some(model) {
                    self.active = None;
                    METRICS.models.resident.set(0);
                }
            }
            ModelStatus::Loading | ModelStatus::Unloading => {}
        }

        debug!(model, status = ?next, "Model status changed");
        Ok(())
    }
}

/// Proof that a model is resident, held for the duration of a stream
#[derive(Debug)]
pub struct ResidencyLease {
    model: String,
    _guard: OwnedRwLockReadGuard<()>,
}

impl ResidencyLease {
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Clone)]
struct LifecycleSettings {
    attempts: u32,
    retry_delay: Duration,
    headroom_bytes: u64,
    verify_on_load: bool,
    verify_prompt: String,
}

struct ManagerInner {
    backend: Arc<dyn InferenceBackend>,
    monitor: Arc<dyn ResourceMonitor>,
    settings: LifecycleSettings,
    state: Mutex<LifecycleState>,
    residency: Arc<RwLock<()>>,
}

/// Clears the in-flight marker even if the switch task panics
struct SwitchGuard {
    inner: Arc<ManagerInner>,
    tx: broadcast::Sender<SwitchOutcome>,
}

impl Drop for SwitchGuard {
    fn drop(&mut self) {
        self.inner.state.lock().finish_switch(&self.tx);
    }
}

enum Next {
    Ready,
    Wait {
        rx: broadcast::Receiver<SwitchOutcome>,
        same_target: bool,
    },
}

/// Owner of model residency
#[derive(Clone)]
pub struct ModelLifecycleManager {
    inner: Arc<ManagerInner>,
}

impl ModelLifecycleManager {
    pub fn new(
        config: &LlmqConfig,
        backend: Arc<dyn InferenceBackend>,
        monitor: Arc<dyn ResourceMonitor>,
    ) -> Self {
        let settings = LifecycleSettings {
            attempts: config.models.switch_attempts.max(1),
            retry_delay: config.switch_retry_delay(),
            headroom_bytes: config.memory_headroom_bytes(),
            verify_on_load: config.models.verify_on_load,
            verify_prompt: config.models.verify_prompt.clone(),
        };

        Self {
            inner: Arc::new(ManagerInner {
                backend,
                monitor,
                settings,
                state: Mutex::new(LifecycleState::default()),
                residency: Arc::new(RwLock::new(())),
            }),
        }
    }

    /// Make `model` the resident model
    ///
    /// Returns immediately when the model is already active. Otherwise the
    /// call either starts a switch or joins the one in flight. A model that
    /// does not fit fails with [`LlmqError::Capacity`] without any retry;
    /// a switch that keeps failing ends with [`LlmqError::Switch`].
    pub async fn ensure_active(&self, model: &str) -> Result<ResidencyLease> {
        loop {
            let next = {
                let mut state = self.inner.state.lock();
                if let Some(switch) = &state.in_flight {
                    let same_target = switch.target == model;
                    if same_target {
                        METRICS.models.coalesced_total.inc();
                        debug!(model, "Joining in-flight model switch");
                    }
                    Next::Wait {
                        rx: switch.tx.subscribe(),
                        same_target,
                    }
                } else if state.active.as_deref() == Some(model) {
                    Next::Ready
                } else {
                    let (tx, rx) = broadcast::channel(1);
                    state.in_flight = Some(InFlightSwitch {
                        target: model.to_string(),
                        tx: tx.clone(),
                    });
                    self.spawn_switch(model.to_string(), tx);
                    Next::Wait {
                        rx,
                        same_target: true,
                    }
                }
            };

            match next {
                Next::Ready => {
                    let guard = Arc::clone(&self.inner.residency).read_owned().await;
                    // a switch may have evicted the model while we queued for the guard
                    if self.inner.state.lock().active.as_deref() == Some(model) {
                        return Ok(ResidencyLease {
                            model: model.to_string(),
                            _guard: guard,
                        });
                    }
                }
                Next::Wait {
                    mut rx,
                    same_target,
                } => {
                    let outcome = rx.recv().await;
                    if !same_target {
                        continue;
                    }
                    match outcome {
                        Ok(Ok(())) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Ok(Err(failure)) => return Err(failure.into()),
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(LlmqError::switch(model, "model switch aborted"));
                        }
                    }
                }
            }
        }
    }

    fn spawn_switch(&self, target: String, tx: broadcast::Sender<SwitchOutcome>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let _guard = SwitchGuard {
                inner: Arc::clone(&inner),
                tx: tx.clone(),
            };
            let outcome = inner.perform_switch(&target).await;

            // clear before sending so late callers see the new state
            let mut state = inner.state.lock();
            state.finish_switch(&tx);
            let _ = tx.send(outcome);
        });
    }

    /// Refresh the installed model table from the backend
    pub async fn refresh_installed(&self) -> Result<usize> {
        self.inner.refresh_installed().await
    }

    pub fn active_model(&self) -> Option<String> {
        self.inner.state.lock().active.clone()
    }

    pub fn is_active(&self, model: &str) -> bool {
        self.inner.state.lock().active.as_deref() == Some(model)
    }

    /// Whether a switch is currently running
    pub fn is_switching(&self) -> bool {
        self.inner.state.lock().in_flight.is_some()
    }

    /// Number of models in `active` status
    pub fn active_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .models
            .values()
            .filter(|m| m.status == ModelStatus::Active)
            .count()
    }

    /// Known models ordered by id
    pub fn models(&self) -> Vec<ModelState> {
        let mut models: Vec<ModelState> = self.inner.state.lock().models.values().cloned().collect();
        models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        models
    }
}

impl ManagerInner {
    async fn refresh_installed(&self) -> Result<usize> {
        let installed = self.backend.list_models().await?;
        let mut state = self.state.lock();
        for info in &installed {
            state
                .models
                .entry(info.id.clone())
                .and_modify(|m| m.footprint_bytes = info.size_bytes)
                .or_insert_with(|| ModelState::new(&info.id, info.size_bytes));
        }
        Ok(installed.len())
    }

    async fn footprint(&self, model: &str) -> Result<u64> {
        let known = self
            .state
            .lock()
            .models
            .get(model)
            .map(|m| m.footprint_bytes)
            .filter(|bytes| *bytes > 0);
        if let Some(footprint) = known {
            return Ok(footprint);
        }

        self.refresh_installed().await?;
        self.state
            .lock()
            .models
            .get(model)
            .map(|m| m.footprint_bytes)
            .ok_or_else(|| LlmqError::switch(model, "model is not installed on the backend"))
    }

    async fn perform_switch(&self, target: &str) -> SwitchOutcome {
        let started = Instant::now();
        let switch_failure = |message: String| SwitchFailure::Switch {
            model: target.to_string(),
            message,
        };

        let footprint = self.footprint(target).await.map_err(|e| match e {
            LlmqError::Switch { model, message } => SwitchFailure::Switch { model, message },
            other => switch_failure(other.to_string()),
        })?;

        let free = self
            .monitor
            .available_memory()
            .await
            .map_err(|e| switch_failure(format!("resource monitor unavailable: {}", e)))?;
        let reclaimable = {
            let state = self.state.lock();
            state
                .active
                .as_ref()
                .and_then(|active| state.models.get(active))
                .map_or(0, |m| m.footprint_bytes)
        };
        let available = free.saturating_add(reclaimable);
        let required = footprint.saturating_add(self.settings.headroom_bytes);
        if required > available {
            METRICS.models.capacity_rejections_total.inc();
            warn!(model = target, required, available, "Model does not fit in accelerator memory");
            return Err(SwitchFailure::Capacity {
                model: target.to_string(),
                required,
                available,
            });
        }

        // waits for streams on the current model to drain
        let _exclusive = self.residency.write().await;

        let previous = self.state.lock().active.clone();
        if previous.as_deref() == Some(target) {
            return Ok(());
        }

        if let Some(previous) = previous {
            self.set_status(&previous, ModelStatus::Unloading)
                .map_err(|e| switch_failure(e.to_string()))?;
            info!(from = %previous, to = target, "Unloading resident model");

            if let Err(e) = self
                .retrying("unload", &previous, || self.backend.unload_model(&previous))
                .await
            {
                error!(model = %previous, "Failed to unload resident model: {}", e);
                let _ = self.set_status(&previous, ModelStatus::Active);
                METRICS.models.switch_failures_total.inc();
                return Err(switch_failure(format!("failed to unload {}: {}", previous, e)));
            }
            self.set_status(&previous, ModelStatus::Unloaded)
                .map_err(|e| switch_failure(e.to_string()))?;
        }

        self.set_status(target, ModelStatus::Loading)
            .map_err(|e| switch_failure(e.to_string()))?;
        info!(model = target, footprint, "Loading model");

        match self
            .retrying("load", target, || self.load_and_verify(target))
            .await
        {
            Ok(()) => {
                self.set_status(target, ModelStatus::Active)
                    .map_err(|e| switch_failure(e.to_string()))?;
                let elapsed = started.elapsed();
                METRICS.models.switches_total.inc();
                METRICS.models.switch_duration.observe(elapsed.as_secs_f64());
                info!(model = target, elapsed_ms = elapsed.as_millis() as u64, "Model active");
                Ok(())
            }
            Err(e) => {
                METRICS.models.switch_failures_total.inc();
                error!(model = target, "Model switch failed: {}", e);
                let _ = self.set_status(target, ModelStatus::Unloaded);
                // a half-loaded model must not linger
                if let Err(unload) = self.backend.unload_model(target).await {
                    debug!(model = target, "Cleanup unload failed: {}", unload);
                }
                Err(switch_failure(format!(
                    "giving up after {} attempts: {}",
                    self.settings.attempts, e
                )))
            }
        }
    }

    /// Load a model and confirm it with a one-token generation
    async fn load_and_verify(&self, model: &str) -> Result<()> {
        self.backend.load_model(model).await?;
        if !self.settings.verify_on_load {
            return Ok(());
        }

        let probe = async {
            let mut stream = self
                .backend
                .generate(GenerateRequest::probe(model, self.settings.verify_prompt.as_str()))
                .await?;
            while let Some(event) = stream.next().await {
                if let TokenEvent::Done(_) = event? {
                    break;
                }
            }
            Ok::<_, LlmqError>(())
        };

        tokio::time::timeout(PROBE_TIMEOUT, probe)
            .await
            .map_err(|_| LlmqError::backend(format!("verification of {} timed out", model)))?
    }

    async fn retrying<F, Fut>(&self, what: &str, model: &str, mut op: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.settings.attempts => {
                    warn!(model, attempt, "Model {} failed, retrying: {}", what, e);
                    attempt += 1;
                    tokio::time::sleep(self.settings.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn set_status(&self, model: &str, next: ModelStatus) -> Result<()> {
        self.state.lock().transition(model, next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ScriptedBackend, StaticResourceMonitor};
    use proptest::prelude::*;

    const MB: u64 = 1024 * 1024;

    fn config() -> LlmqConfig {
        let mut config = LlmqConfig::default();
        config.models.memory_headroom_mb = 0;
        config
    }

    fn manager(backend: &Arc<ScriptedBackend>) -> ModelLifecycleManager {
        ModelLifecycleManager::new(&config(), backend.clone(), backend.clone())
    }

    fn backend() -> Arc<ScriptedBackend> {
        Arc::new(
            ScriptedBackend::new(1000 * MB)
                .with_model("a", 600 * MB)
                .with_model("b", 700 * MB)
                .with_model("huge", 4000 * MB),
        )
    }

    #[tokio::test]
    async fn test_ensure_active_loads_once() {
        let backend = backend();
        let models = manager(&backend);

        let lease = models.ensure_active("a").await.unwrap();
        assert_eq!(lease.model(), "a");
        drop(lease);
        models.ensure_active("a").await.unwrap();

        assert_eq!(backend.load_calls(), vec!["a"]);
        let state = models.models().into_iter().find(|m| m.model_id == "a").unwrap();
        assert_eq!(state.status, ModelStatus::Active);
        assert!(state.resident_since.is_some());
        assert_eq!(state.footprint_bytes, 600 * MB);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_switch() {
        let backend = backend();
        backend.set_load_delay(Duration::from_secs(5));
        let models = manager(&backend);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let models = models.clone();
                tokio::spawn(async move { models.ensure_active("a").await.map(|_| ()) })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(backend.load_calls(), vec!["a"]);
        assert!(models.is_active("a"));
    }

    #[tokio::test]
    async fn test_switch_unloads_previous_model() {
        let backend = backend();
        let models = manager(&backend);

        drop(models.ensure_active("a").await.unwrap());
        drop(models.ensure_active("b").await.unwrap());

        assert_eq!(backend.unload_calls(), vec!["a"]);
        assert_eq!(backend.loaded_models(), vec!["b"]);
        assert_eq!(backend.max_loaded(), 1);
        assert_eq!(models.active_model().as_deref(), Some("b"));
        assert_eq!(models.active_count(), 1);
    }

    #[tokio::test]
    async fn test_capacity_error_is_not_retried() {
        let backend = backend();
        let models = manager(&backend);

        let err = models.ensure_active("huge").await.unwrap_err();

        assert!(matches!(err, LlmqError::Capacity { .. }));
        assert!(backend.load_calls().is_empty());
        assert!(models.active_model().is_none());
    }

    #[tokio::test]
    async fn test_headroom_counts_against_capacity() {
        let backend = backend();
        let mut config = config();
        config.models.memory_headroom_mb = 500;
        let models = ModelLifecycleManager::new(&config, backend.clone(), backend.clone());

        assert!(matches!(
            models.ensure_active("b").await,
            Err(LlmqError::Capacity { .. })
        ));
    }

    #[tokio::test]
    async fn test_capacity_check_against_static_monitor() {
        let backend = backend();
        let models = ModelLifecycleManager::new(
            &config(),
            backend.clone(),
            Arc::new(StaticResourceMonitor::new(100 * MB)),
        );

        assert!(matches!(
            models.ensure_active("a").await,
            Err(LlmqError::Capacity { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_load_failures_are_retried() {
        let backend = backend();
        backend.fail_loads("a", 2);
        let models = manager(&backend);

        models.ensure_active("a").await.unwrap();

        assert_eq!(backend.load_calls().len(), 3);
        assert!(models.is_active("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_error_after_bounded_retries() {
        let backend = backend();
        backend.fail_loads("a", 10);
        let models = manager(&backend);

        let err = models.ensure_active("a").await.unwrap_err();

        assert!(matches!(err, LlmqError::Switch { .. }));
        assert_eq!(backend.load_calls().len(), 3);
        assert!(models.active_model().is_none());
        assert!(!models.is_switching());
    }

    #[tokio::test]
    async fn test_unknown_model_fails_switch() {
        let backend = backend();
        let models = manager(&backend);

        let err = models.ensure_active("missing").await.unwrap_err();
        assert!(matches!(err, LlmqError::Switch { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_waits_for_running_streams() {
        let backend = backend();
        let models = manager(&backend);
        let lease = models.ensure_active("a").await.unwrap();

        let switching = {
            let models = models.clone();
            tokio::spawn(async move { models.ensure_active("b").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(models.is_active("a"));
        assert!(backend.unload_calls().is_empty());

        drop(lease);
        switching.await.unwrap().unwrap();
        assert!(models.is_active("b"));
    }

    #[test]
    fn test_finished_switch_keeps_newer_marker() {
        let (old_tx, _) = broadcast::channel(1);
        let (new_tx, _) = broadcast::channel(1);
        let mut state = LifecycleState::default();
        state.in_flight = Some(InFlightSwitch {
            target: "b".to_string(),
            tx: new_tx.clone(),
        });

        assert!(!state.finish_switch(&old_tx));
        assert_eq!(state.in_flight.as_ref().map(|s| s.target.as_str()), Some("b"));

        assert!(state.finish_switch(&new_tx));
        assert!(state.in_flight.is_none());
    }

    #[test]
    fn test_model_transition_table() {
        let mut state = LifecycleState::default();
        assert!(state.transition("a", ModelStatus::Active).is_err());
        state.transition("a", ModelStatus::Loading).unwrap();
        state.transition("a", ModelStatus::Active).unwrap();

        state.transition("b", ModelStatus::Loading).unwrap();
        assert!(state.transition("b", ModelStatus::Active).is_err());
        assert_eq!(state.active.as_deref(), Some("a"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_at_most_one_model_active(requests in prop::collection::vec(0usize..3, 1..12)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .start_paused(true)
                .build()
                .unwrap();

            runtime.block_on(async {
                let backend = Arc::new(
                    ScriptedBackend::new(1000 * MB)
                        .with_model("m0", 400 * MB)
                        .with_model("m1", 500 * MB)
                        .with_model("m2", 600 * MB),
                );
                backend.set_load_delay(Duration::from_millis(50));
                let models = manager(&backend);

                let watcher = {
                    let models = models.clone();
                    tokio::spawn(async move {
                        let mut max_active = 0;
                        for _ in 0..200 {
                            max_active = max_active.max(models.active_count());
                            tokio::time::sleep(Duration::from_millis(5)).await;
                        }
                        max_active
                    })
                };

                let callers: Vec<_> = requests
                    .iter()
                    .map(|index| {
                        let models = models.clone();
                        let model = format!("m{}", index);
                        tokio::spawn(async move {
                            let lease = models.ensure_active(&model).await?;
                            assert_eq!(lease.model(), model);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Ok::<_, LlmqError>(())
                        })
                    })
                    .collect();
                for caller in callers {
                    caller.await.unwrap().unwrap();
                }

                assert!(watcher.await.unwrap() <= 1);
                assert!(models.active_count() <= 1);
                assert_eq!(backend.max_loaded(), 1);
            });
        }
    }
}
