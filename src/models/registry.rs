//! `ModelRegistry`: the authoritative `ModelRuntime` table.
//!
//! Registry methods are deliberately low-level state-transition primitives,
//! not an orchestrator. Calling an adapter to launch an engine, or calling
//! the scheduler to place one, is a `CoreServices`-level concern (see
//! `crate::services`) - keeping that choreography out of the registry avoids
//! a circular dependency between C4 and C5 while still honoring "C4
//! exclusively owns ModelRuntime mutations".

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{info, warn};

use crate::error::{CoreError, ValidationError};
use crate::resource::ResourceAllocation;

use super::config::ModelConfig;
use super::events::{LifecycleEvent, StateChangeListener};
use super::runtime::{HealthState, LifecycleState, ModelRuntime};
use super::ModelId;

type Entry = Arc<Mutex<ModelRuntime>>;

pub struct ModelRegistry {
    table: RwLock<HashMap<ModelId, Entry>>,
    listeners: parking_lot::RwLock<Vec<StateChangeListener>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
            listeners: parking_lot::RwLock::new(Vec::new()),
        }
    }

    /// Register a callback invoked (inline, after the per-model lock is
    /// released) on every lifecycle transition.
    pub fn on_state_change(&self, listener: StateChangeListener) {
        self.listeners.write().push(listener);
    }

    fn notify(&self, event: LifecycleEvent) {
        for listener in self.listeners.read().iter() {
            listener(&event);
        }
    }

    async fn entry(&self, id: &ModelId) -> Result<Entry, CoreError> {
        self.table
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ValidationError::NotFound(id.clone()).into())
    }

    /// Insert a new runtime in state STOPPED. Rejects a duplicate id.
    pub async fn register(&self, config: ModelConfig) -> Result<(), CoreError> {
        config.validate_common()?;
        let mut table = self.table.write().await;
        if table.contains_key(&config.id) {
            return Err(ValidationError::DuplicateId(config.id).into());
        }
        table.insert(config.id.clone(), Arc::new(Mutex::new(ModelRuntime::new(config))));
        Ok(())
    }

    /// Hard delete. Only legal when the runtime is STOPPED or ERROR - callers
    /// that find it RUNNING must stop it first.
    pub async fn remove(&self, id: &ModelId) -> Result<(), CoreError> {
        let entry = self.entry(id).await?;
        let runtime = entry.lock().await;
        match runtime.lifecycle_state {
            LifecycleState::Stopped | LifecycleState::Error => {}
            other => {
                return Err(ValidationError::InvalidState {
                    state: format!("{other:?}"),
                }
                .into())
            }
        }
        drop(runtime);
        self.table.write().await.remove(id);
        Ok(())
    }

    /// Replace the config in place without touching lifecycle state. Callers
    /// deciding a restart is required stop the model first.
    pub async fn update_config(&self, id: &ModelId, new_config: ModelConfig) -> Result<(), CoreError> {
        new_config.validate_common()?;
        let entry = self.entry(id).await?;
        let mut runtime = entry.lock().await;
        runtime.config = new_config;
        Ok(())
    }

    pub async fn status(&self, id: &ModelId) -> Result<ModelRuntime, CoreError> {
        let entry = self.entry(id).await?;
        Ok(entry.lock().await.clone())
    }

    pub async fn list(&self) -> Vec<ModelRuntime> {
        let ids: Vec<Entry> = self.table.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(ids.len());
        for entry in ids {
            out.push(entry.lock().await.clone());
        }
        out
    }

    pub async fn exists(&self, id: &ModelId) -> bool {
        self.table.read().await.contains_key(id)
    }

    /// STOPPED|ERROR|PREEMPTED -> STARTING. Returns the config snapshot the
    /// caller should act on.
    pub async fn begin_starting(&self, id: &ModelId) -> Result<ModelConfig, CoreError> {
        let entry = self.entry(id).await?;
        let mut runtime = entry.lock().await;
        self.transition(&mut runtime, LifecycleState::Starting)?;
        Ok(runtime.config.clone())
    }

    /// STARTING -> RUNNING, publishing the allocation and endpoint.
    pub async fn mark_running(
        &self,
        id: &ModelId,
        allocation: ResourceAllocation,
        endpoint_url: String,
    ) -> Result<(), CoreError> {
        let entry = self.entry(id).await?;
        let mut runtime = entry.lock().await;
        self.transition(&mut runtime, LifecycleState::Running)?;
        runtime.allocation = Some(allocation);
        runtime.endpoint_url = Some(endpoint_url.clone());
        runtime.last_scheduled_at = Some(chrono::Utc::now());
        runtime.current_health = HealthState::Unknown;
        runtime.consecutive_health_failures = 0;
        let event = LifecycleEvent {
            model_id: id.clone(),
            from: LifecycleState::Starting,
            to: LifecycleState::Running,
            endpoint_url: Some(endpoint_url),
        };
        drop(runtime);
        self.notify(event);
        Ok(())
    }

    /// STARTING -> ERROR (startup failed or timed out). Releases any
    /// allocation that may have been recorded speculatively.
    pub async fn mark_start_failed(&self, id: &ModelId) -> Result<(), CoreError> {
        self.force_error(id, LifecycleState::Starting).await
    }

    /// RUNNING -> STOPPING. Call sites must cancel the health loop before
    /// invoking this.
    pub async fn begin_stopping(&self, id: &ModelId) -> Result<(), CoreError> {
        let entry = self.entry(id).await?;
        let mut runtime = entry.lock().await;
        if runtime.lifecycle_state == LifecycleState::Stopped {
            return Ok(()); // idempotent: stop() on an already-stopped model is a no-op.
        }
        self.transition(&mut runtime, LifecycleState::Stopping)?;
        Ok(())
    }

    /// STOPPING -> STOPPED, releasing allocation/endpoint back to the
    /// inventory view.
    pub async fn mark_stopped(&self, id: &ModelId) -> Result<(), CoreError> {
        let entry = self.entry(id).await?;
        let mut runtime = entry.lock().await;
        if runtime.lifecycle_state == LifecycleState::Stopped {
            return Ok(());
        }
        let from = runtime.lifecycle_state;
        self.transition(&mut runtime, LifecycleState::Stopped)?;
        runtime.allocation = None;
        runtime.endpoint_url = None;
        let event = LifecycleEvent {
            model_id: id.clone(),
            from,
            to: LifecycleState::Stopped,
            endpoint_url: None,
        };
        drop(runtime);
        self.notify(event);
        Ok(())
    }

    /// RUNNING|STARTING -> PREEMPTED. Increments `preemption_count`
    /// (monotonic, per I4 - never decremented on recovery).
    pub async fn mark_preempted(&self, id: &ModelId) -> Result<(), CoreError> {
        let entry = self.entry(id).await?;
        let mut runtime = entry.lock().await;
        let from = runtime.lifecycle_state;
        self.transition(&mut runtime, LifecycleState::Preempted)?;
        runtime.allocation = None;
        runtime.endpoint_url = None;
        runtime.preemption_count += 1;
        warn!(model_id = %id, from = ?from, "model preempted");
        let event = LifecycleEvent {
            model_id: id.clone(),
            from,
            to: LifecycleState::Preempted,
            endpoint_url: None,
        };
        drop(runtime);
        self.notify(event);
        Ok(())
    }

    /// RUNNING|STARTING -> ERROR (OS-probe failure, exhausted health
    /// retries, or stuck-running detection).
    pub async fn mark_error(&self, id: &ModelId) -> Result<(), CoreError> {
        let entry = self.entry(id).await?;
        let runtime = entry.lock().await;
        self.force_error_locked(id, runtime)
    }

    async fn force_error(&self, id: &ModelId, _expected_from: LifecycleState) -> Result<(), CoreError> {
        let entry = self.entry(id).await?;
        let runtime = entry.lock().await;
        self.force_error_locked(id, runtime)
    }

    /// Takes ownership of the per-model guard so it can be dropped before
    /// `notify`, matching `mark_running`/`mark_stopped`/`mark_preempted` -
    /// a listener that calls back into the registry for this model during
    /// the ERROR transition must not deadlock on its own lock.
    fn force_error_locked(&self, id: &ModelId, mut runtime: MutexGuard<'_, ModelRuntime>) -> Result<(), CoreError> {
        let from = runtime.lifecycle_state;
        self.transition(&mut runtime, LifecycleState::Error)?;
        runtime.allocation = None;
        runtime.endpoint_url = None;
        let event = LifecycleEvent {
            model_id: id.clone(),
            from,
            to: LifecycleState::Error,
            endpoint_url: None,
        };
        drop(runtime);
        self.notify(event);
        Ok(())
    }

    pub async fn set_health(&self, id: &ModelId, health: HealthState, consecutive_failures: u32) -> Result<(), CoreError> {
        let entry = self.entry(id).await?;
        let mut runtime = entry.lock().await;
        runtime.current_health = health;
        runtime.consecutive_health_failures = consecutive_failures;
        Ok(())
    }

    pub async fn touch_scheduled(&self, id: &ModelId) -> Result<(), CoreError> {
        let entry = self.entry(id).await?;
        let mut runtime = entry.lock().await;
        runtime.last_scheduled_at = Some(chrono::Utc::now());
        Ok(())
    }

    fn transition(&self, runtime: &mut ModelRuntime, to: LifecycleState) -> Result<(), CoreError> {
        if !runtime.lifecycle_state.can_transition_to(to) {
            return Err(ValidationError::InvalidState {
                state: format!("{:?} -> {:?}", runtime.lifecycle_state, to),
            }
            .into());
        }
        info!(from = ?runtime.lifecycle_state, to = ?to, "lifecycle transition");
        runtime.lifecycle_state = to;
        Ok(())
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::config::{Framework, ProcessEngineParams};

    fn config(id: &str) -> ModelConfig {
        ModelConfig::new(
            ModelId::new(id),
            "name".into(),
            Framework::Process(ProcessEngineParams::default()),
            "models/7b.gguf".into(),
            5,
            vec![],
        )
    }

    #[tokio::test]
    async fn register_rejects_duplicate_id() {
        let reg = ModelRegistry::new();
        reg.register(config("a")).await.unwrap();
        assert!(reg.register(config("a")).await.is_err());
    }

    #[tokio::test]
    async fn full_happy_path_lifecycle() {
        let reg = ModelRegistry::new();
        reg.register(config("a")).await.unwrap();
        reg.begin_starting(&ModelId::new("a")).await.unwrap();
        reg.mark_running(
            &ModelId::new("a"),
            ResourceAllocation {
                gpu_devices: vec![0],
                memory_allocated_mb: 1000,
                allocated_at: chrono::Utc::now(),
            },
            "http://localhost:8080".into(),
        )
        .await
        .unwrap();
        let status = reg.status(&ModelId::new("a")).await.unwrap();
        assert_eq!(status.lifecycle_state, LifecycleState::Running);
        assert!(status.satisfies_running_invariant());

        reg.begin_stopping(&ModelId::new("a")).await.unwrap();
        reg.mark_stopped(&ModelId::new("a")).await.unwrap();
        let status = reg.status(&ModelId::new("a")).await.unwrap();
        assert_eq!(status.lifecycle_state, LifecycleState::Stopped);
        assert!(status.allocation.is_none());
    }

    #[tokio::test]
    async fn stop_on_stopped_model_is_idempotent() {
        let reg = ModelRegistry::new();
        reg.register(config("a")).await.unwrap();
        reg.begin_stopping(&ModelId::new("a")).await.unwrap();
        let status = reg.status(&ModelId::new("a")).await.unwrap();
        assert_eq!(status.lifecycle_state, LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn preemption_count_is_monotonic() {
        let reg = ModelRegistry::new();
        reg.register(config("a")).await.unwrap();
        reg.begin_starting(&ModelId::new("a")).await.unwrap();
        reg.mark_running(
            &ModelId::new("a"),
            ResourceAllocation {
                gpu_devices: vec![0],
                memory_allocated_mb: 1000,
                allocated_at: chrono::Utc::now(),
            },
            "http://localhost:8080".into(),
        )
        .await
        .unwrap();
        reg.mark_preempted(&ModelId::new("a")).await.unwrap();
        let after_first = reg.status(&ModelId::new("a")).await.unwrap().preemption_count;
        assert_eq!(after_first, 1);

        reg.begin_starting(&ModelId::new("a")).await.unwrap();
        reg.mark_running(
            &ModelId::new("a"),
            ResourceAllocation {
                gpu_devices: vec![0],
                memory_allocated_mb: 1000,
                allocated_at: chrono::Utc::now(),
            },
            "http://localhost:8080".into(),
        )
        .await
        .unwrap();
        reg.mark_preempted(&ModelId::new("a")).await.unwrap();
        let after_second = reg.status(&ModelId::new("a")).await.unwrap().preemption_count;
        assert_eq!(after_second, 2);
    }

    #[tokio::test]
    async fn remove_rejects_running_model() {
        let reg = ModelRegistry::new();
        reg.register(config("a")).await.unwrap();
        reg.begin_starting(&ModelId::new("a")).await.unwrap();
        reg.mark_running(
            &ModelId::new("a"),
            ResourceAllocation {
                gpu_devices: vec![0],
                memory_allocated_mb: 1000,
                allocated_at: chrono::Utc::now(),
            },
            "http://localhost:8080".into(),
        )
        .await
        .unwrap();
        assert!(reg.remove(&ModelId::new("a")).await.is_err());
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let reg = ModelRegistry::new();
        reg.register(config("a")).await.unwrap();
        // STOPPED -> RUNNING directly is not in the transition table.
        let entry = reg.entry(&ModelId::new("a")).await.unwrap();
        let mut runtime = entry.lock().await;
        assert!(reg.transition(&mut runtime, LifecycleState::Running).is_err());
    }

    #[tokio::test]
    async fn listeners_receive_transitions() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let reg = ModelRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        reg.on_state_change(Arc::new(move |_event| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));
        reg.register(config("a")).await.unwrap();
        reg.begin_starting(&ModelId::new("a")).await.unwrap();
        reg.mark_running(
            &ModelId::new("a"),
            ResourceAllocation {
                gpu_devices: vec![0],
                memory_allocated_mb: 1000,
                allocated_at: chrono::Utc::now(),
            },
            "http://localhost:8080".into(),
        )
        .await
        .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
