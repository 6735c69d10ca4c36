//! `CoreServices`: the composition root wiring C1-C7 together and exposing
//! the model-lifecycle facade operations (register/start/stop/update/
//! unregister) at the C4 level. `ModelRegistry` itself stays a pure
//! state-transition table (see `crate::models::registry` doc comment); the
//! facade choreography - call the scheduler, call an adapter, persist
//! config, spawn a health loop - lives here, the one place allowed to hold
//! references to every other component.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{info, warn};

use crate::adapter::{ContainerEngine, EngineAdapter, ProcessEngine};
use crate::collaborators::{ConfigStore, MetricsSink};
use crate::config::EnvConfig;
use crate::error::{CoreError, CoreResult, ValidationError};
use crate::gpu::{CachedGpuProbe, GpuProbe};
use crate::healthloop::HealthLoopSet;
use crate::models::config::Framework;
use crate::models::{ModelConfig, ModelId, ModelRegistry, ModelRuntime};
use crate::router::{LoadBalancePolicy, RequestRouter};
use crate::scheduler::{RecoveryRunner, Scheduler};

/// Pause between `stop_model` and `start_model` in `restart_model`, so the
/// engine's old process/container has a moment to fully release its GPU
/// memory before the new one claims it.
const RESTART_COOLDOWN_S: u64 = 2;

/// Per-model budget for `stop_model` during shutdown, so one wedged engine
/// can't hold the whole process open indefinitely.
const SHUTDOWN_STOP_TIMEOUT_S: u64 = 15;

pub struct CoreServices {
    pub registry: Arc<ModelRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub health_loops: Arc<HealthLoopSet>,
    pub router: Arc<RequestRouter>,
    process_adapter: Arc<dyn EngineAdapter>,
    container_adapter: Arc<dyn EngineAdapter>,
    config_store: Arc<dyn ConfigStore>,
    metrics: Arc<dyn MetricsSink>,
    state_file: PathBuf,
}

impl CoreServices {
    /// Wires every component together on top of whatever `GpuProbe` the
    /// caller supplies (production: a real probe; tests: `MockGpuProbe`),
    /// wrapped in the shared TTL cache.
    pub fn new<P: GpuProbe + 'static>(
        env: &EnvConfig,
        gpu_probe: P,
        config_store: Arc<dyn ConfigStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        let cached_probe: Arc<dyn GpuProbe> = Arc::new(CachedGpuProbe::with_ttl(gpu_probe, env.gpu_probe_ttl));
        let registry = Arc::new(ModelRegistry::new());
        let process_adapter: Arc<dyn EngineAdapter> = Arc::new(ProcessEngine::new());
        let container_adapter: Arc<dyn EngineAdapter> = Arc::new(ContainerEngine::new());

        let scheduler = Arc::new(Scheduler::new(
            registry.clone(),
            cached_probe,
            process_adapter.clone(),
            container_adapter.clone(),
            env.policy.clone(),
        ));
        let router = RequestRouter::new(LoadBalancePolicy::default());
        router.attach(&registry);
        let health_loops = Arc::new(HealthLoopSet::new(registry.clone(), scheduler.clone(), router.clone()));

        {
            let metrics = metrics.clone();
            registry.on_state_change(Arc::new(move |event| metrics.record_lifecycle_event(event)));
        }

        Arc::new(Self {
            registry,
            scheduler,
            health_loops,
            router,
            process_adapter,
            container_adapter,
            config_store,
            metrics,
            state_file: env.state_file.clone(),
        })
    }

    /// Spawns the background recovery sweep. The returned `RecoveryRunner`
    /// owns the task's lifetime; the caller must hold onto it and call
    /// `shutdown` during teardown (see `main.rs`).
    pub fn start_recovery(self: &Arc<Self>) -> RecoveryRunner {
        RecoveryRunner::spawn(self.scheduler.clone())
    }

    /// Loads persisted configs from the config store and registers each one
    /// (STOPPED), without scheduling them. Called once at boot.
    pub async fn restore_from_store(&self) -> CoreResult<usize> {
        let configs = self.config_store.load_all().await?;
        let mut restored = 0;
        for config in configs {
            self.registry.register(config).await?;
            restored += 1;
        }
        info!(count = restored, "restored model configs from store");
        if let Err(e) = self.scheduler.restore_state(&self.state_file).await {
            warn!(error = %e, "no scheduler state restored, starting from defaults");
        }
        Ok(restored)
    }

    /// Registers a new model (STOPPED) and persists its config.
    pub async fn register_model(&self, config: ModelConfig) -> CoreResult<()> {
        let adapter = self.adapter_for(&config.framework);
        adapter.validate(&config).await.map_err(CoreError::from)?;
        self.config_store.save(&config).await?;
        self.registry.register(config).await
    }

    /// Places a registered model onto a GPU and starts its engine, spawning
    /// the health loop once it's RUNNING.
    pub async fn start_model(&self, model_id: &ModelId) -> CoreResult<()> {
        let outcome = self.scheduler.schedule(model_id).await?;
        let history = self.scheduler.get_schedule_history(1, Some(model_id)).await;
        let decision = history
            .first()
            .ok_or_else(|| CoreError::Internal("schedule() recorded no decision".into()))?;
        self.metrics.record_schedule_decision(decision);
        if matches!(outcome, crate::scheduler::ScheduleOutcome::Success) {
            self.spawn_health_loop(model_id).await?;
        }
        Ok(())
    }

    /// Stops a running model's engine and tears down its health loop.
    pub async fn stop_model(&self, model_id: &ModelId) -> CoreResult<()> {
        self.health_loops.stop(model_id).await;
        let runtime = self.registry.status(model_id).await?;
        let adapter = self.adapter_for(&runtime.config.framework);
        self.registry.begin_stopping(model_id).await?;
        adapter.stop(model_id).await?;
        self.registry.mark_stopped(model_id).await
    }

    /// Stop then start, with a brief cool-down in between. Usable as a
    /// general operation, independent of the health loop's own internal
    /// restart-with-backoff path.
    pub async fn restart_model(&self, model_id: &ModelId) -> CoreResult<()> {
        self.stop_model(model_id).await?;
        tokio::time::sleep(std::time::Duration::from_secs(RESTART_COOLDOWN_S)).await;
        self.start_model(model_id).await
    }

    /// Updates a model's config. In-place if no restart-requiring field
    /// changed; otherwise stops (if running) and leaves it STOPPED for the
    /// caller to `start_model` again.
    pub async fn update_model(&self, model_id: &ModelId, new_config: ModelConfig) -> CoreResult<()> {
        let current = self.registry.status(model_id).await?;
        let delta = current.config.diff_for_restart(&new_config);
        self.config_store.save(&new_config).await?;
        if delta.requires_restart() && current.lifecycle_state == crate::models::LifecycleState::Running {
            self.stop_model(model_id).await?;
        }
        self.registry.update_config(model_id, new_config).await
    }

    /// Unregisters a model. Only legal once it's STOPPED or in ERROR.
    pub async fn unregister_model(&self, model_id: &ModelId) -> CoreResult<()> {
        self.registry.remove(model_id).await?;
        self.config_store.delete(model_id).await
    }

    pub async fn list_models(&self) -> Vec<ModelRuntime> {
        self.registry.list().await
    }

    fn adapter_for(&self, framework: &Framework) -> &Arc<dyn EngineAdapter> {
        match framework {
            Framework::Process(_) => &self.process_adapter,
            Framework::Container(_) => &self.container_adapter,
        }
    }

    async fn spawn_health_loop(&self, model_id: &ModelId) -> CoreResult<()> {
        let runtime = self.registry.status(model_id).await?;
        let endpoint_url = runtime
            .endpoint_url
            .clone()
            .ok_or_else(|| ValidationError::InvalidState { state: "RUNNING without endpoint".into() })?;
        let adapter = self.adapter_for(&runtime.config.framework).clone();
        self.health_loops.start(
            model_id.clone(),
            endpoint_url,
            runtime.config.health_check.clone(),
            runtime.config.retry_policy.clone(),
            adapter,
        );
        Ok(())
    }

    /// Graceful teardown: cancels every health loop, concurrently stops every
    /// RUNNING model (each bounded by a per-model timeout so one wedged
    /// engine can't hold up the rest), then persists scheduler state. The
    /// recovery loop is owned outside `CoreServices` and shut down by the
    /// caller (see `main.rs`).
    pub async fn shutdown(&self) {
        self.health_loops.stop_all().await;

        let running: Vec<ModelId> = self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|r| r.lifecycle_state == crate::models::LifecycleState::Running)
            .map(|r| r.config.id)
            .collect();
        let stops = running.into_iter().map(|model_id| async move {
            match tokio::time::timeout(Duration::from_secs(SHUTDOWN_STOP_TIMEOUT_S), self.stop_model(&model_id)).await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(%model_id, error = %e, "failed to stop model during shutdown"),
                Err(_) => warn!(%model_id, "timed out stopping model during shutdown"),
            }
        });
        join_all(stops).await;

        if let Err(e) = self.scheduler.save_state(&self.state_file).await {
            warn!(error = %e, "failed to persist scheduler state during shutdown");
        }
    }
}
