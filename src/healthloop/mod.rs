//! HealthLoop (C6): per-model HTTP health probing with consecutive-failure
//! driven restart, owned as a structured task set.

mod task;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::adapter::EngineAdapter;
use crate::models::config::{HealthCheckConfig, RetryPolicy};
use crate::models::{ModelId, ModelRegistry};
use crate::router::RequestRouter;
use crate::scheduler::Scheduler;

struct Handle {
    cancel: Arc<Notify>,
    join: JoinHandle<()>,
}

/// Owns every per-model health-probe task. Starting a model spawns one;
/// stopping it (or system shutdown) cancels and joins it before returning,
/// so no orphaned task ever outlives its model.
pub struct HealthLoopSet {
    tasks: Mutex<HashMap<ModelId, Handle>>,
    registry: Arc<ModelRegistry>,
    scheduler: Arc<Scheduler>,
    router: Arc<RequestRouter>,
    http: reqwest::Client,
}

impl HealthLoopSet {
    pub fn new(registry: Arc<ModelRegistry>, scheduler: Arc<Scheduler>, router: Arc<RequestRouter>) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            registry,
            scheduler,
            router,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client builder with static config never fails"),
        }
    }

    /// Spawns a health-probe task for `model_id`. Does nothing if
    /// `health_check.enabled` is false, or a task is already running for it.
    pub fn start(
        &self,
        model_id: ModelId,
        endpoint_url: String,
        health_check: HealthCheckConfig,
        retry_policy: RetryPolicy,
        adapter: Arc<dyn EngineAdapter>,
    ) {
        if !health_check.enabled {
            return;
        }
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&model_id) {
            return;
        }
        let cancel = Arc::new(Notify::new());
        let params = task::TaskParams {
            model_id: model_id.clone(),
            endpoint_url,
            health_check,
            retry_policy,
            registry: self.registry.clone(),
            scheduler: self.scheduler.clone(),
            router: self.router.clone(),
            adapter,
            http: self.http.clone(),
        };
        let task_cancel = cancel.clone();
        let join = tokio::spawn(task::run(params, task_cancel));
        tasks.insert(model_id, Handle { cancel, join });
    }

    /// Cancels and joins the task for `model_id`, if any. Returns once the
    /// task has observed cancellation and exited - it will not issue another
    /// HTTP call after this returns.
    pub async fn stop(&self, model_id: &ModelId) {
        let handle = self.tasks.lock().remove(model_id);
        if let Some(handle) = handle {
            handle.cancel.notify_one();
            let _ = handle.join.await;
        }
    }

    /// Cancels and joins every running task. Used during system shutdown.
    pub async fn stop_all(&self) {
        let handles: Vec<Handle> = self.tasks.lock().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.cancel.notify_one();
        }
        for handle in handles {
            let _ = handle.join.await;
        }
    }

    pub fn active_count(&self) -> usize {
        self.tasks.lock().len()
    }
}
