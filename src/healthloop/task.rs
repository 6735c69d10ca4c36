//! The per-model health-probe task body.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{info, warn};

use crate::adapter::EngineAdapter;
use crate::models::config::{HealthCheckConfig, RetryPolicy};
use crate::models::{HealthState, LifecycleState, ModelId, ModelRegistry};
use crate::router::RequestRouter;
use crate::scheduler::Scheduler;

pub(super) struct TaskParams {
    pub model_id: ModelId,
    pub endpoint_url: String,
    pub health_check: HealthCheckConfig,
    pub retry_policy: RetryPolicy,
    pub registry: Arc<ModelRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub router: Arc<RequestRouter>,
    pub adapter: Arc<dyn EngineAdapter>,
    pub http: reqwest::Client,
}

pub(super) async fn run(params: TaskParams, cancel: Arc<Notify>) {
    let TaskParams {
        model_id,
        endpoint_url,
        health_check,
        retry_policy,
        registry,
        scheduler,
        router,
        adapter,
        http,
    } = params;

    let mut consecutive_failures: u32 = 0;
    let health_url = format!("{endpoint_url}{}", health_check.endpoint_path());

    loop {
        tokio::select! {
            _ = cancel.notified() => {
                info!(model_id = %model_id, "health loop cancelled");
                return;
            }
            _ = tokio::time::sleep(Duration::from_secs(health_check.interval_s)) => {}
        }

        let healthy = probe_once(&http, &health_url, health_check.timeout_s).await;

        if healthy {
            consecutive_failures = 0;
            let _ = registry.set_health(&model_id, HealthState::Healthy, 0).await;
            continue;
        }

        consecutive_failures += 1;
        let _ = registry
            .set_health(&model_id, HealthState::Unknown, consecutive_failures)
            .await;

        if consecutive_failures < health_check.max_consecutive_failures {
            continue;
        }

        warn!(model_id = %model_id, failures = consecutive_failures, "model unhealthy, triggering recovery");
        let _ = registry.set_health(&model_id, HealthState::Unhealthy, consecutive_failures).await;
        router.set_unhealthy(&model_id);

        if retry_policy.enabled {
            restart_with_backoff(&registry, &scheduler, &adapter, &model_id, &retry_policy).await;
        }
        consecutive_failures = 0; // reset after corrective action, whether or not it succeeded
    }
}

async fn probe_once(http: &reqwest::Client, health_url: &str, timeout_s: u64) -> bool {
    match tokio::time::timeout(Duration::from_secs(timeout_s), http.get(health_url).send()).await {
        Ok(Ok(resp)) => resp.status().is_success(),
        _ => false,
    }
}

/// Stop-then-reschedule, with exponential backoff between attempts.
/// Idempotent: if some other path already moved the model out of RUNNING
/// (e.g. the recovery loop beat us to it), this becomes a no-op.
async fn restart_with_backoff(
    registry: &Arc<ModelRegistry>,
    scheduler: &Arc<Scheduler>,
    adapter: &Arc<dyn EngineAdapter>,
    model_id: &ModelId,
    retry_policy: &RetryPolicy,
) {
    for attempt in 0..retry_policy.max_attempts {
        tokio::time::sleep(retry_policy.delay_for_attempt(attempt)).await;

        let Ok(status) = registry.status(model_id).await else {
            return; // model was unregistered out from under us
        };
        if status.lifecycle_state != LifecycleState::Running {
            return; // someone else already handled it
        }

        if registry.begin_stopping(model_id).await.is_err() {
            return;
        }
        if let Err(e) = adapter.stop(model_id).await {
            warn!(model_id = %model_id, error = %e, "adapter stop failed during health-triggered restart");
        }
        if registry.mark_stopped(model_id).await.is_err() {
            return;
        }

        match scheduler.schedule(model_id).await {
            Ok(_) => {
                info!(model_id = %model_id, attempt, "health-triggered restart succeeded");
                return;
            }
            Err(e) => {
                warn!(model_id = %model_id, attempt, error = %e, "health-triggered restart attempt failed");
            }
        }
    }
}
