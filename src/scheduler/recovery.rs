//! `RecoveryRunner`: the single structured-concurrency owner of the
//! background recovery loop.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::models::LifecycleState;

use super::Scheduler;

/// Owns the recovery task's lifetime. Dropping without calling `shutdown`
/// leaves the task running detached - always call `shutdown` during system
/// teardown.
pub struct RecoveryRunner {
    notify: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl RecoveryRunner {
    pub fn spawn(scheduler: Arc<Scheduler>) -> Self {
        let notify = Arc::new(Notify::new());
        let task_notify = notify.clone();
        let handle = tokio::spawn(async move {
            run(scheduler, task_notify).await;
        });
        Self {
            notify,
            handle: Some(handle),
        }
    }

    /// Signals the loop to exit at its next check-point and waits for it to
    /// finish the in-flight iteration.
    pub async fn shutdown(mut self) {
        self.notify.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn run(scheduler: Arc<Scheduler>, notify: Arc<Notify>) {
    loop {
        let interval = scheduler.policy().await.recovery_check_interval_s;
        tokio::select! {
            _ = notify.notified() => {
                info!("recovery loop shutting down");
                return;
            }
            _ = tokio::time::sleep(std::time::Duration::from_secs(interval)) => {}
        }
        if let Err(e) = run_once(&scheduler).await {
            warn!(error = %e, "recovery iteration failed");
        }
    }
}

async fn run_once(scheduler: &Arc<Scheduler>) -> Result<(), crate::error::CoreError> {
    scheduler.detect_stuck_running().await?;

    let mut candidates = scheduler
        .registry()
        .list()
        .await
        .into_iter()
        .filter(|r| matches!(r.lifecycle_state, LifecycleState::Preempted | LifecycleState::Error))
        .collect::<Vec<_>>();
    // Higher-priority models are attempted first.
    candidates.sort_by(|a, b| b.config.priority.cmp(&a.config.priority));

    for runtime in candidates {
        let id = runtime.config.id.clone();
        if !scheduler.recovery_eligible(&id).await {
            continue;
        }
        let now = Utc::now();
        let result = scheduler.schedule(&id).await;
        let (success, error) = match &result {
            Ok(_) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        scheduler
            .record_recovery_attempt(crate::scheduler::decision::RecoveryAttempt {
                model_id: id,
                attempted_at: now,
                reason: "periodic recovery sweep".into(),
                success,
                error,
            })
            .await;
    }
    Ok(())
}
