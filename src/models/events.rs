//! Lifecycle change notifications, consumed by C7's target table and the
//! optional hot-reload watcher.

use std::sync::Arc;

use super::runtime::LifecycleState;
use super::ModelId;

/// One lifecycle transition, broadcast after the per-model lock is released.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub model_id: ModelId,
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub endpoint_url: Option<String>,
}

/// A registered listener. Listeners must not block - they run on the caller's
/// task inline with the state transition.
pub type StateChangeListener = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;
