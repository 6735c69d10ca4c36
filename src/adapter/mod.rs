//! EngineAdapter (C3): starts, stops, and probes one engine instance per
//! managed model, polymorphic over process and container transports.

mod container;
mod process;

pub use container::ContainerEngine;
pub use process::ProcessEngine;

use async_trait::async_trait;

use crate::error::{AdapterError, ValidationError};
use crate::models::{ModelConfig, ModelId};

/// Startup timeout for a process engine's `/health` endpoint to return 200.
pub const PROCESS_READY_TIMEOUT_S: u64 = 30;
/// Startup timeout for a container engine, which additionally accounts for
/// an image pull.
pub const CONTAINER_READY_TIMEOUT_S: u64 = 120;
/// Grace period after a graceful-stop signal before escalating to a kill.
pub const STOP_GRACE_PERIOD_S: u64 = 10;

/// Drives one engine instance. Implementations must be safe to share behind
/// `Arc<dyn EngineAdapter>` across the scheduler, lifecycle registry, and
/// health loop.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    /// Framework-specific checks on top of `ModelConfig::validate_common`.
    async fn validate(&self, config: &ModelConfig) -> Result<(), ValidationError>;

    /// Launches the engine and blocks until its `/health` endpoint returns
    /// 200 or the variant-specific ready timeout elapses. On failure, the
    /// adapter has already cleaned up (killed the process / removed the
    /// container) before returning the error.
    async fn start(&self, config: &ModelConfig) -> Result<String, AdapterError>;

    /// Graceful termination first, escalating to a forceful kill if the
    /// engine is still alive after the grace period. Idempotent.
    async fn stop(&self, model_id: &ModelId) -> Result<(), AdapterError>;

    /// OS/container-level liveness only - cheap, does not touch the
    /// engine's HTTP surface.
    async fn probe(&self, model_id: &ModelId) -> bool;

    /// The engine's inference endpoint, if currently running.
    async fn endpoint(&self, model_id: &ModelId) -> Option<String>;
}
