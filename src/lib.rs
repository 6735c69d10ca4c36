//! A control plane for scheduling and routing LLM inference engines across a
//! shared pool of GPUs.
//!
//! Tracks GPU inventory (C1), estimates and plans resource placement (C2),
//! drives process and container engine adapters (C3), owns the model
//! lifecycle state machine (C4), schedules placement with priority-based
//! preemption and a background recovery loop (C5), runs per-model health
//! probing with auto-restart (C6), and load-balances inbound requests across
//! each model's live targets (C7). `services::CoreServices` is the
//! composition root tying all of it together.

pub mod adapter;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod gpu;
pub mod health;
pub mod healthloop;
pub mod models;
pub mod resource;
pub mod router;
pub mod scheduler;
pub mod services;
pub mod shutdown;
pub mod telemetry;

pub use error::{CoreError, CoreResult};
pub use services::CoreServices;

