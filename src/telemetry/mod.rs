//! Structured logging and in-process metrics storage for the control plane.

mod logging;
mod store;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use store::{HistogramSummary, MetricsSnapshot, MetricsStore};
