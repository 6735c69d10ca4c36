//! GPU inventory probing (C1).
//!
//! `GpuProbe` is a pure query interface: it enumerates GPUs and returns
//! per-device live telemetry. It never mutates inventory state - allocation
//! bookkeeping lives in [`crate::resource`] and [`crate::models`].

mod probe;
mod types;

pub use probe::{CachedGpuProbe, GpuProbe, MockGpuProbe};
pub use types::{GpuInfo, GpuVendor};
