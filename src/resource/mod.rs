//! Resource estimation and GPU placement planning (C2).
//!
//! Pure and stateless: translates a `ModelConfig` into a `ResourceRequirement`
//! and validates whether a requirement fits a given GPU inventory.

mod calculator;
mod types;

pub use calculator::ResourceCalculator;
pub use types::{ResourceAllocation, ResourceRequirement};
