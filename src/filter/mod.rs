//! Outlier Filter
//!
//! Per-vehicle plausibility check over time-ordered pings. Pure and
//! deterministic: the same pings and seed always yield the same flags, which
//! is what makes re-running a window idempotent.

pub mod geo;
mod plausibility;

pub use plausibility::{FilterOutcome, PlausibilityFilter};

/// Filter input errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("pings for more than one vehicle in a single run: expected {expected}, found {found}")]
    MixedVehicles { expected: String, found: String },
}
