//! Shared data structures for the GPS refinery pipeline
//!
//! - `ping`: RawPing (ingested, immutable) and FilteredPing (pipeline output)
//! - `batch`: TimeWindow, ProcessingBatch and the batch state machine
//! - `vehicle`: registry-backed discovery records

mod batch;
mod ping;
mod vehicle;

pub use batch::*;
pub use ping::*;
pub use vehicle::*;
