// Dispatcher: submission intake, dedup, worker pool, suspension/resumption,
// and recursive cancellation.

pub mod core;
pub mod dedup;
mod lifecycle;

pub use core::ServiceEngine;
pub use dedup::{DedupIndex, DedupOutcome};
