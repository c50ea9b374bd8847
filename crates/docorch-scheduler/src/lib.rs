//! Per-session priority queues of files awaiting documentation analysis,
//! with dependency gating, retry/backoff, and cycle detection.

mod priority;
mod scheduler;

pub use priority::{compute_priority, looks_like_config_file, looks_like_entry_point, looks_like_test_file, BASE_PRIORITY};
pub use scheduler::{PopOutcome, TodoScheduler, UpdateOutcome};
