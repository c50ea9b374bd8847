//! The Recovery Supervisor: replays every non-terminal session found in the
//! Session Store at process start-up, so a crash or restart loses no session
//! permanently. Runs once, synchronously, before the Tool Dispatcher begins
//! accepting requests.

mod supervisor;

pub use supervisor::{RecoveryOutcome, RecoveryReport, RecoverySupervisor};
