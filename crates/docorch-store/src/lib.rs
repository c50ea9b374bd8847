//! The Session Store: a bounded LRU cache of deep-copied sessions in front
//! of a durable, optimistically-versioned repository, plus the append-only
//! event log the Recovery Supervisor replays from.

mod file_repository;
mod repository;
mod session_store;

pub use file_repository::{FileEventLogRepository, FileSessionRepository};
pub use repository::{EventLogRepository, SessionFilter, SessionRepository};
pub use session_store::{CleanupSweeper, SessionStore, SessionStoreConfig};
