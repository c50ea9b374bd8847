//! Matches outbound "analyze this file" requests to their inbound callback
//! deliveries by request id, with deadline-based reaping and cancellation.

mod registry;

pub use registry::{CallbackRegistry, ReaperTask};
