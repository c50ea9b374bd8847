//! Finite state machine driving a documentation session from creation
//! through completion, failure, or cancellation.

mod engine;
mod model;
mod transitions;

pub use engine::{EntryValidator, TimeoutSupervisor, TransitionHooks, WorkflowEngine};
pub use model::{TransitionRecord, WorkflowEvent, WorkflowRecord};
pub use transitions::{allowed_events, apply, TransitionRejection};
