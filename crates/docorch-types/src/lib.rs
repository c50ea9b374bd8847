mod callback;
mod event;
mod session;
mod todo;

pub use callback::{CallbackRecord, CallbackState};
pub use event::EventLogEntry;
pub use session::{
    Note, NoteStatus, Progress, Session, SessionId, SessionKind, ThematicGroup, WorkflowState,
};
pub use todo::{DependencyKind, TodoItem, TodoList, TodoStatus};
