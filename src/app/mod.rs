pub mod cursor;
pub mod loader;
pub mod session;

pub use cursor::{create_completion, CompletionCursor, ExecStream, StreamChunk};
pub use loader::{FileModelSource, ModelKey, ModelLoader, ModelSource, ReadyFn};
pub use session::{
    drive_prediction, CursorManager, CursorRetention, Session, SessionCommand, SessionEvent, SessionState,
};
