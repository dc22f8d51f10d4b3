pub mod activity;
pub mod error;
pub mod session;
pub mod task;

pub use activity::{ActivityLevel, ActivityRecord, NewActivityRecord};
pub use error::{CoreError, CoreErrorKind};
pub use session::{ProviderHandle, Session, SessionId, SessionSnapshot, SessionState};
pub use task::{TaskId, TaskRecord, TaskState, Target, TargetKind};
