use std::error::Error;
use std::fmt::{Display, Formatter};

use crate::models::{SessionId, TaskId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CoreErrorKind {
    ProviderInit,
    NoActiveSession,
    UnknownTask,
    InvalidInput,
    SendFailure,
    StorageFailure,
    Internal,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CoreError {
    pub session: Option<SessionId>,
    pub task: Option<TaskId>,
    pub kind: CoreErrorKind,
    pub message: String,
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl Error for CoreError {}
