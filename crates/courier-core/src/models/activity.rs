use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::models::{SessionId, TaskId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    Info,
    Warn,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: u64,
    pub session: Option<SessionId>,
    pub task: Option<TaskId>,
    pub level: ActivityLevel,
    pub message: String,
    pub created_at: SystemTime,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewActivityRecord {
    pub session: Option<SessionId>,
    pub task: Option<TaskId>,
    pub level: ActivityLevel,
    pub message: String,
    pub created_at: SystemTime,
}

impl NewActivityRecord {
    pub fn now(
        level: ActivityLevel,
        session: Option<SessionId>,
        task: Option<TaskId>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            session,
            task,
            level,
            message: message.into(),
            created_at: SystemTime::now(),
        }
    }
}
