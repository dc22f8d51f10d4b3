use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::models::SessionId;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Direct,
    Group,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub kind: TargetKind,
    pub address: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Running,
    StopRequested,
    Completed,
}

/// One bulk dispatch job. The record doubles as its own persisted snapshot:
/// `sent_count` is the resume cursor after a restart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub session: SessionId,
    pub target: Target,
    pub messages: Vec<String>,
    pub prefix: Option<String>,
    pub delay: Duration,
    pub sent_count: usize,
    pub state: TaskState,
    pub started_at: Option<SystemTime>,
    pub last_sent_at: Option<SystemTime>,
    pub ended_at: Option<SystemTime>,
}

impl TaskRecord {
    pub fn total_messages(&self) -> usize {
        self.messages.len()
    }

    pub fn is_terminal(&self) -> bool {
        self.state == TaskState::Completed
    }
}
