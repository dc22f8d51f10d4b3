pub mod engine;

pub use engine::TaskDispatchEngine;

use std::time::Duration;

use crate::models::{CoreError, SessionId, Target};

pub type DispatchResult<T> = Result<T, CoreError>;

/// How long a completed task stays queryable before it is evicted from the
/// registry.
pub const DEFAULT_EVICTION_GRACE: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug)]
pub struct DispatchConfig {
    pub eviction_grace: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            eviction_grace: DEFAULT_EVICTION_GRACE,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TaskRequest {
    pub session: SessionId,
    pub target: Target,
    pub messages: Vec<String>,
    pub prefix: Option<String>,
    pub delay: Duration,
}

/// Split a newline-delimited request payload into messages, dropping blank
/// lines.
pub fn parse_message_payload(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn compose_text(prefix: Option<&str>, message: &str) -> String {
    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{prefix} {message}"),
        _ => message.to_string(),
    }
}
