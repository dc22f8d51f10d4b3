use std::fmt::{Display, Formatter};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Opaque token issued by the messaging provider when a session is opened.
/// Only the lifecycle manager writes it; everything else calls through it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ProviderHandle(pub u64);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Initializing,
    Connected,
    Disconnected,
    LoggedOut,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    pub id: SessionId,
    pub phone_number: String,
    pub handle: Option<ProviderHandle>,
    pub state: SessionState,
    pub retry_count: u32,
    pub last_connected_at: Option<SystemTime>,
}

impl Session {
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            phone_number: self.phone_number.clone(),
            state: self.state,
            retry_count: self.retry_count,
            last_connected_at: self.last_connected_at,
        }
    }
}

/// Persisted view of a session. The provider handle is process-local and is
/// never written to storage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub phone_number: String,
    pub state: SessionState,
    pub retry_count: u32,
    pub last_connected_at: Option<SystemTime>,
}
