pub mod keep_alive;
pub mod manager;

pub use keep_alive::KeepAlive;
pub use manager::SessionLifecycleManager;

use std::time::Duration;

use crate::models::CoreError;
use crate::provider::CloseCode;

pub type LifecycleResult<T> = Result<T, CoreError>;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Effectively unlimited; the bound only keeps a dead account from retrying
/// forever.
pub const DEFAULT_MAX_RETRIES: u32 = 1_000_000;

#[derive(Clone, Copy, Debug)]
pub struct LifecycleConfig {
    pub reconnect_delay: Duration,
    pub max_retries: u32,
    pub keep_alive_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseDisposition {
    Reconnectable,
    Terminal,
}

/// Close-code policy. Codes meaning "this authenticated session is gone"
/// (explicit logout, unauthorized) are terminal; every other closure is
/// retried on the fixed schedule.
pub fn close_disposition(code: CloseCode) -> CloseDisposition {
    match code {
        CloseCode::LOGGED_OUT | CloseCode::UNAUTHORIZED => CloseDisposition::Terminal,
        _ => CloseDisposition::Reconnectable,
    }
}
