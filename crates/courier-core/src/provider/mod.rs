pub mod scripted;

pub use scripted::{ScriptedProvider, SentMessage};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{ProviderHandle, SessionId, Target};

#[derive(Debug, Clone, Error, Eq, PartialEq)]
pub enum ProviderError {
    #[error("provider connection is not open")]
    NotConnected,
    #[error("provider rejected the request: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Connection-level reason code delivered with a close event. The provider
/// reports the code verbatim; deciding whether it is terminal is lifecycle
/// policy, not provider policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct CloseCode(pub i64);

impl CloseCode {
    pub const LOGGED_OUT: CloseCode = CloseCode(401);
    pub const UNAUTHORIZED: CloseCode = CloseCode(403);
    pub const SERVICE_UNAVAILABLE: CloseCode = CloseCode(503);
    pub const RESTART_REQUIRED: CloseCode = CloseCode(515);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProviderEvent {
    Opened,
    Closed(CloseCode),
    CredentialRotated,
}

/// Capabilities are fixed when the provider is constructed; callers never
/// probe per call.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ProviderCapabilities {
    pub pairing_code: bool,
}

/// Result of a pairing-code request. `Unsupported` means the provider only
/// exposes an out-of-band pairing mechanism (e.g. a displayed code); a code
/// is never fabricated in that case.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PairingOutcome {
    Supported(String),
    Unsupported,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub id: String,
    pub name: String,
    pub participant_count: usize,
}

/// Boundary to the external messaging network. Credential storage, the wire
/// protocol and encryption all live behind this trait; the core only drives
/// handles and consumes `ProviderEvent`s.
#[async_trait]
pub trait MessagingProvider: Send + Sync {
    fn capabilities(&self) -> ProviderCapabilities;

    async fn open(
        &self,
        session: &SessionId,
        phone_number: &str,
    ) -> Result<ProviderHandle, ProviderError>;

    async fn send_message(
        &self,
        handle: &ProviderHandle,
        target: &Target,
        text: &str,
    ) -> Result<(), ProviderError>;

    /// No-payload presence update used as keep-alive traffic.
    async fn send_presence(&self, handle: &ProviderHandle) -> Result<(), ProviderError>;

    async fn fetch_groups(&self, handle: &ProviderHandle)
    -> Result<Vec<GroupInfo>, ProviderError>;

    async fn request_pairing_code(
        &self,
        handle: &ProviderHandle,
        phone_number: &str,
    ) -> Result<String, ProviderError>;
}
