use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;

use crate::models::{ProviderHandle, SessionId, Target};
use crate::provider::{
    GroupInfo, MessagingProvider, ProviderCapabilities, ProviderError,
};

/// Scripted stand-in for a live messaging network. Every delivered message
/// and presence update is recorded, and `open`/`send_message` outcomes can
/// be queued ahead of time (default outcome is success). Integration tests
/// and dry-run embedders drive the core against this implementation.
pub struct ScriptedProvider {
    capabilities: ProviderCapabilities,
    pairing_code: Option<String>,
    groups: Vec<GroupInfo>,
    next_handle: AtomicU64,
    open_results: Mutex<VecDeque<Result<(), ProviderError>>>,
    send_results: Mutex<VecDeque<Result<(), ProviderError>>>,
    presence_results: Mutex<VecDeque<Result<(), ProviderError>>>,
    sent: Mutex<Vec<SentMessage>>,
    presence_updates: Mutex<Vec<ProviderHandle>>,
}

#[derive(Clone, Debug)]
pub struct SentMessage {
    pub handle: ProviderHandle,
    pub target: Target,
    pub text: String,
    pub at: Instant,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            capabilities: ProviderCapabilities::default(),
            pairing_code: None,
            groups: Vec::new(),
            next_handle: AtomicU64::new(1),
            open_results: Mutex::new(VecDeque::new()),
            send_results: Mutex::new(VecDeque::new()),
            presence_results: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            presence_updates: Mutex::new(Vec::new()),
        }
    }

    /// Advertise the pairing capability and serve this code for every
    /// pairing request.
    pub fn with_pairing_code(mut self, code: impl Into<String>) -> Self {
        self.capabilities.pairing_code = true;
        self.pairing_code = Some(code.into());
        self
    }

    pub fn with_groups(mut self, groups: Vec<GroupInfo>) -> Self {
        self.groups = groups;
        self
    }

    /// Queue the outcome of an upcoming `open` call. Unqueued calls succeed.
    pub fn script_open(&self, result: Result<(), ProviderError>) {
        self.open_results.lock().unwrap().push_back(result);
    }

    /// Queue the outcome of an upcoming `send_message` call.
    pub fn script_send(&self, result: Result<(), ProviderError>) {
        self.send_results.lock().unwrap().push_back(result);
    }

    /// Queue the outcome of an upcoming `send_presence` call.
    pub fn script_presence(&self, result: Result<(), ProviderError>) {
        self.presence_results.lock().unwrap().push_back(result);
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|message| message.text.clone())
            .collect()
    }

    pub fn presence_update_count(&self) -> usize {
        self.presence_updates.lock().unwrap().len()
    }

    fn next_scripted(queue: &Mutex<VecDeque<Result<(), ProviderError>>>) -> Result<(), ProviderError> {
        queue.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

#[async_trait]
impl MessagingProvider for ScriptedProvider {
    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    async fn open(
        &self,
        _session: &SessionId,
        _phone_number: &str,
    ) -> Result<ProviderHandle, ProviderError> {
        Self::next_scripted(&self.open_results)?;
        Ok(ProviderHandle(self.next_handle.fetch_add(1, Ordering::SeqCst)))
    }

    async fn send_message(
        &self,
        handle: &ProviderHandle,
        target: &Target,
        text: &str,
    ) -> Result<(), ProviderError> {
        Self::next_scripted(&self.send_results)?;
        self.sent.lock().unwrap().push(SentMessage {
            handle: *handle,
            target: target.clone(),
            text: text.to_string(),
            at: Instant::now(),
        });
        Ok(())
    }

    async fn send_presence(&self, handle: &ProviderHandle) -> Result<(), ProviderError> {
        Self::next_scripted(&self.presence_results)?;
        self.presence_updates.lock().unwrap().push(*handle);
        Ok(())
    }

    async fn fetch_groups(
        &self,
        _handle: &ProviderHandle,
    ) -> Result<Vec<GroupInfo>, ProviderError> {
        Ok(self.groups.clone())
    }

    async fn request_pairing_code(
        &self,
        _handle: &ProviderHandle,
        _phone_number: &str,
    ) -> Result<String, ProviderError> {
        self.pairing_code
            .clone()
            .ok_or_else(|| ProviderError::Rejected("pairing codes are not available".to_string()))
    }
}
