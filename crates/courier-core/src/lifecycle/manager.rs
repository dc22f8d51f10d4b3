use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::task::AbortHandle;

use crate::lifecycle::{CloseDisposition, LifecycleConfig, LifecycleResult, close_disposition};
use crate::models::{
    ActivityLevel, CoreError, CoreErrorKind, NewActivityRecord, Session, SessionId,
    SessionSnapshot, SessionState,
};
use crate::persistence::{ActivityLogStore, SessionStore};
use crate::provider::{MessagingProvider, PairingOutcome, ProviderEvent};
use crate::registry::SessionRegistry;

/// Drives one state machine per session: `Initializing → Connected` on
/// `Opened`, `Connected → Disconnected` on a reconnectable closure,
/// `Disconnected → Initializing` after the fixed reconnect delay, and
/// removal on a terminal closure. Reconnect timers are tracked per session
/// so removal deterministically cancels a pending attempt.
#[derive(Clone)]
pub struct SessionLifecycleManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    provider: Arc<dyn MessagingProvider>,
    sessions: SessionRegistry,
    store: Option<Arc<dyn SessionStore>>,
    activity: Option<Arc<dyn ActivityLogStore>>,
    config: LifecycleConfig,
    reconnect_timers: Mutex<HashMap<SessionId, AbortHandle>>,
}

impl SessionLifecycleManager {
    pub fn new(
        provider: Arc<dyn MessagingProvider>,
        sessions: SessionRegistry,
        config: LifecycleConfig,
    ) -> Self {
        Self::with_stores(provider, sessions, config, None, None)
    }

    pub fn with_stores(
        provider: Arc<dyn MessagingProvider>,
        sessions: SessionRegistry,
        config: LifecycleConfig,
        store: Option<Arc<dyn SessionStore>>,
        activity: Option<Arc<dyn ActivityLogStore>>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                provider,
                sessions,
                store,
                activity,
                config,
                reconnect_timers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn sessions(&self) -> SessionRegistry {
        self.inner.sessions.clone()
    }

    pub fn session(&self, id: &SessionId) -> LifecycleResult<Option<Session>> {
        self.inner.sessions.get(id)
    }

    pub fn config(&self) -> LifecycleConfig {
        self.inner.config
    }

    /// Open a provider handle for `id` and register the session. A fresh
    /// session surfaces open failures as `ProviderInit`; when an entry
    /// already exists the failure path re-enters the reconnect policy
    /// instead of surfacing on every call.
    pub async fn create_session(
        &self,
        id: SessionId,
        phone_number: impl Into<String>,
    ) -> LifecycleResult<Session> {
        let phone_number = phone_number.into();
        if phone_number.trim().is_empty() {
            return Err(CoreError {
                session: Some(id),
                task: None,
                kind: CoreErrorKind::InvalidInput,
                message: "phone number must not be empty".to_string(),
            });
        }

        let existing = self.inner.sessions.get(&id)?;

        match self.inner.provider.open(&id, &phone_number).await {
            Ok(handle) => {
                let session = Session {
                    id: id.clone(),
                    phone_number,
                    handle: Some(handle),
                    state: SessionState::Initializing,
                    retry_count: existing.as_ref().map(|s| s.retry_count).unwrap_or(0),
                    last_connected_at: existing.as_ref().and_then(|s| s.last_connected_at),
                };
                self.inner.sessions.insert(id.clone(), session.clone())?;
                self.persist_session(session.snapshot()).await;
                self.log_activity(
                    ActivityLevel::Info,
                    Some(id.clone()),
                    "session initializing",
                );
                tracing::info!(session = %id, "session registered, provider handle open");
                Ok(session)
            }
            Err(error) if existing.is_some() => {
                tracing::warn!(
                    session = %id,
                    error = %error,
                    "provider open failed for existing session, scheduling reconnect"
                );
                self.inner.sessions.update(&id, |session| {
                    session.state = SessionState::Disconnected;
                    session.handle = None;
                })?;
                self.schedule_reconnect(&id);
                self.inner
                    .sessions
                    .get(&id)?
                    .ok_or_else(|| no_active_session(&id))
            }
            Err(error) => Err(CoreError {
                session: Some(id),
                task: None,
                kind: CoreErrorKind::ProviderInit,
                message: format!("failed to open provider session: {error}"),
            }),
        }
    }

    /// Consume a provider connection event and advance the state machine.
    /// Events for unknown session ids are logged and ignored.
    pub async fn handle_connection_event(
        &self,
        id: &SessionId,
        event: ProviderEvent,
    ) -> LifecycleResult<()> {
        if !self.inner.sessions.contains(id)? {
            tracing::warn!(session = %id, event = ?event, "connection event for unknown session");
            return Ok(());
        }

        match event {
            ProviderEvent::Opened => {
                let snapshot = self.inner.sessions.update(id, |session| {
                    session.state = SessionState::Connected;
                    session.retry_count = 0;
                    session.last_connected_at = Some(SystemTime::now());
                    session.snapshot()
                })?;
                if let Some(snapshot) = snapshot {
                    self.persist_session(snapshot).await;
                }
                self.log_activity(ActivityLevel::Info, Some(id.clone()), "session connected");
                tracing::info!(session = %id, "session connected");
            }
            ProviderEvent::Closed(code) => match close_disposition(code) {
                CloseDisposition::Terminal => {
                    self.cancel_reconnect(id);
                    self.inner.sessions.remove(id)?;
                    self.remove_session_snapshot(id).await;
                    self.log_activity(
                        ActivityLevel::Warn,
                        Some(id.clone()),
                        format!("session logged out (close code {})", code.0),
                    );
                    tracing::warn!(
                        session = %id,
                        code = code.0,
                        "terminal connection closure, session removed"
                    );
                }
                CloseDisposition::Reconnectable => {
                    let snapshot = self.inner.sessions.update(id, |session| {
                        session.state = SessionState::Disconnected;
                        session.handle = None;
                        session.snapshot()
                    })?;
                    if let Some(snapshot) = snapshot {
                        self.persist_session(snapshot).await;
                    }
                    self.log_activity(
                        ActivityLevel::Info,
                        Some(id.clone()),
                        format!("connection closed (code {}), reconnect scheduled", code.0),
                    );
                    tracing::info!(session = %id, code = code.0, "connection closed, reconnect scheduled");
                    self.schedule_reconnect(id);
                }
            },
            ProviderEvent::CredentialRotated => {
                tracing::debug!(session = %id, "session credentials rotated");
                self.log_activity(
                    ActivityLevel::Info,
                    Some(id.clone()),
                    "session credentials rotated",
                );
            }
        }

        Ok(())
    }

    /// Delegate a pairing-code request to the provider. Providers without
    /// the capability yield the `Unsupported` sentinel; a code is never
    /// fabricated here.
    pub async fn request_pairing_code(
        &self,
        id: &SessionId,
        phone_number: &str,
    ) -> LifecycleResult<PairingOutcome> {
        let session = self
            .inner
            .sessions
            .get(id)?
            .ok_or_else(|| no_active_session(id))?;

        if !self.inner.provider.capabilities().pairing_code {
            return Ok(PairingOutcome::Unsupported);
        }

        let handle = session.handle.ok_or_else(|| CoreError {
            session: Some(id.clone()),
            task: None,
            kind: CoreErrorKind::ProviderInit,
            message: "session has no open provider handle".to_string(),
        })?;

        match self
            .inner
            .provider
            .request_pairing_code(&handle, phone_number)
            .await
        {
            Ok(code) => Ok(PairingOutcome::Supported(code)),
            Err(error) => Err(CoreError {
                session: Some(id.clone()),
                task: None,
                kind: CoreErrorKind::ProviderInit,
                message: format!("pairing code request failed: {error}"),
            }),
        }
    }

    pub fn has_pending_reconnect(&self, id: &SessionId) -> bool {
        match self.inner.reconnect_timers.lock() {
            Ok(timers) => timers.contains_key(id),
            Err(_) => false,
        }
    }

    /// Abort every pending reconnect timer.
    pub fn shutdown(&self) {
        if let Ok(mut timers) = self.inner.reconnect_timers.lock() {
            for (_, handle) in timers.drain() {
                handle.abort();
            }
        }
    }

    fn schedule_reconnect(&self, id: &SessionId) {
        let retry_count = match self.inner.sessions.read(id, |session| session.retry_count) {
            Ok(Some(count)) => count,
            Ok(None) => return,
            Err(error) => {
                tracing::error!(session = %id, error = %error, "failed to read session for reconnect");
                return;
            }
        };

        if retry_count >= self.inner.config.max_retries {
            tracing::warn!(
                session = %id,
                retry_count,
                "reconnect attempt budget exhausted, leaving session disconnected"
            );
            return;
        }

        let manager = self.clone();
        let session_id = id.clone();
        let delay = self.inner.config.reconnect_delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.clear_timer(&session_id);
            manager.attempt_reconnect(&session_id).await;
        });

        self.store_timer(id, handle.abort_handle());
    }

    async fn attempt_reconnect(&self, id: &SessionId) {
        let session = match self.inner.sessions.get(id) {
            Ok(Some(session)) => session,
            Ok(None) => return,
            Err(error) => {
                tracing::error!(session = %id, error = %error, "failed to read session for reconnect");
                return;
            }
        };

        let attempt = session.retry_count.saturating_add(1);
        let transition = self.inner.sessions.update(id, |session| {
            session.state = SessionState::Initializing;
            session.retry_count = attempt;
            session.snapshot()
        });
        match transition {
            Ok(Some(snapshot)) => self.persist_session(snapshot).await,
            Ok(None) => return,
            Err(error) => {
                tracing::error!(session = %id, error = %error, "failed to mark session initializing");
                return;
            }
        }

        tracing::info!(session = %id, attempt, "attempting reconnect");

        match self.inner.provider.open(id, &session.phone_number).await {
            Ok(handle) => {
                // Connected arrives via the provider's Opened event.
                let _ = self.inner.sessions.update(id, |session| {
                    session.handle = Some(handle);
                });
            }
            Err(error) => {
                tracing::warn!(session = %id, attempt, error = %error, "reconnect open failed");
                let snapshot = self.inner.sessions.update(id, |session| {
                    session.state = SessionState::Disconnected;
                    session.handle = None;
                    session.snapshot()
                });
                if let Ok(Some(snapshot)) = snapshot {
                    self.persist_session(snapshot).await;
                }
                self.schedule_reconnect(id);
            }
        }
    }

    fn store_timer(&self, id: &SessionId, handle: AbortHandle) {
        match self.inner.reconnect_timers.lock() {
            Ok(mut timers) => {
                if let Some(previous) = timers.insert(id.clone(), handle) {
                    previous.abort();
                }
            }
            Err(_) => {
                tracing::error!(session = %id, "reconnect timer table mutex poisoned");
                handle.abort();
            }
        }
    }

    fn clear_timer(&self, id: &SessionId) {
        if let Ok(mut timers) = self.inner.reconnect_timers.lock() {
            timers.remove(id);
        }
    }

    fn cancel_reconnect(&self, id: &SessionId) {
        if let Ok(mut timers) = self.inner.reconnect_timers.lock()
            && let Some(handle) = timers.remove(id)
        {
            handle.abort();
        }
    }

    async fn persist_session(&self, snapshot: SessionSnapshot) {
        let Some(store) = self.inner.store.clone() else {
            return;
        };
        let session_id = snapshot.id.clone();
        let outcome = tokio::task::spawn_blocking(move || store.save_session(&snapshot)).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::error!(
                    session = %session_id,
                    kind = ?error.kind,
                    message = %error.message,
                    "failed to persist session snapshot"
                );
            }
            Err(join_error) => {
                tracing::error!(
                    session = %session_id,
                    message = %join_error,
                    "session snapshot persistence join failure"
                );
            }
        }
    }

    async fn remove_session_snapshot(&self, id: &SessionId) {
        let Some(store) = self.inner.store.clone() else {
            return;
        };
        let session_id = id.clone();
        let logged_id = id.clone();
        let outcome =
            tokio::task::spawn_blocking(move || store.remove_session(&session_id)).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::error!(
                    session = %logged_id,
                    kind = ?error.kind,
                    message = %error.message,
                    "failed to remove session snapshot"
                );
            }
            Err(join_error) => {
                tracing::error!(
                    session = %logged_id,
                    message = %join_error,
                    "session snapshot removal join failure"
                );
            }
        }
    }

    fn log_activity(
        &self,
        level: ActivityLevel,
        session: Option<SessionId>,
        message: impl Into<String>,
    ) {
        let Some(store) = self.inner.activity.clone() else {
            return;
        };
        let record = NewActivityRecord::now(level, session, None, message);
        tokio::spawn(async move {
            let outcome = tokio::task::spawn_blocking(move || store.append(&record)).await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::error!(
                        kind = ?error.kind,
                        message = %error.message,
                        "failed to append activity record"
                    );
                }
                Err(join_error) => {
                    tracing::error!(message = %join_error, "activity append join failure");
                }
            }
        });
    }
}

fn no_active_session(id: &SessionId) -> CoreError {
    CoreError {
        session: Some(id.clone()),
        task: None,
        kind: CoreErrorKind::NoActiveSession,
        message: format!("no session registered for id '{id}'"),
    }
}
