use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::dispatch::{DispatchConfig, TaskDispatchEngine, TaskRequest};
use crate::lifecycle::{KeepAlive, LifecycleConfig, SessionLifecycleManager};
use crate::models::{
    ActivityRecord, CoreError, CoreErrorKind, Session, SessionId, SessionState, Target, TaskId,
    TaskRecord, TaskState,
};
use crate::persistence::{ActivityLogStore, MigrationStore, SessionStore, TaskStore};
use crate::provider::{GroupInfo, MessagingProvider, PairingOutcome, ProviderEvent};
use crate::registry::{SessionRegistry, TaskRegistry};

pub type RuntimeResult<T> = Result<T, CoreError>;

#[derive(Clone, Copy, Debug, Default)]
pub struct CourierConfig {
    pub lifecycle: LifecycleConfig,
    pub dispatch: DispatchConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub id: SessionId,
    pub phone_number: String,
    pub state: SessionState,
    pub retry_count: u32,
    pub last_connected_at: Option<SystemTime>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub id: TaskId,
    pub session: SessionId,
    pub target: Target,
    pub state: TaskState,
    pub sent_messages: usize,
    pub total_messages: usize,
    pub started_at: Option<SystemTime>,
    pub last_sent_at: Option<SystemTime>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub sessions: Vec<SessionStatus>,
    pub tasks: Vec<TaskProgress>,
}

/// What a restart recovery pass did with the persisted state.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RestoreSummary {
    pub sessions_restored: usize,
    pub sessions_pruned: usize,
    pub tasks_resumed: usize,
    pub tasks_finalized: usize,
    pub tasks_discarded: usize,
}

/// Top-level facade wiring the lifecycle manager, the dispatch engine and
/// the keep-alive ticker around one shared session registry. Clone to
/// share.
#[derive(Clone)]
pub struct CourierRuntime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    provider: Arc<dyn MessagingProvider>,
    sessions: SessionRegistry,
    lifecycle: SessionLifecycleManager,
    dispatch: TaskDispatchEngine,
    config: CourierConfig,
    session_store: Option<Arc<dyn SessionStore>>,
    task_store: Option<Arc<dyn TaskStore>>,
    activity_store: Option<Arc<dyn ActivityLogStore>>,
    migration_store: Option<Arc<dyn MigrationStore>>,
    keep_alive: Mutex<Option<KeepAlive>>,
}

impl CourierRuntime {
    pub fn new(provider: Arc<dyn MessagingProvider>, config: CourierConfig) -> Self {
        Self::build(provider, config, None, None, None, None)
    }

    /// Wire every component against one backing store. Migrations are not
    /// applied here; call [`CourierRuntime::restore`] before serving.
    pub fn with_store<S>(
        provider: Arc<dyn MessagingProvider>,
        config: CourierConfig,
        store: Arc<S>,
    ) -> Self
    where
        S: SessionStore + TaskStore + ActivityLogStore + MigrationStore + 'static,
    {
        Self::build(
            provider,
            config,
            Some(store.clone() as Arc<dyn SessionStore>),
            Some(store.clone() as Arc<dyn TaskStore>),
            Some(store.clone() as Arc<dyn ActivityLogStore>),
            Some(store as Arc<dyn MigrationStore>),
        )
    }

    fn build(
        provider: Arc<dyn MessagingProvider>,
        config: CourierConfig,
        session_store: Option<Arc<dyn SessionStore>>,
        task_store: Option<Arc<dyn TaskStore>>,
        activity_store: Option<Arc<dyn ActivityLogStore>>,
        migration_store: Option<Arc<dyn MigrationStore>>,
    ) -> Self {
        let sessions = SessionRegistry::new();
        let tasks = TaskRegistry::new();
        let lifecycle = SessionLifecycleManager::with_stores(
            provider.clone(),
            sessions.clone(),
            config.lifecycle,
            session_store.clone(),
            activity_store.clone(),
        );
        let dispatch = TaskDispatchEngine::with_stores(
            provider.clone(),
            sessions.clone(),
            tasks,
            config.dispatch,
            task_store.clone(),
            activity_store.clone(),
        );
        Self {
            inner: Arc::new(RuntimeInner {
                provider,
                sessions,
                lifecycle,
                dispatch,
                config,
                session_store,
                task_store,
                activity_store,
                migration_store,
                keep_alive: Mutex::new(None),
            }),
        }
    }

    pub fn lifecycle(&self) -> &SessionLifecycleManager {
        &self.inner.lifecycle
    }

    pub fn dispatch(&self) -> &TaskDispatchEngine {
        &self.inner.dispatch
    }

    pub fn sessions(&self) -> SessionRegistry {
        self.inner.sessions.clone()
    }

    pub fn config(&self) -> CourierConfig {
        self.inner.config
    }

    pub async fn create_session(
        &self,
        id: SessionId,
        phone_number: impl Into<String>,
    ) -> RuntimeResult<Session> {
        self.inner.lifecycle.create_session(id, phone_number).await
    }

    pub async fn handle_connection_event(
        &self,
        id: &SessionId,
        event: ProviderEvent,
    ) -> RuntimeResult<()> {
        self.inner.lifecycle.handle_connection_event(id, event).await
    }

    pub async fn request_pairing_code(
        &self,
        id: &SessionId,
        phone_number: &str,
    ) -> RuntimeResult<PairingOutcome> {
        self.inner
            .lifecycle
            .request_pairing_code(id, phone_number)
            .await
    }

    pub async fn start_task(&self, request: TaskRequest) -> RuntimeResult<TaskId> {
        self.inner.dispatch.start_task(request).await
    }

    pub fn stop_task(&self, task_id: TaskId) -> RuntimeResult<()> {
        self.inner.dispatch.stop_task(task_id)
    }

    pub fn task_status(&self, task_id: TaskId) -> RuntimeResult<TaskRecord> {
        self.inner.dispatch.status(task_id)
    }

    pub async fn wait_for_task(
        &self,
        task_id: TaskId,
        wait_timeout: Option<Duration>,
    ) -> RuntimeResult<TaskRecord> {
        self.inner.dispatch.wait_for_terminal(task_id, wait_timeout).await
    }

    /// Start the shared keep-alive ticker. Starting twice replaces the
    /// previous ticker.
    pub fn start_keep_alive(&self) -> RuntimeResult<()> {
        let ticker = KeepAlive::spawn(
            self.inner.provider.clone(),
            self.inner.sessions.clone(),
            self.inner.config.lifecycle.keep_alive_interval,
        );
        let mut slot = self.inner.keep_alive.lock().map_err(|_| CoreError {
            session: None,
            task: None,
            kind: CoreErrorKind::Internal,
            message: "keep-alive slot mutex poisoned".to_string(),
        })?;
        if let Some(previous) = slot.replace(ticker) {
            previous.shutdown();
        }
        Ok(())
    }

    /// Point-in-time view over both registries, sorted for stable output.
    pub fn status_report(&self) -> RuntimeResult<StatusReport> {
        let mut sessions: Vec<SessionStatus> = self
            .inner
            .sessions
            .snapshot()?
            .into_iter()
            .map(|session| SessionStatus {
                id: session.id,
                phone_number: session.phone_number,
                state: session.state,
                retry_count: session.retry_count,
                last_connected_at: session.last_connected_at,
            })
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));

        let mut tasks: Vec<TaskProgress> = self
            .inner
            .dispatch
            .snapshot_all()?
            .into_iter()
            .map(|task| TaskProgress {
                id: task.id,
                session: task.session.clone(),
                target: task.target.clone(),
                state: task.state,
                sent_messages: task.sent_count,
                total_messages: task.total_messages(),
                started_at: task.started_at,
                last_sent_at: task.last_sent_at,
            })
            .collect();
        tasks.sort_by_key(|task| task.id);

        Ok(StatusReport { sessions, tasks })
    }

    /// List groups visible to `session`, or to the first connected session
    /// when none is named.
    pub async fn list_groups(&self, session: Option<&SessionId>) -> RuntimeResult<Vec<GroupInfo>> {
        let resolved = match session {
            Some(id) => self
                .inner
                .sessions
                .get(id)?
                .ok_or_else(|| no_usable_session(Some(id)))?,
            None => self
                .first_connected_session()?
                .ok_or_else(|| no_usable_session(None))?,
        };

        let handle = match (resolved.state, resolved.handle) {
            (SessionState::Connected, Some(handle)) => handle,
            _ => return Err(no_usable_session(Some(&resolved.id))),
        };

        self.inner
            .provider
            .fetch_groups(&handle)
            .await
            .map_err(|error| CoreError {
                session: Some(resolved.id),
                task: None,
                kind: CoreErrorKind::SendFailure,
                message: format!("group listing failed: {error}"),
            })
    }

    pub async fn recent_activity(&self, limit: usize) -> RuntimeResult<Vec<ActivityRecord>> {
        let Some(store) = self.inner.activity_store.clone() else {
            return Ok(Vec::new());
        };
        tokio::task::spawn_blocking(move || store.recent(limit))
            .await
            .map_err(|join_error| CoreError {
                session: None,
                task: None,
                kind: CoreErrorKind::Internal,
                message: format!("activity query join failure: {join_error}"),
            })?
    }

    /// Restart recovery: apply migrations, then rebuild in-memory state
    /// from persisted snapshots. Sessions that were connected are reopened
    /// through the provider; everything else is pruned. Running tasks
    /// resume from their cursor, stop-requested ones are finalized as
    /// completed, and already-completed leftovers are discarded.
    pub async fn restore(&self) -> RuntimeResult<RestoreSummary> {
        let mut summary = RestoreSummary::default();

        if let Some(migrations) = self.inner.migration_store.clone() {
            tokio::task::spawn_blocking(move || {
                let version = migrations.current_version()?;
                if version < crate::sqlite::current_schema_version() {
                    migrations.apply_migration(crate::sqlite::current_schema_version())?;
                }
                Ok::<(), CoreError>(())
            })
            .await
            .map_err(join_failure)??;
        }

        summary = self.restore_sessions(summary).await?;
        self.restore_tasks(summary).await
    }

    async fn restore_sessions(&self, mut summary: RestoreSummary) -> RuntimeResult<RestoreSummary> {
        let Some(store) = self.inner.session_store.clone() else {
            return Ok(summary);
        };
        let snapshots = tokio::task::spawn_blocking(move || store.list_sessions())
            .await
            .map_err(join_failure)??;

        for snapshot in snapshots {
            if snapshot.state != SessionState::Connected {
                tracing::info!(
                    session = %snapshot.id,
                    state = ?snapshot.state,
                    "pruning persisted session that was not connected"
                );
                let store = self.inner.session_store.clone();
                if let Some(store) = store {
                    let id = snapshot.id.clone();
                    tokio::task::spawn_blocking(move || store.remove_session(&id))
                        .await
                        .map_err(join_failure)??;
                }
                summary.sessions_pruned += 1;
                continue;
            }

            match self
                .inner
                .lifecycle
                .create_session(snapshot.id.clone(), snapshot.phone_number.clone())
                .await
            {
                Ok(_) => summary.sessions_restored += 1,
                Err(error) => {
                    tracing::warn!(
                        session = %snapshot.id,
                        kind = ?error.kind,
                        message = %error.message,
                        "failed to reopen persisted session"
                    );
                }
            }
        }

        Ok(summary)
    }

    async fn restore_tasks(&self, mut summary: RestoreSummary) -> RuntimeResult<RestoreSummary> {
        let Some(store) = self.inner.task_store.clone() else {
            return Ok(summary);
        };
        let records = {
            let store = store.clone();
            tokio::task::spawn_blocking(move || store.list_tasks())
                .await
                .map_err(join_failure)??
        };

        for mut record in records {
            match record.state {
                TaskState::Running => {
                    if !self.inner.sessions.contains(&record.session)? {
                        tracing::warn!(
                            task = record.id.0,
                            session = %record.session,
                            "discarding persisted task whose session was not restored"
                        );
                        self.discard_task(store.clone(), record.id).await?;
                        summary.tasks_discarded += 1;
                        continue;
                    }
                    match self.inner.dispatch.resume_task(record.clone()).await {
                        Ok(_) => summary.tasks_resumed += 1,
                        Err(error) => {
                            tracing::error!(
                                task = record.id.0,
                                kind = ?error.kind,
                                message = %error.message,
                                "failed to resume persisted task"
                            );
                        }
                    }
                }
                TaskState::StopRequested => {
                    record.state = TaskState::Completed;
                    record.ended_at = Some(SystemTime::now());
                    let store = store.clone();
                    let finalized = record.clone();
                    tokio::task::spawn_blocking(move || store.save_task(&finalized))
                        .await
                        .map_err(join_failure)??;
                    summary.tasks_finalized += 1;
                }
                TaskState::Completed => {
                    self.discard_task(store.clone(), record.id).await?;
                    summary.tasks_discarded += 1;
                }
            }
        }

        Ok(summary)
    }

    async fn discard_task(&self, store: Arc<dyn TaskStore>, id: TaskId) -> RuntimeResult<()> {
        tokio::task::spawn_blocking(move || store.remove_task(id))
            .await
            .map_err(join_failure)?
    }

    fn first_connected_session(&self) -> RuntimeResult<Option<Session>> {
        let mut connected: Vec<Session> = self
            .inner
            .sessions
            .snapshot()?
            .into_iter()
            .filter(|session| session.state == SessionState::Connected && session.handle.is_some())
            .collect();
        connected.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(connected.into_iter().next())
    }

    /// Stop every background worker: reconnect timers, send loops and the
    /// keep-alive ticker. Persisted state is left intact for a later
    /// [`CourierRuntime::restore`].
    pub async fn shutdown(&self) {
        self.inner.lifecycle.shutdown();
        self.inner.dispatch.shutdown().await;
        if let Ok(mut slot) = self.inner.keep_alive.lock()
            && let Some(ticker) = slot.take()
        {
            ticker.shutdown();
        }
    }
}

fn no_usable_session(id: Option<&SessionId>) -> CoreError {
    CoreError {
        session: id.cloned(),
        task: None,
        kind: CoreErrorKind::NoActiveSession,
        message: match id {
            Some(id) => format!("session '{id}' is not connected"),
            None => "no connected session is available".to_string(),
        },
    }
}

fn join_failure(join_error: tokio::task::JoinError) -> CoreError {
    CoreError {
        session: None,
        task: None,
        kind: CoreErrorKind::Internal,
        message: format!("blocking store operation join failure: {join_error}"),
    }
}
