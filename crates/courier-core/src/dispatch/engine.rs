use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{Mutex, Notify};
use tokio::task::AbortHandle;
use tokio::time::Duration;

use crate::dispatch::{DispatchConfig, DispatchResult, TaskRequest, compose_text};
use crate::models::{
    ActivityLevel, CoreError, CoreErrorKind, NewActivityRecord, SessionId, Target, TaskId,
    TaskRecord, TaskState,
};
use crate::persistence::{ActivityLogStore, TaskStore};
use crate::provider::MessagingProvider;
use crate::registry::{SessionRegistry, TaskRegistry};

/// Runs bulk dispatch tasks: one paced send loop per task, sharing the
/// session registry with the lifecycle manager so every send resolves the
/// current provider handle. Clone to share.
pub struct TaskDispatchEngine {
    inner: Arc<EngineInner>,
}

impl Clone for TaskDispatchEngine {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct EngineInner {
    provider: Arc<dyn MessagingProvider>,
    sessions: SessionRegistry,
    tasks: TaskRegistry,
    store: Option<Arc<dyn TaskStore>>,
    activity: Option<Arc<dyn ActivityLogStore>>,
    config: DispatchConfig,
    state: Mutex<EngineState>,
}

#[derive(Default)]
struct EngineState {
    next_task_id: u64,
    seeded: bool,
    loop_handles: HashMap<TaskId, AbortHandle>,
    completion_notifiers: HashMap<TaskId, Arc<Notify>>,
}

impl TaskDispatchEngine {
    pub fn new(
        provider: Arc<dyn MessagingProvider>,
        sessions: SessionRegistry,
        tasks: TaskRegistry,
        config: DispatchConfig,
    ) -> Self {
        Self::with_stores(provider, sessions, tasks, config, None, None)
    }

    pub fn with_stores(
        provider: Arc<dyn MessagingProvider>,
        sessions: SessionRegistry,
        tasks: TaskRegistry,
        config: DispatchConfig,
        store: Option<Arc<dyn TaskStore>>,
        activity: Option<Arc<dyn ActivityLogStore>>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                provider,
                sessions,
                tasks,
                store,
                activity,
                config,
                state: Mutex::new(EngineState::default()),
            }),
        }
    }

    pub fn tasks(&self) -> TaskRegistry {
        self.inner.tasks.clone()
    }

    pub fn config(&self) -> DispatchConfig {
        self.inner.config
    }

    /// Register and launch a dispatch task. The record is persisted before
    /// the send loop spawns so a crash between the two cannot lose the task.
    pub async fn start_task(&self, request: TaskRequest) -> DispatchResult<TaskId> {
        if request.messages.is_empty() {
            return Err(CoreError {
                session: Some(request.session.clone()),
                task: None,
                kind: CoreErrorKind::InvalidInput,
                message: "task payload contains no messages".to_string(),
            });
        }
        if !self.inner.sessions.contains(&request.session)? {
            return Err(CoreError {
                session: Some(request.session.clone()),
                task: None,
                kind: CoreErrorKind::NoActiveSession,
                message: format!("no session registered for id '{}'", request.session),
            });
        }

        let task_id = self.allocate_task_id().await?;
        let record = TaskRecord {
            id: task_id,
            session: request.session,
            target: request.target,
            messages: request.messages,
            prefix: request.prefix,
            delay: request.delay,
            sent_count: 0,
            state: TaskState::Running,
            started_at: Some(SystemTime::now()),
            last_sent_at: None,
            ended_at: None,
        };

        self.inner.tasks.insert(task_id, record.clone())?;
        if let Err(error) = self.persist_task(record.clone()).await {
            self.inner.tasks.remove(&task_id)?;
            self.forget_task(task_id).await;
            return Err(error);
        }

        tracing::info!(
            task = task_id.0,
            session = %record.session,
            total = record.total_messages(),
            "dispatch task started"
        );
        self.log_activity(
            ActivityLevel::Info,
            Some(record.session.clone()),
            Some(task_id),
            format!("task started with {} messages", record.total_messages()),
        );
        self.spawn_send_loop(record).await;
        Ok(task_id)
    }

    /// Re-launch a task loaded from persistence, continuing from its
    /// `sent_count` cursor. Terminal records are rejected.
    pub async fn resume_task(&self, record: TaskRecord) -> DispatchResult<TaskId> {
        if record.state != TaskState::Running {
            return Err(CoreError {
                session: Some(record.session.clone()),
                task: Some(record.id),
                kind: CoreErrorKind::InvalidInput,
                message: format!("task '{}' is not resumable in state {:?}", record.id.0, record.state),
            });
        }
        if record.sent_count > record.total_messages() {
            return Err(CoreError {
                session: Some(record.session.clone()),
                task: Some(record.id),
                kind: CoreErrorKind::InvalidInput,
                message: format!(
                    "task '{}' cursor {} exceeds payload of {} messages",
                    record.id.0,
                    record.sent_count,
                    record.total_messages()
                ),
            });
        }

        let task_id = record.id;
        {
            let mut state = self.inner.state.lock().await;
            if state.loop_handles.contains_key(&task_id) {
                return Err(CoreError {
                    session: Some(record.session.clone()),
                    task: Some(task_id),
                    kind: CoreErrorKind::InvalidInput,
                    message: format!("task '{}' already has a running send loop", task_id.0),
                });
            }
            state.next_task_id = state.next_task_id.max(task_id.0 + 1);
        }

        self.inner.tasks.insert(task_id, record.clone())?;
        tracing::info!(
            task = task_id.0,
            session = %record.session,
            cursor = record.sent_count,
            total = record.total_messages(),
            "dispatch task resumed"
        );
        self.log_activity(
            ActivityLevel::Info,
            Some(record.session.clone()),
            Some(task_id),
            format!(
                "task resumed at message {} of {}",
                record.sent_count,
                record.total_messages()
            ),
        );
        self.spawn_send_loop(record).await;
        Ok(task_id)
    }

    /// Advisory stop: flips the task to `StopRequested` and returns without
    /// waiting. The send loop observes the flag at its next checkpoint.
    /// Stopping an already-terminal task is a no-op.
    pub fn stop_task(&self, task_id: TaskId) -> DispatchResult<()> {
        let flipped = self.inner.tasks.update(&task_id, |task| {
            if task.state == TaskState::Running {
                task.state = TaskState::StopRequested;
                (true, task.session.clone())
            } else {
                (false, task.session.clone())
            }
        })?;
        match flipped {
            None => Err(unknown_task(task_id)),
            Some((false, _)) => Ok(()),
            Some((true, session)) => {
                tracing::info!(task = task_id.0, "stop requested");
                self.log_activity(
                    ActivityLevel::Info,
                    Some(session),
                    Some(task_id),
                    "stop requested",
                );
                Ok(())
            }
        }
    }

    pub fn status(&self, task_id: TaskId) -> DispatchResult<TaskRecord> {
        self.inner
            .tasks
            .get(&task_id)?
            .ok_or_else(|| unknown_task(task_id))
    }

    pub fn snapshot_all(&self) -> DispatchResult<Vec<TaskRecord>> {
        self.inner.tasks.snapshot()
    }

    /// Block until the task reaches `Completed`, or until `wait_timeout`
    /// elapses when one is given.
    pub async fn wait_for_terminal(
        &self,
        task_id: TaskId,
        wait_timeout: Option<Duration>,
    ) -> DispatchResult<TaskRecord> {
        loop {
            let notify = {
                let state = self.inner.state.lock().await;
                state.completion_notifiers.get(&task_id).cloned()
            };
            let Some(notify) = notify else {
                // No live loop; the record itself is the answer.
                return self.status(task_id);
            };

            // Register the waiter before re-reading state so a completion
            // landing in between is not missed.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let record = self.status(task_id)?;
            if record.is_terminal() {
                return Ok(record);
            }

            match wait_timeout {
                Some(duration) => {
                    tokio::time::timeout(duration, notified)
                        .await
                        .map_err(|_| CoreError {
                            session: None,
                            task: Some(task_id),
                            kind: CoreErrorKind::Internal,
                            message: format!(
                                "timed out waiting for task '{}' to complete",
                                task_id.0
                            ),
                        })?;
                }
                None => notified.await,
            }
        }
    }

    /// Abort every send loop and pending eviction without touching task
    /// state. Used on process shutdown; persisted records stay resumable.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        for (_, handle) in state.loop_handles.drain() {
            handle.abort();
        }
        state.completion_notifiers.clear();
    }

    async fn allocate_task_id(&self) -> DispatchResult<TaskId> {
        let mut state = self.inner.state.lock().await;
        if !state.seeded {
            if let Some(store) = self.inner.store.clone() {
                let persisted = tokio::task::spawn_blocking(move || store.next_task_id())
                    .await
                    .map_err(|join_error| CoreError {
                        session: None,
                        task: None,
                        kind: CoreErrorKind::Internal,
                        message: format!("task id seeding join failure: {join_error}"),
                    })??;
                state.next_task_id = state.next_task_id.max(persisted);
            }
            state.seeded = true;
        }
        let task_id = TaskId(state.next_task_id);
        state.next_task_id += 1;
        Ok(task_id)
    }

    async fn spawn_send_loop(&self, record: TaskRecord) {
        let task_id = record.id;
        // The notifier must exist before the loop can finish, or a fast
        // zero-delay task could complete without waking any waiter.
        let mut state = self.inner.state.lock().await;
        state
            .completion_notifiers
            .insert(task_id, Arc::new(Notify::new()));
        let engine = self.clone();
        let handle = tokio::spawn(engine.run_send_loop(record)).abort_handle();
        state.loop_handles.insert(task_id, handle);
    }

    async fn run_send_loop(self, record: TaskRecord) {
        let task_id = record.id;
        let total = record.total_messages();
        for index in record.sent_count..total {
            // Checkpoint: stops and evictions are observed here, never
            // mid-send, so no message is interrupted partway through.
            match self.inner.tasks.read(&task_id, |task| task.state) {
                Ok(Some(TaskState::Running)) => {}
                Ok(_) => break,
                Err(error) => {
                    tracing::error!(
                        task = task_id.0,
                        kind = ?error.kind,
                        message = %error.message,
                        "task registry read failed, stopping send loop"
                    );
                    break;
                }
            }

            let text = compose_text(record.prefix.as_deref(), &record.messages[index]);
            self.deliver(&record.session, &record.target, &text, task_id, index)
                .await;

            let advanced = self.inner.tasks.update(&task_id, |task| {
                task.sent_count = index + 1;
                task.last_sent_at = Some(SystemTime::now());
                task.clone()
            });
            match advanced {
                Ok(Some(task)) => self.persist_task_logged(task).await,
                Ok(None) => break,
                Err(error) => {
                    tracing::error!(
                        task = task_id.0,
                        kind = ?error.kind,
                        message = %error.message,
                        "failed to advance task cursor"
                    );
                    break;
                }
            }

            if index + 1 < total {
                tokio::time::sleep(record.delay).await;
            }
        }
        self.finalize(task_id).await;
    }

    /// One send attempt. Failures are logged and tolerated; the loop keeps
    /// pacing through the remaining messages either way.
    async fn deliver(
        &self,
        session: &SessionId,
        target: &Target,
        text: &str,
        task_id: TaskId,
        index: usize,
    ) {
        let handle = match self.inner.sessions.read(session, |entry| entry.handle) {
            Ok(found) => found.flatten(),
            Err(error) => {
                tracing::error!(
                    task = task_id.0,
                    kind = ?error.kind,
                    message = %error.message,
                    "session registry read failed"
                );
                None
            }
        };
        let Some(handle) = handle else {
            tracing::warn!(
                task = task_id.0,
                session = %session,
                index,
                "no live provider handle, message skipped"
            );
            self.log_activity(
                ActivityLevel::Warn,
                Some(session.clone()),
                Some(task_id),
                format!("message {index} skipped: session has no live connection"),
            );
            return;
        };
        match self.inner.provider.send_message(&handle, target, text).await {
            Ok(()) => {
                self.log_activity(
                    ActivityLevel::Info,
                    Some(session.clone()),
                    Some(task_id),
                    format!("message {index} sent to {}", target.address),
                );
            }
            Err(error) => {
                tracing::warn!(
                    task = task_id.0,
                    session = %session,
                    index,
                    error = %error,
                    "message send failed"
                );
                self.log_activity(
                    ActivityLevel::Warn,
                    Some(session.clone()),
                    Some(task_id),
                    format!("message {index} send failed: {error}"),
                );
            }
        }
    }

    /// Mark the task terminal, wake waiters, and schedule registry eviction
    /// after the grace window so late status queries still resolve.
    async fn finalize(&self, task_id: TaskId) {
        let finished = self.inner.tasks.update(&task_id, |task| {
            task.state = TaskState::Completed;
            task.ended_at = Some(SystemTime::now());
            task.clone()
        });
        match finished {
            Ok(Some(task)) => {
                self.persist_task_logged(task.clone()).await;
                tracing::info!(
                    task = task_id.0,
                    sent = task.sent_count,
                    total = task.total_messages(),
                    "dispatch task completed"
                );
                let note = format!(
                    "task completed after {} of {} messages",
                    task.sent_count,
                    task.total_messages()
                );
                self.log_activity(ActivityLevel::Info, Some(task.session), Some(task_id), note);
            }
            Ok(None) => {}
            Err(error) => {
                tracing::error!(
                    task = task_id.0,
                    kind = ?error.kind,
                    message = %error.message,
                    "failed to finalize task"
                );
            }
        }

        let notify = {
            let mut state = self.inner.state.lock().await;
            state.loop_handles.remove(&task_id);
            state.completion_notifiers.get(&task_id).cloned()
        };
        if let Some(notify) = notify {
            notify.notify_waiters();
        }
        self.schedule_eviction(task_id).await;
    }

    async fn schedule_eviction(&self, task_id: TaskId) {
        let engine = self.clone();
        let grace = self.inner.config.eviction_grace;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Err(error) = engine.inner.tasks.remove(&task_id) {
                tracing::error!(
                    task = task_id.0,
                    kind = ?error.kind,
                    message = %error.message,
                    "failed to evict completed task"
                );
            }
            engine.remove_task_snapshot(task_id).await;
            engine.forget_task(task_id).await;
        })
        .abort_handle();
        // Reuse the loop handle slot so shutdown aborts pending evictions.
        let mut state = self.inner.state.lock().await;
        state.loop_handles.insert(task_id, handle);
    }

    async fn forget_task(&self, task_id: TaskId) {
        let mut state = self.inner.state.lock().await;
        state.loop_handles.remove(&task_id);
        state.completion_notifiers.remove(&task_id);
    }

    async fn persist_task(&self, record: TaskRecord) -> DispatchResult<()> {
        let Some(store) = self.inner.store.clone() else {
            return Ok(());
        };
        let task_id = record.id;
        tokio::task::spawn_blocking(move || store.save_task(&record))
            .await
            .map_err(|join_error| CoreError {
                session: None,
                task: Some(task_id),
                kind: CoreErrorKind::Internal,
                message: format!("task persistence join failure: {join_error}"),
            })?
    }

    async fn persist_task_logged(&self, record: TaskRecord) {
        let task_id = record.id;
        if let Err(error) = self.persist_task(record).await {
            tracing::error!(
                task = task_id.0,
                kind = ?error.kind,
                message = %error.message,
                "failed to persist task snapshot"
            );
        }
    }

    async fn remove_task_snapshot(&self, task_id: TaskId) {
        let Some(store) = self.inner.store.clone() else {
            return;
        };
        let outcome = tokio::task::spawn_blocking(move || store.remove_task(task_id)).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::error!(
                    task = task_id.0,
                    kind = ?error.kind,
                    message = %error.message,
                    "failed to remove task snapshot"
                );
            }
            Err(join_error) => {
                tracing::error!(
                    task = task_id.0,
                    message = %join_error,
                    "task snapshot removal join failure"
                );
            }
        }
    }

    fn log_activity(
        &self,
        level: ActivityLevel,
        session: Option<SessionId>,
        task: Option<TaskId>,
        message: impl Into<String>,
    ) {
        let Some(store) = self.inner.activity.clone() else {
            return;
        };
        let record = NewActivityRecord::now(level, session, task, message);
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

fn unknown_task(task_id: TaskId) -> CoreError {
    CoreError {
        session: None,
        task: Some(task_id),
        kind: CoreErrorKind::UnknownTask,
        message: format!("no task registered for id '{}'", task_id.0),
    }
}
