use crate::models::{
    ActivityRecord, CoreError, NewActivityRecord, SessionId, SessionSnapshot, TaskId, TaskRecord,
};

pub type PersistenceResult<T> = Result<T, CoreError>;

pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}

pub trait SessionStore: Send + Sync {
    fn save_session(&self, snapshot: &SessionSnapshot) -> PersistenceResult<()>;

    fn remove_session(&self, id: &SessionId) -> PersistenceResult<()>;

    fn list_sessions(&self) -> PersistenceResult<Vec<SessionSnapshot>>;
}

pub trait TaskStore: Send + Sync {
    fn save_task(&self, record: &TaskRecord) -> PersistenceResult<()>;

    fn remove_task(&self, id: TaskId) -> PersistenceResult<()>;

    fn list_tasks(&self) -> PersistenceResult<Vec<TaskRecord>>;

    fn next_task_id(&self) -> PersistenceResult<u64>;
}

/// Append-only, size-capped activity sink. Appending beyond the cap evicts
/// the oldest entries first.
pub trait ActivityLogStore: Send + Sync {
    fn append(&self, record: &NewActivityRecord) -> PersistenceResult<()>;

    fn recent(&self, limit: usize) -> PersistenceResult<Vec<ActivityRecord>>;

    fn entry_count(&self) -> PersistenceResult<u64>;
}
