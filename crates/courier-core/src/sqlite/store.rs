use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, params};

use crate::models::{
    ActivityLevel, ActivityRecord, CoreError, CoreErrorKind, NewActivityRecord, SessionId,
    SessionSnapshot, SessionState, Target, TargetKind, TaskId, TaskRecord, TaskState,
};
use crate::persistence::{
    ActivityLogStore, MigrationStore, PersistenceResult, SessionStore, TaskStore,
};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "courier_schema_migrations";

/// How many activity entries are retained before the oldest are evicted.
pub const DEFAULT_ACTIVITY_CAP: u64 = 1000;

pub struct SqliteStore {
    database_path: PathBuf,
    activity_cap: u64,
}

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
            activity_cap: DEFAULT_ACTIVITY_CAP,
        }
    }

    pub fn with_activity_cap(database_path: impl Into<PathBuf>, activity_cap: u64) -> Self {
        Self {
            database_path: database_path.into(),
            activity_cap: activity_cap.max(1),
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn activity_cap(&self) -> u64 {
        self.activity_cap
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }
}

impl MigrationStore for SqliteStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        if target_version > 0 && migration(target_version).is_none() {
            return Err(storage_error_text(
                "apply_migration",
                format!("migration version '{target_version}' is not defined"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version == current_version {
                // Re-apply all DDL to handle corrupted state where migration
                // version was recorded but tables are missing. All DDL uses
                // CREATE TABLE/INDEX IF NOT EXISTS, so this is idempotent.
                for version in 1..=target_version {
                    let m = migration(version).expect("validated migration version must exist");
                    execute_batch_tolerant(connection, m.up_sql)?;
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    let migration =
                        migration(version).expect("validated migration version must exist");
                    apply_up_migration(connection, migration)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    let migration =
                        migration(version).expect("validated migration version must exist");
                    apply_down_migration(connection, migration)?;
                }
            }

            Ok(())
        })
    }
}

impl SessionStore for SqliteStore {
    fn save_session(&self, snapshot: &SessionSnapshot) -> PersistenceResult<()> {
        self.with_connection("save_session", |connection| {
            ensure_schema_ready(connection)?;
            let last_connected = snapshot
                .last_connected_at
                .map(to_unix_seconds)
                .transpose()?;
            connection.execute(
                "
INSERT INTO session_snapshots (
    session_id, phone_number, state, retry_count, last_connected_at_unix
) VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(session_id) DO UPDATE SET
    phone_number = excluded.phone_number,
    state = excluded.state,
    retry_count = excluded.retry_count,
    last_connected_at_unix = excluded.last_connected_at_unix
",
                params![
                    snapshot.id.as_str(),
                    snapshot.phone_number.as_str(),
                    session_state_to_str(snapshot.state),
                    i64::from(snapshot.retry_count),
                    last_connected,
                ],
            )?;
            Ok(())
        })
    }

    fn remove_session(&self, id: &SessionId) -> PersistenceResult<()> {
        self.with_connection("remove_session", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "DELETE FROM session_snapshots WHERE session_id = ?1",
                [id.as_str()],
            )?;
            Ok(())
        })
    }

    fn list_sessions(&self) -> PersistenceResult<Vec<SessionSnapshot>> {
        self.with_connection("list_sessions", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT session_id, phone_number, state, retry_count, last_connected_at_unix
FROM session_snapshots
ORDER BY session_id
",
            )?;

            let rows = statement.query_map([], |row| {
                let session_id: String = row.get(0)?;
                let phone_number: String = row.get(1)?;
                let state_raw: String = row.get(2)?;
                let retry_count: i64 = row.get(3)?;
                let last_connected: Option<i64> = row.get(4)?;

                Ok(SessionSnapshot {
                    id: SessionId(session_id),
                    phone_number,
                    state: parse_session_state(&state_raw)?,
                    retry_count: u32::try_from(retry_count).map_err(|_| {
                        storage_error_sqlite("negative retry count in sqlite record")
                    })?,
                    last_connected_at: last_connected.map(from_unix_seconds).transpose()?,
                })
            })?;

            rows.collect()
        })
    }
}

impl TaskStore for SqliteStore {
    fn save_task(&self, record: &TaskRecord) -> PersistenceResult<()> {
        self.with_connection("save_task", |connection| {
            ensure_schema_ready(connection)?;
            let messages_json = serde_json::to_string(&record.messages)
                .map_err(|error| storage_error_sqlite(&format!("message encoding: {error}")))?;
            connection.execute(
                "
INSERT INTO task_snapshots (
    task_id, session_id, target_kind, target_address, messages_json, prefix,
    delay_ms, sent_count, state, started_at_unix, last_sent_at_unix, ended_at_unix
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
ON CONFLICT(task_id) DO UPDATE SET
    session_id = excluded.session_id,
    target_kind = excluded.target_kind,
    target_address = excluded.target_address,
    messages_json = excluded.messages_json,
    prefix = excluded.prefix,
    delay_ms = excluded.delay_ms,
    sent_count = excluded.sent_count,
    state = excluded.state,
    started_at_unix = excluded.started_at_unix,
    last_sent_at_unix = excluded.last_sent_at_unix,
    ended_at_unix = excluded.ended_at_unix
",
                params![
                    task_id_to_i64(record.id)?,
                    record.session.as_str(),
                    target_kind_to_str(record.target.kind),
                    record.target.address.as_str(),
                    messages_json,
                    record.prefix.as_deref(),
                    duration_to_millis(record.delay)?,
                    to_i64(record.sent_count)?,
                    task_state_to_str(record.state),
                    record.started_at.map(to_unix_seconds).transpose()?,
                    record.last_sent_at.map(to_unix_seconds).transpose()?,
                    record.ended_at.map(to_unix_seconds).transpose()?,
                ],
            )?;
            Ok(())
        })
    }

    fn remove_task(&self, id: TaskId) -> PersistenceResult<()> {
        self.with_connection("remove_task", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "DELETE FROM task_snapshots WHERE task_id = ?1",
                [task_id_to_i64(id)?],
            )?;
            Ok(())
        })
    }

    fn list_tasks(&self) -> PersistenceResult<Vec<TaskRecord>> {
        self.with_connection("list_tasks", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT task_id, session_id, target_kind, target_address, messages_json, prefix,
       delay_ms, sent_count, state, started_at_unix, last_sent_at_unix, ended_at_unix
FROM task_snapshots
ORDER BY task_id
",
            )?;

            let rows = statement.query_map([], |row| {
                let task_id: i64 = row.get(0)?;
                let session_id: String = row.get(1)?;
                let kind_raw: String = row.get(2)?;
                let address: String = row.get(3)?;
                let messages_json: String = row.get(4)?;
                let prefix: Option<String> = row.get(5)?;
                let delay_ms: i64 = row.get(6)?;
                let sent_count: i64 = row.get(7)?;
                let state_raw: String = row.get(8)?;
                let started_at: Option<i64> = row.get(9)?;
                let last_sent_at: Option<i64> = row.get(10)?;
                let ended_at: Option<i64> = row.get(11)?;

                let messages: Vec<String> = serde_json::from_str(&messages_json).map_err(
                    |error| storage_error_sqlite(&format!("message decoding: {error}")),
                )?;

                Ok(TaskRecord {
                    id: TaskId(i64_to_u64(task_id)?),
                    session: SessionId(session_id),
                    target: Target {
                        kind: parse_target_kind(&kind_raw)?,
                        address,
                    },
                    messages,
                    prefix,
                    delay: millis_to_duration(delay_ms)?,
                    sent_count: usize::try_from(sent_count).map_err(|_| {
                        storage_error_sqlite("negative sent count in sqlite record")
                    })?,
                    state: parse_task_state(&state_raw)?,
                    started_at: started_at.map(from_unix_seconds).transpose()?,
                    last_sent_at: last_sent_at.map(from_unix_seconds).transpose()?,
                    ended_at: ended_at.map(from_unix_seconds).transpose()?,
                })
            })?;

            rows.collect()
        })
    }

    fn next_task_id(&self) -> PersistenceResult<u64> {
        self.with_connection("next_task_id", |connection| {
            ensure_schema_ready(connection)?;
            let highest: i64 = connection.query_row(
                "SELECT COALESCE(MAX(task_id), -1) FROM task_snapshots",
                [],
                |row| row.get(0),
            )?;
            if highest < 0 {
                return Ok(0);
            }
            Ok(i64_to_u64(highest)? + 1)
        })
    }
}

impl ActivityLogStore for SqliteStore {
    fn append(&self, record: &NewActivityRecord) -> PersistenceResult<()> {
        self.with_connection("append_activity", |connection| {
            ensure_schema_ready(connection)?;
            let transaction = connection.transaction()?;

            transaction.execute(
                "
INSERT INTO activity_log (session_id, task_id, level, message, created_at_unix)
VALUES (?1, ?2, ?3, ?4, ?5)
",
                params![
                    record.session.as_ref().map(SessionId::as_str),
                    record.task.map(task_id_to_i64).transpose()?,
                    activity_level_to_str(record.level),
                    record.message.as_str(),
                    to_unix_seconds(record.created_at)?,
                ],
            )?;

            // FIFO cap: keep the newest `activity_cap` entries.
            transaction.execute(
                "
DELETE FROM activity_log
WHERE entry_id NOT IN (
    SELECT entry_id FROM activity_log ORDER BY entry_id DESC LIMIT ?1
)
",
                [cap_to_i64(self.activity_cap)?],
            )?;

            transaction.commit()?;
            Ok(())
        })
    }

    fn recent(&self, limit: usize) -> PersistenceResult<Vec<ActivityRecord>> {
        self.with_connection("recent_activity", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT entry_id, session_id, task_id, level, message, created_at_unix
FROM activity_log
ORDER BY entry_id DESC
LIMIT ?1
",
            )?;

            let rows = statement.query_map([to_i64(limit)?], |row| {
                let entry_id: i64 = row.get(0)?;
                let session_id: Option<String> = row.get(1)?;
                let task_id: Option<i64> = row.get(2)?;
                let level_raw: String = row.get(3)?;
                let message: String = row.get(4)?;
                let created_at: i64 = row.get(5)?;

                Ok(ActivityRecord {
                    id: i64_to_u64(entry_id)?,
                    session: session_id.map(SessionId),
                    task: task_id.map(i64_to_u64).transpose()?.map(TaskId),
                    level: parse_activity_level(&level_raw)?,
                    message,
                    created_at: from_unix_seconds(created_at)?,
                })
            })?;

            rows.collect()
        })
    }

    fn entry_count(&self) -> PersistenceResult<u64> {
        self.with_connection("activity_entry_count", |connection| {
            ensure_schema_ready(connection)?;
            let count: i64 =
                connection.query_row("SELECT COUNT(*) FROM activity_log", [], |row| row.get(0))?;
            i64_to_u64(count)
        })
    }
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    Connection::open(database_path)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(
        "
CREATE TABLE IF NOT EXISTS courier_schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
",
    )?;
    Ok(())
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version <= 0 {
        return Err(storage_error_sqlite(
            "database schema is not initialized; apply migrations before store operations",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    execute_batch_tolerant(&transaction, migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()?;
    Ok(())
}

/// Execute a SQL batch, tolerating "duplicate column name" errors from
/// `ALTER TABLE ADD COLUMN` which is not idempotent in SQLite.
fn execute_batch_tolerant(connection: &Connection, sql: &str) -> rusqlite::Result<()> {
    match connection.execute_batch(sql) {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("duplicate column name") => Ok(()),
        Err(e) => Err(e),
    }
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()?;
    Ok(())
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    storage_error_text(operation, error.to_string())
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn session_state_to_str(state: SessionState) -> &'static str {
    match state {
        SessionState::Initializing => "initializing",
        SessionState::Connected => "connected",
        SessionState::Disconnected => "disconnected",
        SessionState::LoggedOut => "logged_out",
    }
}

fn parse_session_state(raw: &str) -> rusqlite::Result<SessionState> {
    match raw {
        "initializing" => Ok(SessionState::Initializing),
        "connected" => Ok(SessionState::Connected),
        "disconnected" => Ok(SessionState::Disconnected),
        "logged_out" => Ok(SessionState::LoggedOut),
        _ => Err(storage_error_sqlite(&format!(
            "unknown session state '{raw}' in sqlite record"
        ))),
    }
}

fn target_kind_to_str(kind: TargetKind) -> &'static str {
    match kind {
        TargetKind::Direct => "direct",
        TargetKind::Group => "group",
    }
}

fn parse_target_kind(raw: &str) -> rusqlite::Result<TargetKind> {
    match raw {
        "direct" => Ok(TargetKind::Direct),
        "group" => Ok(TargetKind::Group),
        _ => Err(storage_error_sqlite(&format!(
            "unknown target kind '{raw}' in sqlite record"
        ))),
    }
}

fn task_state_to_str(state: TaskState) -> &'static str {
    match state {
        TaskState::Running => "running",
        TaskState::StopRequested => "stop_requested",
        TaskState::Completed => "completed",
    }
}

fn parse_task_state(raw: &str) -> rusqlite::Result<TaskState> {
    match raw {
        "running" => Ok(TaskState::Running),
        "stop_requested" => Ok(TaskState::StopRequested),
        "completed" => Ok(TaskState::Completed),
        _ => Err(storage_error_sqlite(&format!(
            "unknown task state '{raw}' in sqlite record"
        ))),
    }
}

fn activity_level_to_str(level: ActivityLevel) -> &'static str {
    match level {
        ActivityLevel::Info => "info",
        ActivityLevel::Warn => "warn",
        ActivityLevel::Error => "error",
    }
}

fn parse_activity_level(raw: &str) -> rusqlite::Result<ActivityLevel> {
    match raw {
        "info" => Ok(ActivityLevel::Info),
        "warn" => Ok(ActivityLevel::Warn),
        "error" => Ok(ActivityLevel::Error),
        _ => Err(storage_error_sqlite(&format!(
            "unknown activity level '{raw}' in sqlite record"
        ))),
    }
}

fn to_unix_seconds(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
    })?;
    let seconds = i64::try_from(duration.as_secs())
        .map_err(|_| storage_error_sqlite("unix timestamp seconds exceed i64 range"))?;
    Ok(seconds)
}

fn from_unix_seconds(value: i64) -> rusqlite::Result<SystemTime> {
    if value < 0 {
        return Err(storage_error_sqlite(
            "negative unix timestamps are not supported",
        ));
    }
    let seconds = u64::try_from(value)
        .map_err(|_| storage_error_sqlite("failed to convert unix timestamp to u64"))?;
    Ok(UNIX_EPOCH + Duration::from_secs(seconds))
}

fn duration_to_millis(value: Duration) -> rusqlite::Result<i64> {
    i64::try_from(value.as_millis())
        .map_err(|_| storage_error_sqlite("delay milliseconds exceed i64 range"))
}

fn millis_to_duration(value: i64) -> rusqlite::Result<Duration> {
    let millis = u64::try_from(value)
        .map_err(|_| storage_error_sqlite("negative delay in sqlite record"))?;
    Ok(Duration::from_millis(millis))
}

fn task_id_to_i64(value: TaskId) -> rusqlite::Result<i64> {
    i64::try_from(value.0).map_err(|_| storage_error_sqlite("task id exceeds i64 range"))
}

fn i64_to_u64(value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| storage_error_sqlite("negative value in sqlite record"))
}

fn to_i64(value: usize) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("value exceeds i64 range"))
}

fn cap_to_i64(value: u64) -> rusqlite::Result<i64> {
    i64::try_from(value).map_err(|_| storage_error_sqlite("activity cap exceeds i64 range"))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError {
        session: None,
        task: None,
        kind: CoreErrorKind::StorageFailure,
        message: format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    }
}
