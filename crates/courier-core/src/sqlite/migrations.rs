#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_core_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS session_snapshots (
    session_id TEXT PRIMARY KEY,
    phone_number TEXT NOT NULL,
    state TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_connected_at_unix INTEGER
);

CREATE TABLE IF NOT EXISTS task_snapshots (
    task_id INTEGER PRIMARY KEY,
    session_id TEXT NOT NULL,
    target_kind TEXT NOT NULL,
    target_address TEXT NOT NULL,
    messages_json TEXT NOT NULL,
    prefix TEXT,
    delay_ms INTEGER NOT NULL,
    sent_count INTEGER NOT NULL DEFAULT 0,
    state TEXT NOT NULL,
    started_at_unix INTEGER,
    last_sent_at_unix INTEGER,
    ended_at_unix INTEGER
);

CREATE TABLE IF NOT EXISTS activity_log (
    entry_id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT,
    task_id INTEGER,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at_unix INTEGER NOT NULL
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS activity_log;
DROP TABLE IF EXISTS task_snapshots;
DROP TABLE IF EXISTS session_snapshots;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_activity_log_indexes",
    up_sql: r#"
CREATE INDEX IF NOT EXISTS idx_activity_log_session
    ON activity_log (session_id, entry_id DESC);

CREATE INDEX IF NOT EXISTS idx_task_snapshots_session
    ON task_snapshots (session_id);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_task_snapshots_session;
DROP INDEX IF EXISTS idx_activity_log_session;
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}
