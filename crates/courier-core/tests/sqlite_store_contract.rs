use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use courier_core::models::{
    ActivityLevel, NewActivityRecord, SessionId, SessionSnapshot, SessionState, Target,
    TargetKind, TaskId, TaskRecord, TaskState,
};
use courier_core::persistence::{ActivityLogStore, MigrationStore, SessionStore, TaskStore};
use courier_core::sqlite::{SqliteStore, current_schema_version, migration, migrations};

fn test_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("courier-{test_name}-{nanos}.sqlite3"))
}

fn whole_seconds(value: SystemTime) -> SystemTime {
    let secs = value
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs();
    UNIX_EPOCH + Duration::from_secs(secs)
}

#[test]
fn migration_versions_are_strictly_increasing() {
    let entries = migrations();
    assert!(!entries.is_empty());

    let mut previous = 0;
    for entry in entries {
        assert!(entry.version > previous);
        previous = entry.version;
    }
}

#[test]
fn migration_lookup_and_schema_version_are_consistent() {
    let latest = current_schema_version();
    let latest_entry = migration(latest).expect("latest migration must exist");
    assert_eq!(latest_entry.version, latest);
}

#[test]
fn migrate_up_then_down_round_trips_the_version() {
    let store = SqliteStore::new(test_db_path("migration-round-trip"));
    assert_eq!(store.current_version().unwrap(), 0);

    store.migrate_to_latest().unwrap();
    assert_eq!(store.current_version().unwrap(), current_schema_version());

    store.apply_migration(0).unwrap();
    assert_eq!(store.current_version().unwrap(), 0);
}

#[test]
fn operations_before_migration_fail_with_storage_error() {
    let store = SqliteStore::new(test_db_path("unmigrated"));
    let error = store.list_sessions().unwrap_err();
    assert_eq!(
        error.kind,
        courier_core::models::CoreErrorKind::StorageFailure
    );
}

#[test]
fn session_snapshots_round_trip() {
    let store = SqliteStore::new(test_db_path("session-round-trip"));
    store.migrate_to_latest().unwrap();

    let snapshot = SessionSnapshot {
        id: SessionId::from("alpha"),
        phone_number: "+15550001".to_string(),
        state: SessionState::Connected,
        retry_count: 2,
        last_connected_at: Some(whole_seconds(SystemTime::now())),
    };
    store.save_session(&snapshot).unwrap();

    let listed = store.list_sessions().unwrap();
    assert_eq!(listed, vec![snapshot.clone()]);

    // Upsert replaces rather than duplicates.
    let mut updated = snapshot;
    updated.state = SessionState::Disconnected;
    updated.retry_count = 3;
    store.save_session(&updated).unwrap();
    assert_eq!(store.list_sessions().unwrap(), vec![updated]);

    store.remove_session(&SessionId::from("alpha")).unwrap();
    assert!(store.list_sessions().unwrap().is_empty());
}

#[test]
fn task_records_round_trip_with_every_field() {
    let store = SqliteStore::new(test_db_path("task-round-trip"));
    store.migrate_to_latest().unwrap();

    let record = TaskRecord {
        id: TaskId(7),
        session: SessionId::from("alpha"),
        target: Target {
            kind: TargetKind::Group,
            address: "group-42".to_string(),
        },
        messages: vec!["first".to_string(), "second, with commas".to_string()],
        prefix: Some("[promo]".to_string()),
        delay: Duration::from_millis(1500),
        sent_count: 1,
        state: TaskState::StopRequested,
        started_at: Some(whole_seconds(SystemTime::now())),
        last_sent_at: Some(whole_seconds(SystemTime::now())),
        ended_at: None,
    };
    store.save_task(&record).unwrap();

    assert_eq!(store.list_tasks().unwrap(), vec![record.clone()]);

    store.remove_task(TaskId(7)).unwrap();
    assert!(store.list_tasks().unwrap().is_empty());
}

#[test]
fn next_task_id_continues_after_the_highest_persisted_id() {
    let store = SqliteStore::new(test_db_path("next-task-id"));
    store.migrate_to_latest().unwrap();

    assert_eq!(store.next_task_id().unwrap(), 0);

    let record = TaskRecord {
        id: TaskId(11),
        session: SessionId::from("alpha"),
        target: Target {
            kind: TargetKind::Direct,
            address: "+15559999".to_string(),
        },
        messages: vec!["hello".to_string()],
        prefix: None,
        delay: Duration::from_millis(100),
        sent_count: 0,
        state: TaskState::Running,
        started_at: None,
        last_sent_at: None,
        ended_at: None,
    };
    store.save_task(&record).unwrap();

    assert_eq!(store.next_task_id().unwrap(), 12);
}

#[test]
fn activity_log_is_capped_fifo() {
    let store = SqliteStore::with_activity_cap(test_db_path("activity-cap"), 5);
    store.migrate_to_latest().unwrap();

    for n in 0..8 {
        store
            .append(&NewActivityRecord::now(
                ActivityLevel::Info,
                Some(SessionId::from("alpha")),
                None,
                format!("entry-{n}"),
            ))
            .unwrap();
    }

    assert_eq!(store.entry_count().unwrap(), 5);

    let recent = store.recent(10).unwrap();
    assert_eq!(recent.len(), 5);
    // Newest first, oldest three evicted.
    assert_eq!(recent[0].message, "entry-7");
    assert_eq!(recent[4].message, "entry-3");
}

#[test]
fn activity_records_keep_their_attribution() {
    let store = SqliteStore::new(test_db_path("activity-attribution"));
    store.migrate_to_latest().unwrap();

    store
        .append(&NewActivityRecord::now(
            ActivityLevel::Warn,
            Some(SessionId::from("alpha")),
            Some(TaskId(3)),
            "message 2 send failed",
        ))
        .unwrap();

    let recent = store.recent(1).unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].level, ActivityLevel::Warn);
    assert_eq!(recent[0].session, Some(SessionId::from("alpha")));
    assert_eq!(recent[0].task, Some(TaskId(3)));
    assert_eq!(recent[0].message, "message 2 send failed");
}
