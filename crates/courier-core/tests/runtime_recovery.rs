use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use courier_core::dispatch::{DispatchConfig, TaskRequest};
use courier_core::lifecycle::LifecycleConfig;
use courier_core::models::{
    SessionId, SessionSnapshot, SessionState, Target, TargetKind, TaskId, TaskRecord, TaskState,
};
use courier_core::persistence::{SessionStore, TaskStore};
use courier_core::provider::{ProviderEvent, ScriptedProvider};
use courier_core::runtime::{CourierConfig, CourierRuntime};
use courier_core::sqlite::SqliteStore;

fn test_db_path(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("courier-{test_name}-{nanos}.sqlite3"))
}

fn fast_config() -> CourierConfig {
    CourierConfig {
        lifecycle: LifecycleConfig {
            reconnect_delay: Duration::from_millis(20),
            ..LifecycleConfig::default()
        },
        dispatch: DispatchConfig::default(),
    }
}

#[tokio::test]
async fn a_running_task_resumes_from_its_persisted_cursor() {
    let path = test_db_path("resume-cursor");
    let store = Arc::new(SqliteStore::new(&path));

    let provider_before = Arc::new(ScriptedProvider::new());
    let runtime_before = CourierRuntime::with_store(
        provider_before.clone(),
        fast_config(),
        store.clone(),
    );
    runtime_before.restore().await.unwrap();

    let id = SessionId::from("alpha");
    runtime_before
        .create_session(id.clone(), "+15550001")
        .await
        .unwrap();
    runtime_before
        .handle_connection_event(&id, ProviderEvent::Opened)
        .await
        .unwrap();

    let messages: Vec<String> = (0..6).map(|n| format!("message-{n}")).collect();
    let task_id = runtime_before
        .start_task(TaskRequest {
            session: id.clone(),
            target: Target {
                kind: TargetKind::Direct,
                address: "+15559999".to_string(),
            },
            messages: messages.clone(),
            prefix: None,
            delay: Duration::from_millis(40),
        })
        .await
        .unwrap();

    // Let the loop make some progress, then drop the whole process state.
    for _ in 0..200 {
        let persisted = store.list_tasks().unwrap();
        if persisted.first().map(|t| t.sent_count).unwrap_or(0) >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    runtime_before.shutdown().await;

    let cursor = store.list_tasks().unwrap()[0].sent_count;
    assert!(cursor >= 2 && cursor < 6, "unexpected cursor {cursor}");

    let provider_after = Arc::new(ScriptedProvider::new());
    let runtime_after =
        CourierRuntime::with_store(provider_after.clone(), fast_config(), store.clone());
    let summary = runtime_after.restore().await.unwrap();

    assert_eq!(summary.sessions_restored, 1);
    assert_eq!(summary.tasks_resumed, 1);

    let record = runtime_after
        .wait_for_task(task_id, Some(Duration::from_secs(3)))
        .await
        .unwrap();
    assert_eq!(record.state, TaskState::Completed);
    assert_eq!(record.sent_count, 6);

    // Only the unsent tail goes out after the restart, in order.
    assert_eq!(provider_after.sent_texts(), messages[cursor..].to_vec());

    runtime_after.shutdown().await;
}

#[tokio::test]
async fn restore_prunes_and_finalizes_stale_state() {
    let path = test_db_path("restore-pruning");
    let store = Arc::new(SqliteStore::new(&path));
    store.migrate_to_latest().unwrap();

    // A session that was mid-reconnect when the process died.
    store
        .save_session(&SessionSnapshot {
            id: SessionId::from("stale"),
            phone_number: "+15550009".to_string(),
            state: SessionState::Disconnected,
            retry_count: 4,
            last_connected_at: None,
        })
        .unwrap();

    let base_task = TaskRecord {
        id: TaskId(1),
        session: SessionId::from("stale"),
        target: Target {
            kind: TargetKind::Direct,
            address: "+15559999".to_string(),
        },
        messages: vec!["a".to_string(), "b".to_string()],
        prefix: None,
        delay: Duration::from_millis(10),
        sent_count: 1,
        state: TaskState::StopRequested,
        started_at: None,
        last_sent_at: None,
        ended_at: None,
    };
    store.save_task(&base_task).unwrap();

    let mut orphan = base_task.clone();
    orphan.id = TaskId(2);
    orphan.state = TaskState::Running;
    store.save_task(&orphan).unwrap();

    let mut leftover = base_task.clone();
    leftover.id = TaskId(3);
    leftover.state = TaskState::Completed;
    store.save_task(&leftover).unwrap();

    let provider = Arc::new(ScriptedProvider::new());
    let runtime = CourierRuntime::with_store(provider, fast_config(), store.clone());
    let summary = runtime.restore().await.unwrap();

    assert_eq!(summary.sessions_restored, 0);
    assert_eq!(summary.sessions_pruned, 1);
    // The running task's session no longer exists, so it is discarded
    // along with the completed leftover.
    assert_eq!(summary.tasks_resumed, 0);
    assert_eq!(summary.tasks_finalized, 1);
    assert_eq!(summary.tasks_discarded, 2);

    assert!(store.list_sessions().unwrap().is_empty());
    let remaining = store.list_tasks().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, TaskId(1));
    assert_eq!(remaining[0].state, TaskState::Completed);
    assert!(remaining[0].ended_at.is_some());
}

#[tokio::test]
async fn fresh_task_ids_do_not_collide_with_persisted_ones() {
    let path = test_db_path("task-id-seed");
    let store = Arc::new(SqliteStore::new(&path));
    store.migrate_to_latest().unwrap();

    store
        .save_task(&TaskRecord {
            id: TaskId(9),
            session: SessionId::from("alpha"),
            target: Target {
                kind: TargetKind::Direct,
                address: "+15559999".to_string(),
            },
            messages: vec!["old".to_string()],
            prefix: None,
            delay: Duration::from_millis(10),
            sent_count: 1,
            state: TaskState::Completed,
            started_at: None,
            last_sent_at: None,
            ended_at: None,
        })
        .unwrap();

    let provider = Arc::new(ScriptedProvider::new());
    let runtime = CourierRuntime::with_store(provider, fast_config(), store.clone());

    let id = SessionId::from("alpha");
    runtime.create_session(id.clone(), "+15550001").await.unwrap();
    runtime
        .handle_connection_event(&id, ProviderEvent::Opened)
        .await
        .unwrap();

    let task_id = runtime
        .start_task(TaskRequest {
            session: id,
            target: Target {
                kind: TargetKind::Direct,
                address: "+15559999".to_string(),
            },
            messages: vec!["new".to_string()],
            prefix: None,
            delay: Duration::from_millis(5),
        })
        .await
        .unwrap();

    assert!(task_id.0 >= 10, "task id {} collides with persisted ids", task_id.0);
    runtime.shutdown().await;
}
