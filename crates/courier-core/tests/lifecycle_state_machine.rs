use std::sync::Arc;
use std::time::Duration;

use courier_core::lifecycle::{KeepAlive, LifecycleConfig, SessionLifecycleManager};
use courier_core::models::{CoreErrorKind, SessionId, SessionState};
use courier_core::provider::{
    CloseCode, PairingOutcome, ProviderError, ProviderEvent, ScriptedProvider,
};
use courier_core::registry::SessionRegistry;

fn fast_config() -> LifecycleConfig {
    LifecycleConfig {
        reconnect_delay: Duration::from_millis(20),
        max_retries: 5,
        keep_alive_interval: Duration::from_millis(25),
    }
}

fn manager_with(
    provider: Arc<ScriptedProvider>,
    config: LifecycleConfig,
) -> (SessionLifecycleManager, SessionRegistry) {
    let sessions = SessionRegistry::new();
    let manager = SessionLifecycleManager::new(provider, sessions.clone(), config);
    (manager, sessions)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within the polling budget");
}

#[tokio::test]
async fn create_session_registers_an_initializing_entry() {
    let provider = Arc::new(ScriptedProvider::new());
    let (manager, _) = manager_with(provider, fast_config());

    let session = manager
        .create_session(SessionId::from("alpha"), "+15550001")
        .await
        .unwrap();

    assert_eq!(session.state, SessionState::Initializing);
    assert!(session.handle.is_some());
    assert_eq!(session.retry_count, 0);
}

#[tokio::test]
async fn empty_phone_number_is_rejected() {
    let provider = Arc::new(ScriptedProvider::new());
    let (manager, _) = manager_with(provider, fast_config());

    let error = manager
        .create_session(SessionId::from("alpha"), "   ")
        .await
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::InvalidInput);
}

#[tokio::test]
async fn open_failure_on_a_fresh_session_surfaces_provider_init() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.script_open(Err(ProviderError::Transport("dns failure".to_string())));
    let (manager, sessions) = manager_with(provider, fast_config());

    let error = manager
        .create_session(SessionId::from("alpha"), "+15550001")
        .await
        .unwrap_err();

    assert_eq!(error.kind, CoreErrorKind::ProviderInit);
    assert!(sessions.is_empty().unwrap());
}

#[tokio::test]
async fn opened_event_connects_and_resets_the_retry_budget() {
    let provider = Arc::new(ScriptedProvider::new());
    let (manager, sessions) = manager_with(provider, fast_config());
    let id = SessionId::from("alpha");

    manager.create_session(id.clone(), "+15550001").await.unwrap();
    sessions
        .update(&id, |session| session.retry_count = 3)
        .unwrap();

    manager
        .handle_connection_event(&id, ProviderEvent::Opened)
        .await
        .unwrap();

    let session = sessions.get(&id).unwrap().unwrap();
    assert_eq!(session.state, SessionState::Connected);
    assert_eq!(session.retry_count, 0);
    assert!(session.last_connected_at.is_some());
}

#[tokio::test]
async fn reconnectable_closure_disconnects_then_reconnects() {
    let provider = Arc::new(ScriptedProvider::new());
    let (manager, sessions) = manager_with(provider, fast_config());
    let id = SessionId::from("alpha");

    manager.create_session(id.clone(), "+15550001").await.unwrap();
    manager
        .handle_connection_event(&id, ProviderEvent::Opened)
        .await
        .unwrap();

    manager
        .handle_connection_event(&id, ProviderEvent::Closed(CloseCode::RESTART_REQUIRED))
        .await
        .unwrap();

    let session = sessions.get(&id).unwrap().unwrap();
    assert_eq!(session.state, SessionState::Disconnected);
    assert!(session.handle.is_none());
    assert!(manager.has_pending_reconnect(&id));

    // The reconnect timer fires, reopens the handle and bumps the counter.
    let probe = sessions.clone();
    let probe_id = id.clone();
    wait_until(move || {
        probe
            .read(&probe_id, |session| session.handle.is_some())
            .unwrap()
            .unwrap_or(false)
    })
    .await;

    let session = sessions.get(&id).unwrap().unwrap();
    assert_eq!(session.retry_count, 1);

    manager.shutdown();
}

#[tokio::test]
async fn terminal_closure_removes_the_session_and_cancels_reconnect() {
    let provider = Arc::new(ScriptedProvider::new());
    let (manager, sessions) = manager_with(provider, fast_config());
    let id = SessionId::from("alpha");

    manager.create_session(id.clone(), "+15550001").await.unwrap();
    manager
        .handle_connection_event(&id, ProviderEvent::Opened)
        .await
        .unwrap();

    manager
        .handle_connection_event(&id, ProviderEvent::Closed(CloseCode::LOGGED_OUT))
        .await
        .unwrap();

    assert!(sessions.get(&id).unwrap().is_none());
    assert!(!manager.has_pending_reconnect(&id));
}

#[tokio::test]
async fn events_for_unknown_sessions_are_ignored() {
    let provider = Arc::new(ScriptedProvider::new());
    let (manager, sessions) = manager_with(provider, fast_config());

    manager
        .handle_connection_event(&SessionId::from("ghost"), ProviderEvent::Opened)
        .await
        .unwrap();

    assert!(sessions.is_empty().unwrap());
}

#[tokio::test]
async fn reconnect_attempts_stop_at_the_configured_budget() {
    let provider = Arc::new(ScriptedProvider::new());
    let config = LifecycleConfig {
        max_retries: 2,
        ..fast_config()
    };
    let (manager, sessions) = manager_with(provider.clone(), config);
    let id = SessionId::from("alpha");

    manager.create_session(id.clone(), "+15550001").await.unwrap();
    manager
        .handle_connection_event(&id, ProviderEvent::Opened)
        .await
        .unwrap();

    // Every reopen attempt after the closure fails.
    provider.script_open(Err(ProviderError::Transport("down".to_string())));
    provider.script_open(Err(ProviderError::Transport("down".to_string())));
    manager
        .handle_connection_event(&id, ProviderEvent::Closed(CloseCode::SERVICE_UNAVAILABLE))
        .await
        .unwrap();

    let probe = sessions.clone();
    let probe_id = id.clone();
    wait_until(move || {
        probe
            .read(&probe_id, |session| session.retry_count)
            .unwrap()
            .unwrap_or(0)
            >= 2
    })
    .await;

    let retries_done = manager.clone();
    let timer_id = id.clone();
    wait_until(move || !retries_done.has_pending_reconnect(&timer_id)).await;

    // The budget is exhausted but the session is kept, not deleted.
    let session = sessions.get(&id).unwrap().unwrap();
    assert_eq!(session.state, SessionState::Disconnected);
    assert_eq!(session.retry_count, 2);

    manager.shutdown();
}

#[tokio::test]
async fn pairing_code_is_delegated_when_supported() {
    let provider = Arc::new(ScriptedProvider::new().with_pairing_code("ABCD-1234"));
    let (manager, _) = manager_with(provider, fast_config());
    let id = SessionId::from("alpha");

    manager.create_session(id.clone(), "+15550001").await.unwrap();

    let outcome = manager.request_pairing_code(&id, "+15550001").await.unwrap();
    assert_eq!(outcome, PairingOutcome::Supported("ABCD-1234".to_string()));
}

#[tokio::test]
async fn pairing_without_the_capability_yields_unsupported() {
    let provider = Arc::new(ScriptedProvider::new());
    let (manager, _) = manager_with(provider, fast_config());
    let id = SessionId::from("alpha");

    manager.create_session(id.clone(), "+15550001").await.unwrap();

    let outcome = manager.request_pairing_code(&id, "+15550001").await.unwrap();
    assert_eq!(outcome, PairingOutcome::Unsupported);
}

#[tokio::test]
async fn pairing_for_an_unknown_session_fails() {
    let provider = Arc::new(ScriptedProvider::new().with_pairing_code("ABCD-1234"));
    let (manager, _) = manager_with(provider, fast_config());

    let error = manager
        .request_pairing_code(&SessionId::from("ghost"), "+15550001")
        .await
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::NoActiveSession);
}

#[tokio::test]
async fn keep_alive_sends_presence_only_for_connected_sessions() {
    let provider = Arc::new(ScriptedProvider::new());
    let (manager, sessions) = manager_with(provider.clone(), fast_config());

    let connected = SessionId::from("alpha");
    manager
        .create_session(connected.clone(), "+15550001")
        .await
        .unwrap();
    manager
        .handle_connection_event(&connected, ProviderEvent::Opened)
        .await
        .unwrap();

    // Second session never connects; it must receive no presence traffic.
    manager
        .create_session(SessionId::from("beta"), "+15550002")
        .await
        .unwrap();

    let ticker = KeepAlive::spawn(
        provider.clone(),
        sessions.clone(),
        Duration::from_millis(25),
    );

    let counting = provider.clone();
    wait_until(move || counting.presence_update_count() >= 2).await;
    ticker.shutdown();

    let session = sessions.get(&connected).unwrap().unwrap();
    assert_eq!(session.state, SessionState::Connected);
}

#[tokio::test]
async fn presence_failures_never_change_session_state() {
    let provider = Arc::new(ScriptedProvider::new());
    let (manager, sessions) = manager_with(provider.clone(), fast_config());
    let id = SessionId::from("alpha");

    manager.create_session(id.clone(), "+15550001").await.unwrap();
    manager
        .handle_connection_event(&id, ProviderEvent::Opened)
        .await
        .unwrap();

    provider.script_presence(Err(ProviderError::Transport("timeout".to_string())));
    let ticker = KeepAlive::spawn(
        provider.clone(),
        sessions.clone(),
        Duration::from_millis(25),
    );

    let counting = provider.clone();
    wait_until(move || counting.presence_update_count() >= 1).await;
    ticker.shutdown();

    let session = sessions.get(&id).unwrap().unwrap();
    assert_eq!(session.state, SessionState::Connected);
    assert_eq!(session.retry_count, 0);
    assert!(!manager.has_pending_reconnect(&id));
}
