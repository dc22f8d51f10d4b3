use courier_core::models::{Session, SessionId, SessionState};
use courier_core::registry::SessionRegistry;

fn session(id: &str, phone: &str) -> Session {
    Session {
        id: SessionId::from(id),
        phone_number: phone.to_string(),
        handle: None,
        state: SessionState::Initializing,
        retry_count: 0,
        last_connected_at: None,
    }
}

#[test]
fn insert_and_get_round_trip() {
    let registry = SessionRegistry::new();
    let id = SessionId::from("alpha");

    assert!(registry.get(&id).unwrap().is_none());
    registry.insert(id.clone(), session("alpha", "+15550001")).unwrap();

    let stored = registry.get(&id).unwrap().expect("session must exist");
    assert_eq!(stored.phone_number, "+15550001");
    assert_eq!(stored.state, SessionState::Initializing);
}

#[test]
fn update_mutates_in_place_and_reports_absence() {
    let registry = SessionRegistry::new();
    let id = SessionId::from("alpha");
    registry.insert(id.clone(), session("alpha", "+15550001")).unwrap();

    let observed = registry
        .update(&id, |entry| {
            entry.state = SessionState::Connected;
            entry.state
        })
        .unwrap();
    assert_eq!(observed, Some(SessionState::Connected));
    assert_eq!(
        registry.get(&id).unwrap().unwrap().state,
        SessionState::Connected
    );

    let missing = registry
        .update(&SessionId::from("ghost"), |entry| entry.state)
        .unwrap();
    assert!(missing.is_none());
}

#[test]
fn clones_share_the_same_backing_map() {
    let registry = SessionRegistry::new();
    let alias = registry.clone();
    let id = SessionId::from("alpha");

    registry.insert(id.clone(), session("alpha", "+15550001")).unwrap();

    assert!(alias.contains(&id).unwrap());
    alias.remove(&id).unwrap();
    assert!(!registry.contains(&id).unwrap());
}

#[test]
fn snapshot_is_a_point_in_time_copy() {
    let registry = SessionRegistry::new();
    registry
        .insert(SessionId::from("alpha"), session("alpha", "+15550001"))
        .unwrap();
    registry
        .insert(SessionId::from("beta"), session("beta", "+15550002"))
        .unwrap();

    let snapshot = registry.snapshot().unwrap();
    assert_eq!(snapshot.len(), 2);

    // Mutations after the snapshot are not reflected in it.
    registry.remove(&SessionId::from("alpha")).unwrap();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(registry.len().unwrap(), 1);
}

#[test]
fn read_maps_without_cloning_the_entry() {
    let registry = SessionRegistry::new();
    let id = SessionId::from("alpha");
    registry.insert(id.clone(), session("alpha", "+15550001")).unwrap();

    let retry = registry.read(&id, |entry| entry.retry_count).unwrap();
    assert_eq!(retry, Some(0));

    let absent = registry
        .read(&SessionId::from("ghost"), |entry| entry.retry_count)
        .unwrap();
    assert!(absent.is_none());
}
