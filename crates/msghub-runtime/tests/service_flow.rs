//! End-to-end flows through the service facade: pairing, full
//! synchronization, client recreation and failure recovery, all against the
//! in-memory stores and the scriptable mock client.

use std::sync::Arc;
use std::time::Duration;

use msghub_core::client::mock::{MemoryCredentialStore, MockClientFactory};
use msghub_core::client::ClientEvent;
use msghub_core::config::{LifecycleConfig, RegistryConfig, SyncConfig};
use msghub_core::contact::RawContact;
use msghub_core::errors::{ClientError, MsghubError, SessionError};
use msghub_core::group::{ALL_CONTACTS_GROUP, RECENT_CONTACTS_GROUP};
use msghub_core::store::{
    ContactStore, GroupStore, MemoryContactStore, MemoryGroupStore, MemorySessionStore,
};
use msghub_core::types::{SessionId, TenantKey};
use msghub_core::SessionStatus;
use msghub_runtime::MsghubService;

// ----------------------------------------------------------------------------
// Harness
// ----------------------------------------------------------------------------

struct Harness {
    service: MsghubService,
    factory: Arc<MockClientFactory>,
    credentials: Arc<MemoryCredentialStore>,
    contacts: Arc<MemoryContactStore>,
    groups: Arc<MemoryGroupStore>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness() -> Harness {
    init_tracing();
    let factory = Arc::new(MockClientFactory::new());
    let credentials = Arc::new(MemoryCredentialStore::new());
    let contacts = MemoryContactStore::shared();
    let groups = MemoryGroupStore::shared();
    let service = MsghubService::new(
        MemorySessionStore::shared(),
        contacts.clone(),
        groups.clone(),
        factory.clone(),
        credentials.clone(),
        LifecycleConfig {
            recreation_timeout: Duration::from_millis(300),
            audit_trail_limit: 100,
        },
        SyncConfig::default(),
        RegistryConfig::default(),
    );
    Harness {
        service,
        factory,
        credentials,
        contacts,
        groups,
    }
}

fn key() -> TenantKey {
    TenantKey::new("acme", "store-1")
}

fn person(id: &str, name: &str) -> RawContact {
    RawContact {
        id: id.to_string(),
        name: Some(name.to_string()),
        number: Some(format!("55{id}")),
        ..Default::default()
    }
}

async fn wait_for_status(h: &Harness, status: SessionStatus) {
    for _ in 0..200 {
        if h.service.get_status(&key()).await.unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("session never reached {status}");
}

async fn session_id(h: &Harness) -> SessionId {
    h.service
        .get_status(&key())
        .await
        .unwrap()
        .session_id
        .parse()
        .unwrap()
}

async fn bring_to_ready(h: &Harness) {
    h.service.initiate_session(&key()).await.unwrap();
    let id = session_id(h).await;
    let client = h.factory.latest_for(&id).unwrap();
    client.emit(ClientEvent::Qr {
        payload: "pairing-qr".into(),
    });
    client.emit(ClientEvent::Authenticated);
    client.emit(ClientEvent::Ready {
        phone_number: Some("5511888".into()),
        display_name: Some("Acme Store".into()),
    });
    wait_for_status(h, SessionStatus::Ready).await;
}

// ----------------------------------------------------------------------------
// Pairing flow
// ----------------------------------------------------------------------------

#[tokio::test]
async fn pairing_flow_reaches_ready_with_empty_groups() {
    let h = harness();
    let view = h.service.initiate_session(&key()).await.unwrap();
    assert_eq!(view.status, SessionStatus::Initializing);

    let id = session_id(&h).await;
    let client = h.factory.latest_for(&id).unwrap();

    client.emit(ClientEvent::Qr {
        payload: "pairing-qr".into(),
    });
    wait_for_status(&h, SessionStatus::QrReady).await;
    let view = h.service.get_status(&key()).await.unwrap();
    assert_eq!(view.qr_code.as_deref(), Some("pairing-qr"));

    client.emit(ClientEvent::Authenticated);
    client.emit(ClientEvent::Ready {
        phone_number: Some("5511888".into()),
        display_name: Some("Acme Store".into()),
    });
    wait_for_status(&h, SessionStatus::Ready).await;

    let view = h.service.get_status(&key()).await.unwrap();
    assert_eq!(view.qr_code, None);
    assert_eq!(view.phone_number.as_deref(), Some("5511888"));
    assert!(view.client_connected);

    // canonical groups exist immediately, with no members yet
    let groups = h.groups.list(&key()).await.unwrap();
    assert_eq!(groups.len(), 2);
    for group in groups {
        assert!(
            group.name == ALL_CONTACTS_GROUP || group.name == RECENT_CONTACTS_GROUP,
            "unexpected group {}",
            group.name
        );
        assert_eq!(group.contact_count(), 0);
    }
}

// ----------------------------------------------------------------------------
// Full synchronization
// ----------------------------------------------------------------------------

#[tokio::test]
async fn full_sync_filters_and_populates_groups() {
    let h = harness();

    // 110 syncable people plus 10 group chats and broadcasts
    let mut directory: Vec<RawContact> = (0..110)
        .map(|i| person(&format!("{i}@c.us"), &format!("Person {i}")))
        .collect();
    for i in 0..7 {
        let mut chat = person(&format!("{i}@g.us"), "Group Chat");
        chat.is_group = true;
        directory.push(chat);
    }
    for _ in 0..3 {
        directory.push(person("status@broadcast", "Status"));
    }
    h.factory.set_contacts(directory);

    bring_to_ready(&h).await;

    let handle = h.service.start_sync(&key()).await.unwrap();
    let summary = handle.await.unwrap().unwrap();
    assert_eq!(summary.new_contacts, 110);
    assert_eq!(summary.skipped_contacts, 10);
    assert_eq!(summary.total_contacts, 110);

    wait_for_status(&h, SessionStatus::Completed).await;
    let view = h.service.get_status(&key()).await.unwrap();
    assert_eq!(view.total_contacts, 110);
    assert_eq!(view.sync_progress, 100);
    assert!(view.last_sync_at.is_some());

    let all = h
        .groups
        .find_by_name(&key(), ALL_CONTACTS_GROUP)
        .await
        .unwrap()
        .unwrap();
    let recent = h
        .groups
        .find_by_name(&key(), RECENT_CONTACTS_GROUP)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(all.contact_count(), 110);
    // everything was just observed, so recent equals all
    assert_eq!(recent.contact_count(), 110);
    assert!(recent
        .contact_refs
        .iter()
        .all(|id| all.contact_refs.contains(id)));
}

#[tokio::test]
async fn repeat_sync_is_cumulative() {
    let h = harness();
    h.factory
        .set_contacts(vec![person("a@c.us", "Alice"), person("b@c.us", "Bob")]);
    bring_to_ready(&h).await;

    let summary = h
        .service
        .start_sync(&key())
        .await
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.new_contacts, 2);
    wait_for_status(&h, SessionStatus::Completed).await;

    // Bob vanishes from the directory; a new contact appears
    let id = session_id(&h).await;
    let client = h.factory.latest_for(&id).unwrap();
    client.set_contacts(vec![person("a@c.us", "Alice"), person("c@c.us", "Carol")]);

    let summary = h
        .service
        .start_sync(&key())
        .await
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.new_contacts, 1);
    assert_eq!(summary.updated_contacts, 1);
    // Bob survives: synchronization never deletes
    assert_eq!(summary.total_contacts, 3);
    assert_eq!(h.contacts.count_active(&key()).await.unwrap(), 3);
}

// ----------------------------------------------------------------------------
// Mutual exclusion
// ----------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_sync_start_is_rejected() {
    let h = harness();
    h.factory.set_contacts(vec![person("a@c.us", "Alice")]);
    bring_to_ready(&h).await;

    // claim the run but do not let it finish
    let (_record, _client) = h.service.lifecycle().begin_sync(&key()).await.unwrap();

    let err = h.service.start_sync(&key()).await.unwrap_err();
    assert!(matches!(
        err,
        MsghubError::Session(SessionError::SyncInProgress { .. })
    ));
}

#[tokio::test]
async fn sync_from_unpaired_session_is_rejected() {
    let h = harness();
    h.service.initiate_session(&key()).await.unwrap();

    let err = h.service.start_sync(&key()).await.unwrap_err();
    assert!(matches!(
        err,
        MsghubError::Session(SessionError::SessionNotReady { .. })
    ));
}

// ----------------------------------------------------------------------------
// Client recreation
// ----------------------------------------------------------------------------

#[tokio::test]
async fn sync_recreates_client_after_handle_loss() {
    let h = harness();
    h.factory.set_contacts(vec![person("a@c.us", "Alice")]);
    bring_to_ready(&h).await;

    let summary = h
        .service
        .start_sync(&key())
        .await
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.new_contacts, 1);
    wait_for_status(&h, SessionStatus::Completed).await;

    // simulate a restart: the live handle is gone, the record persists
    let id = session_id(&h).await;
    h.service.registry().cleanup(&id, false).await;
    assert!(!h.service.registry().has(&id));

    // recreated clients authenticate from stored credentials and report ready
    h.factory.script_initialize(vec![ClientEvent::Ready {
        phone_number: Some("5511888".into()),
        display_name: None,
    }]);

    let summary = h
        .service
        .start_sync(&key())
        .await
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.updated_contacts, 1);
    assert_eq!(h.factory.created_count(), 2);
}

#[tokio::test]
async fn recreation_timeout_leaves_status_untouched() {
    let h = harness();
    bring_to_ready(&h).await;

    let id = session_id(&h).await;
    h.service.registry().cleanup(&id, false).await;
    // no scripted ready: the fresh client never connects

    let err = h.service.start_sync(&key()).await.unwrap_err();
    assert!(matches!(
        err,
        MsghubError::Client(ClientError::RecreationTimeout { .. })
    ));

    let view = h.service.get_status(&key()).await.unwrap();
    assert_eq!(view.status, SessionStatus::Ready);
}

// ----------------------------------------------------------------------------
// Failure recovery
// ----------------------------------------------------------------------------

#[tokio::test]
async fn fetch_failure_reverts_to_ready_and_messaging_works() {
    let h = harness();
    bring_to_ready(&h).await;

    let id = session_id(&h).await;
    let client = h.factory.latest_for(&id).unwrap();
    client.fail_contacts_with("directory unavailable");

    let result = h.service.start_sync(&key()).await.unwrap().await.unwrap();
    assert!(result.is_err());

    wait_for_status(&h, SessionStatus::Ready).await;
    let view = h.service.get_status(&key()).await.unwrap();
    assert!(view
        .contacts_fetch_error
        .as_deref()
        .unwrap()
        .contains("directory unavailable"));

    // the session stays usable for messaging
    let handle = h
        .service
        .send_message(&key(), "a@c.us", "hello")
        .await
        .unwrap();
    assert!(!handle.id.is_empty());
    assert_eq!(client.sent_messages().len(), 1);

    // and a retry succeeds once the directory is back
    client.clear_contacts_failure();
    client.set_contacts(vec![person("a@c.us", "Alice")]);
    let summary = h
        .service
        .start_sync(&key())
        .await
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.new_contacts, 1);
}

// ----------------------------------------------------------------------------
// Disconnect and logout
// ----------------------------------------------------------------------------

#[tokio::test]
async fn disconnect_keeps_credentials_logout_removes_them() {
    let h = harness();
    bring_to_ready(&h).await;
    let id = session_id(&h).await;
    let client = h.factory.latest_for(&id).unwrap();

    client.emit(ClientEvent::Disconnected {
        reason: "network blip".into(),
    });
    wait_for_status(&h, SessionStatus::Disconnected).await;
    assert!(!h.credentials.was_removed(&id));

    // pair a new session, then log out explicitly
    h.factory.script_initialize(vec![]);
    bring_to_ready(&h).await;
    let id = session_id(&h).await;
    let view = h.service.logout(&key()).await.unwrap();
    assert_eq!(view.status, SessionStatus::Disconnected);
    assert!(h.credentials.was_removed(&id));
    assert!(!h.service.registry().has(&id));
}

#[tokio::test]
async fn send_message_requires_usable_status() {
    let h = harness();
    h.service.initiate_session(&key()).await.unwrap();

    let err = h
        .service
        .send_message(&key(), "a@c.us", "hello")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MsghubError::Session(SessionError::SessionNotReady { .. })
    ));
}
