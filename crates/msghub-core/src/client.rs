//! External messaging client abstraction
//!
//! The `MessagingClient` trait stands in for the wrapped messaging-network
//! library: an opaque connection that authenticates asynchronously, exposes a
//! contact directory, and can send messages. Credentials are persisted by an
//! external collaborator keyed by session id; creating a client with the same
//! session id restores prior auth if present.
//!
//! `mock` provides scriptable in-memory implementations used across the
//! workspace's tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::contact::RawContact;
use crate::errors::Result;
use crate::types::{SessionId, Timestamp};

// ----------------------------------------------------------------------------
// Client Events
// ----------------------------------------------------------------------------

/// Events emitted by a live client connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientEvent {
    /// Pairing QR payload produced
    Qr { payload: String },
    /// Authenticated against the messaging network
    Authenticated,
    /// Loading a restored session
    LoadingScreen,
    /// Connection fully ready
    Ready {
        phone_number: Option<String>,
        display_name: Option<String>,
    },
    /// Authentication failed
    AuthFailure { reason: String },
    /// Connection dropped
    Disconnected { reason: String },
}

/// Live connection state as reported by the client itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Opening,
    Connected,
    Closed,
}

/// Handle to a sent message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHandle {
    pub id: String,
    pub timestamp: Timestamp,
}

// ----------------------------------------------------------------------------
// Client Trait
// ----------------------------------------------------------------------------

/// An external messaging-network connection
#[async_trait]
pub trait MessagingClient: Send + Sync {
    /// Begin the external connect; readiness is reported via the event stream
    async fn initialize(&self) -> Result<()>;

    /// Fetch the full raw contact directory
    async fn get_contacts(&self) -> Result<Vec<RawContact>>;

    /// Send a message to a chat id
    async fn send_message(&self, chat_id: &str, content: &str) -> Result<MessageHandle>;

    /// Probe the live connection state
    async fn connection_state(&self) -> Result<ClientState>;

    /// Log out of the messaging network (invalidates credentials server-side)
    async fn logout(&self) -> Result<()>;

    /// Tear down the connection
    async fn destroy(&self) -> Result<()>;

    /// Subscribe to the connection's event stream
    fn events(&self) -> broadcast::Receiver<ClientEvent>;
}

/// Creates clients bound to a session's persisted credentials
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(&self, session_id: &SessionId) -> Result<Arc<dyn MessagingClient>>;
}

/// On-disk credential store collaborator; only removal is exposed to this
/// core (creation/restore happens implicitly inside the client factory)
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn remove(&self, session_id: &SessionId) -> Result<()>;
}

// ----------------------------------------------------------------------------
// Mock Implementations
// ----------------------------------------------------------------------------

pub mod mock {
    //! Scriptable client implementations for tests

    use super::*;
    use crate::errors::MsghubError;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory client with a scriptable event stream
    pub struct MockClient {
        events: broadcast::Sender<ClientEvent>,
        contacts: Mutex<Vec<RawContact>>,
        state: Mutex<ClientState>,
        contacts_failure: Mutex<Option<String>>,
        sent: Mutex<Vec<(String, String)>>,
        /// Events replayed when `initialize` is called
        on_initialize: Mutex<Vec<ClientEvent>>,
        initialized: AtomicBool,
        destroyed: AtomicBool,
        logged_out: AtomicBool,
    }

    impl Default for MockClient {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MockClient {
        pub fn new() -> Self {
            let (events, _) = broadcast::channel(64);
            Self {
                events,
                contacts: Mutex::new(Vec::new()),
                state: Mutex::new(ClientState::Opening),
                contacts_failure: Mutex::new(None),
                sent: Mutex::new(Vec::new()),
                on_initialize: Mutex::new(Vec::new()),
                initialized: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                logged_out: AtomicBool::new(false),
            }
        }

        /// Emit an event to subscribers, tracking connection state
        pub fn emit(&self, event: ClientEvent) {
            match &event {
                ClientEvent::Ready { .. } => {
                    *self.state.lock().unwrap() = ClientState::Connected;
                }
                ClientEvent::Disconnected { .. } | ClientEvent::AuthFailure { .. } => {
                    *self.state.lock().unwrap() = ClientState::Closed;
                }
                _ => {}
            }
            // no subscribers is fine
            let _ = self.events.send(event);
        }

        pub fn set_contacts(&self, contacts: Vec<RawContact>) {
            *self.contacts.lock().unwrap() = contacts;
        }

        pub fn fail_contacts_with(&self, reason: impl Into<String>) {
            *self.contacts_failure.lock().unwrap() = Some(reason.into());
        }

        pub fn clear_contacts_failure(&self) {
            *self.contacts_failure.lock().unwrap() = None;
        }

        pub fn set_state(&self, state: ClientState) {
            *self.state.lock().unwrap() = state;
        }

        pub fn script_on_initialize(&self, events: Vec<ClientEvent>) {
            *self.on_initialize.lock().unwrap() = events;
        }

        pub fn sent_messages(&self) -> Vec<(String, String)> {
            self.sent.lock().unwrap().clone()
        }

        pub fn was_initialized(&self) -> bool {
            self.initialized.load(Ordering::SeqCst)
        }

        pub fn was_destroyed(&self) -> bool {
            self.destroyed.load(Ordering::SeqCst)
        }

        pub fn was_logged_out(&self) -> bool {
            self.logged_out.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessagingClient for MockClient {
        async fn initialize(&self) -> Result<()> {
            self.initialized.store(true, Ordering::SeqCst);
            let scripted: Vec<ClientEvent> =
                self.on_initialize.lock().unwrap().drain(..).collect();
            for event in scripted {
                // yield so subscribers spawned just before initialize run first
                tokio::task::yield_now().await;
                self.emit(event);
            }
            Ok(())
        }

        async fn get_contacts(&self) -> Result<Vec<RawContact>> {
            if let Some(reason) = self.contacts_failure.lock().unwrap().clone() {
                return Err(MsghubError::sync_fetch(reason));
            }
            Ok(self.contacts.lock().unwrap().clone())
        }

        async fn send_message(&self, chat_id: &str, content: &str) -> Result<MessageHandle> {
            self.sent
                .lock()
                .unwrap()
                .push((chat_id.to_string(), content.to_string()));
            Ok(MessageHandle {
                id: uuid::Uuid::new_v4().to_string(),
                timestamp: Timestamp::now(),
            })
        }

        async fn connection_state(&self) -> Result<ClientState> {
            Ok(*self.state.lock().unwrap())
        }

        async fn logout(&self) -> Result<()> {
            self.logged_out.store(true, Ordering::SeqCst);
            *self.state.lock().unwrap() = ClientState::Closed;
            Ok(())
        }

        async fn destroy(&self) -> Result<()> {
            self.destroyed.store(true, Ordering::SeqCst);
            *self.state.lock().unwrap() = ClientState::Closed;
            Ok(())
        }

        fn events(&self) -> broadcast::Receiver<ClientEvent> {
            self.events.subscribe()
        }
    }

    /// Factory producing `MockClient`s, with per-creation scripting
    #[derive(Default)]
    pub struct MockClientFactory {
        created: Mutex<HashMap<SessionId, Vec<Arc<MockClient>>>>,
        created_count: AtomicUsize,
        contacts: Mutex<Vec<RawContact>>,
        /// When set, created clients emit these events on `initialize`
        initialize_script: Mutex<Vec<ClientEvent>>,
        fail_create: AtomicBool,
    }

    impl MockClientFactory {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_contacts(&self, contacts: Vec<RawContact>) {
            *self.contacts.lock().unwrap() = contacts;
        }

        pub fn script_initialize(&self, events: Vec<ClientEvent>) {
            *self.initialize_script.lock().unwrap() = events;
        }

        pub fn fail_next_create(&self, fail: bool) {
            self.fail_create.store(fail, Ordering::SeqCst);
        }

        pub fn created_count(&self) -> usize {
            self.created_count.load(Ordering::SeqCst)
        }

        /// Most recently created client for a session, if any
        pub fn latest_for(&self, session_id: &SessionId) -> Option<Arc<MockClient>> {
            self.created
                .lock()
                .unwrap()
                .get(session_id)
                .and_then(|clients| clients.last().cloned())
        }
    }

    #[async_trait]
    impl ClientFactory for MockClientFactory {
        async fn create(&self, session_id: &SessionId) -> Result<Arc<dyn MessagingClient>> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(MsghubError::Client(
                    crate::errors::ClientError::Transport {
                        reason: "scripted create failure".into(),
                    },
                ));
            }
            let client = Arc::new(MockClient::new());
            client.set_contacts(self.contacts.lock().unwrap().clone());
            client.script_on_initialize(self.initialize_script.lock().unwrap().clone());

            self.created_count.fetch_add(1, Ordering::SeqCst);
            self.created
                .lock()
                .unwrap()
                .entry(*session_id)
                .or_default()
                .push(client.clone());
            Ok(client)
        }
    }

    /// Credential store recording removals
    #[derive(Default)]
    pub struct MemoryCredentialStore {
        removed: Mutex<HashSet<SessionId>>,
        fail_remove: AtomicBool,
    }

    impl MemoryCredentialStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_removals(&self, fail: bool) {
            self.fail_remove.store(fail, Ordering::SeqCst);
        }

        pub fn was_removed(&self, session_id: &SessionId) -> bool {
            self.removed.lock().unwrap().contains(session_id)
        }
    }

    #[async_trait]
    impl CredentialStore for MemoryCredentialStore {
        async fn remove(&self, session_id: &SessionId) -> Result<()> {
            if self.fail_remove.load(Ordering::SeqCst) {
                return Err(MsghubError::store_backend("scripted credential failure"));
            }
            self.removed.lock().unwrap().insert(*session_id);
            Ok(())
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
