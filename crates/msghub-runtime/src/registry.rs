//! Client registry
//!
//! Single source of truth for "is there a live connection for session X".
//! The registry is a cache of what is currently true; the durable session
//! record is the source of truth for what should be true. Reconciliation
//! (client recreation) is an explicit operation driven by the lifecycle
//! controller, never something the registry does silently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use msghub_core::client::{ClientFactory, ClientState, CredentialStore, MessagingClient};
use msghub_core::errors::Result;
use msghub_core::types::{SessionId, Timestamp};

// ----------------------------------------------------------------------------
// Registry Entry
// ----------------------------------------------------------------------------

/// A live client handle plus its last-activity timestamp
#[derive(Clone)]
struct RegistryEntry {
    client: Arc<dyn MessagingClient>,
    last_activity: Timestamp,
}

/// Counters for registry activity
#[derive(Debug, Default)]
pub struct RegistryStats {
    pub clients_created: AtomicU64,
    pub clients_cleaned_up: AtomicU64,
    pub clients_evicted: AtomicU64,
}

// ----------------------------------------------------------------------------
// Client Registry
// ----------------------------------------------------------------------------

/// In-memory map from session id to live client handle.
///
/// Each entry is only ever accessed through its session id, so cross-session
/// interference is structurally impossible; per-key creation locks guarantee
/// concurrent callers observe a consistent create-or-reuse outcome.
pub struct ClientRegistry {
    factory: Arc<dyn ClientFactory>,
    credentials: Arc<dyn CredentialStore>,
    entries: DashMap<SessionId, RegistryEntry>,
    creation_locks: DashMap<SessionId, Arc<Mutex<()>>>,
    stats: RegistryStats,
}

impl ClientRegistry {
    pub fn new(factory: Arc<dyn ClientFactory>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            factory,
            credentials,
            entries: DashMap::new(),
            creation_locks: DashMap::new(),
            stats: RegistryStats::default(),
        }
    }

    /// Construct a new client bound to the session's persisted credentials
    /// and store it. Does not block on readiness.
    pub async fn create(&self, session_id: &SessionId) -> Result<Arc<dyn MessagingClient>> {
        let client = self.factory.create(session_id).await?;
        self.store(session_id, client.clone());
        self.stats.clients_created.fetch_add(1, Ordering::Relaxed);
        debug!(%session_id, "client created and registered");
        Ok(client)
    }

    /// Return the existing handle or create one, never both: concurrent
    /// callers for the same session serialize on a per-key lock
    pub async fn get_or_create(&self, session_id: &SessionId) -> Result<Arc<dyn MessagingClient>> {
        let lock = self
            .creation_locks
            .entry(*session_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(existing) = self.get(session_id) {
            return Ok(existing);
        }
        self.create(session_id).await
    }

    /// Store a handle for a session, replacing any previous entry
    pub fn store(&self, session_id: &SessionId, client: Arc<dyn MessagingClient>) {
        self.entries.insert(
            *session_id,
            RegistryEntry {
                client,
                last_activity: Timestamp::now(),
            },
        );
    }

    /// Look up the live handle; refreshes the last-activity timestamp
    pub fn get(&self, session_id: &SessionId) -> Option<Arc<dyn MessagingClient>> {
        self.entries.get_mut(session_id).map(|mut entry| {
            entry.last_activity = Timestamp::now();
            entry.client.clone()
        })
    }

    pub fn has(&self, session_id: &SessionId) -> bool {
        self.entries.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Probe the underlying connection's live state. Fails closed: any probe
    /// error counts as not ready.
    pub async fn is_ready(&self, session_id: &SessionId) -> bool {
        let client = match self.entries.get(session_id) {
            Some(entry) => entry.client.clone(),
            None => return false,
        };
        matches!(client.connection_state().await, Ok(ClientState::Connected))
    }

    /// Best-effort terminate-and-remove. Termination failure does not stop
    /// credential removal; credential removal failure is logged, not
    /// propagated. Cleaning up an absent session is a no-op (credentials are
    /// still removed when requested).
    pub async fn cleanup(&self, session_id: &SessionId, remove_credentials: bool) {
        if let Some((_, entry)) = self.entries.remove(session_id) {
            if let Err(err) = entry.client.destroy().await {
                warn!(%session_id, error = %err, "client destroy failed during cleanup");
            }
            self.stats.clients_cleaned_up.fetch_add(1, Ordering::Relaxed);
        }
        self.creation_locks.remove(session_id);

        if remove_credentials {
            if let Err(err) = self.credentials.remove(session_id).await {
                warn!(%session_id, error = %err, "credential removal failed");
            }
        }
    }

    /// Clean up every entry idle longer than `max_idle`. Returns the number
    /// evicted. Invoked by a periodic caller; the registry runs no timers of
    /// its own.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Timestamp::now();
        let idle: Vec<SessionId> = self
            .entries
            .iter()
            .filter(|entry| now.elapsed_since(entry.last_activity) > max_idle)
            .map(|entry| *entry.key())
            .collect();

        for session_id in &idle {
            info!(%session_id, "evicting idle client");
            // idle eviction never touches on-disk credentials
            self.cleanup(session_id, false).await;
            self.stats.clients_evicted.fetch_add(1, Ordering::Relaxed);
        }
        idle.len()
    }

    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
