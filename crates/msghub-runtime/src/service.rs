//! Service facade
//!
//! Wires the lifecycle controller, the sync engine and the client registry
//! into a single entry point. Callers address everything by tenant key; the
//! facade resolves the current session, enforces status preconditions and
//! spawns the background work for a synchronization run.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use msghub_core::client::{ClientFactory, CredentialStore, MessageHandle};
use msghub_core::config::{LifecycleConfig, RegistryConfig, SyncConfig};
use msghub_core::errors::{MsghubError, Result};
use msghub_core::session::{SessionRecord, SessionStatus};
use msghub_core::store::{ContactStore, GroupStore, SessionStore};
use msghub_core::types::{TenantKey, Timestamp};

use crate::lifecycle::SessionLifecycleController;
use crate::registry::ClientRegistry;
use crate::sync::{ContactSyncEngine, SyncProgress, SyncSummary};

// ----------------------------------------------------------------------------
// Status View
// ----------------------------------------------------------------------------

/// Caller-facing snapshot of a session: the durable record plus whether a
/// live client currently backs it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatusView {
    pub session_id: String,
    pub status: SessionStatus,
    pub qr_code: Option<String>,
    pub phone_number: Option<String>,
    pub display_name: Option<String>,
    pub sync_progress: u8,
    pub total_contacts: u64,
    pub last_sync_at: Option<Timestamp>,
    pub contacts_fetch_error: Option<String>,
    pub last_error: Option<String>,
    pub client_connected: bool,
}

impl SessionStatusView {
    fn from_record(record: &SessionRecord, client_connected: bool) -> Self {
        Self {
            session_id: record.session_id.to_string(),
            status: record.status,
            qr_code: record.qr_code.clone(),
            phone_number: record.phone_number.clone(),
            display_name: record.display_name.clone(),
            sync_progress: record.contacts_fetch_progress,
            total_contacts: record.total_contacts,
            last_sync_at: record.last_contacts_sync,
            contacts_fetch_error: record.contacts_fetch_error.clone(),
            last_error: record.last_error.clone(),
            client_connected,
        }
    }
}

// ----------------------------------------------------------------------------
// Service
// ----------------------------------------------------------------------------

pub struct MsghubService {
    lifecycle: Arc<SessionLifecycleController>,
    engine: Arc<ContactSyncEngine>,
    registry: Arc<ClientRegistry>,
    registry_config: RegistryConfig,
}

impl MsghubService {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        contacts: Arc<dyn ContactStore>,
        groups: Arc<dyn GroupStore>,
        factory: Arc<dyn ClientFactory>,
        credentials: Arc<dyn CredentialStore>,
        lifecycle_config: LifecycleConfig,
        sync_config: SyncConfig,
        registry_config: RegistryConfig,
    ) -> Self {
        let registry = Arc::new(ClientRegistry::new(factory, credentials));
        let lifecycle = Arc::new(SessionLifecycleController::new(
            sessions,
            groups.clone(),
            registry.clone(),
            lifecycle_config,
            sync_config.clone(),
        ));
        let engine = Arc::new(ContactSyncEngine::new(contacts, groups, sync_config));
        Self {
            lifecycle,
            engine,
            registry,
            registry_config,
        }
    }

    /// Shared-defaults constructor for the common case
    pub fn with_defaults(
        sessions: Arc<dyn SessionStore>,
        contacts: Arc<dyn ContactStore>,
        groups: Arc<dyn GroupStore>,
        factory: Arc<dyn ClientFactory>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self::new(
            sessions,
            contacts,
            groups,
            factory,
            credentials,
            LifecycleConfig::default(),
            SyncConfig::default(),
            RegistryConfig::default(),
        )
    }

    pub fn lifecycle(&self) -> &Arc<SessionLifecycleController> {
        &self.lifecycle
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Session operations
    // ------------------------------------------------------------------

    /// Start a fresh session for the tenant, superseding any active one
    pub async fn initiate_session(&self, key: &TenantKey) -> Result<SessionStatusView> {
        let record = self.lifecycle.initiate(key).await?;
        Ok(SessionStatusView::from_record(&record, false))
    }

    /// Current session status, including whether a live client backs it
    pub async fn get_status(&self, key: &TenantKey) -> Result<SessionStatusView> {
        let record = self.lifecycle.get_status(key).await?;
        let connected = self.registry.is_ready(&record.session_id).await;
        Ok(SessionStatusView::from_record(&record, connected))
    }

    /// Explicit logout: disconnects, removes credentials, ends the session
    pub async fn logout(&self, key: &TenantKey) -> Result<SessionStatusView> {
        let record = self.lifecycle.logout(key).await?;
        Ok(SessionStatusView::from_record(&record, false))
    }

    // ------------------------------------------------------------------
    // Synchronization
    // ------------------------------------------------------------------

    /// Claim and launch a synchronization run in the background. Returns as
    /// soon as the run is claimed; the handle resolves to the final summary.
    /// Progress is persisted onto the session record as the run advances.
    pub async fn start_sync(&self, key: &TenantKey) -> Result<JoinHandle<Result<SyncSummary>>> {
        let (record, client) = self.lifecycle.begin_sync(key).await?;
        let session_id = record.session_id;
        info!(%session_id, %key, "synchronization claimed");

        let (tx, mut rx) = mpsc::unbounded_channel::<SyncProgress>();

        // progress consumer: persists updates in emit order
        let progress_lifecycle = self.lifecycle.clone();
        tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                progress_lifecycle
                    .record_sync_progress(session_id, update.progress)
                    .await;
            }
        });

        let engine = self.engine.clone();
        let lifecycle = self.lifecycle.clone();
        let key = key.clone();
        Ok(tokio::spawn(async move {
            let outcome = engine.sync(client.as_ref(), &key, &tx).await;
            drop(tx);
            match &outcome {
                Ok(summary) => {
                    lifecycle
                        .complete_sync(session_id, summary.total_contacts)
                        .await;
                }
                Err(err) => {
                    warn!(%session_id, error = %err, "synchronization run failed");
                    lifecycle.fail_sync(session_id, err.to_string()).await;
                }
            }
            outcome
        }))
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Send a message through the session's live client. Allowed while
    /// ready, completed, or mid-sync; any other status is rejected.
    pub async fn send_message(
        &self,
        key: &TenantKey,
        chat_id: &str,
        content: &str,
    ) -> Result<MessageHandle> {
        let record = self.lifecycle.get_status(key).await?;
        if !record.status.can_send_messages() {
            return Err(MsghubError::session_not_ready(record.status));
        }
        let client = self
            .registry
            .get(&record.session_id)
            .ok_or_else(|| MsghubError::client_unavailable(record.session_id))?;

        let handle = client.send_message(chat_id, content).await?;
        self.lifecycle.touch(record.session_id).await;
        Ok(handle)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Evict clients idle past the configured threshold; credentials are
    /// untouched so sessions stay recreatable
    pub async fn evict_idle_clients(&self) -> usize {
        self.registry.evict_idle(self.registry_config.max_idle).await
    }
}
