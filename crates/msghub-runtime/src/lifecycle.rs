//! Session lifecycle controller
//!
//! Drives durable session records through the pure state machine in response
//! to client events, owns the per-session event pump tasks, creates the
//! canonical derived groups on ready, and guards synchronization starts with
//! the status-based mutual exclusion (check-and-set into fetching_contacts).
//!
//! Event-handler persistence failures are logged and never re-thrown into the
//! client's event path: a failed write must not crash the connection.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use msghub_core::client::{ClientEvent, MessagingClient};
use msghub_core::config::{LifecycleConfig, SyncConfig};
use msghub_core::errors::{ClientError, MsghubError, Result};
use msghub_core::group::{ALL_CONTACTS_GROUP, RECENT_CONTACTS_GROUP};
use msghub_core::session::{AuditEntry, SessionEvent, SessionRecord, TransitionEffect};
use msghub_core::store::{GroupStore, SessionStore, StatusSwap};
use msghub_core::types::{SessionId, TenantKey, Timestamp};
use msghub_core::{DerivedGroup, FilterCriteria, GroupType, SessionStatus};

use crate::registry::ClientRegistry;

// ----------------------------------------------------------------------------
// Lifecycle Controller
// ----------------------------------------------------------------------------

pub struct SessionLifecycleController {
    sessions: Arc<dyn SessionStore>,
    groups: Arc<dyn GroupStore>,
    registry: Arc<ClientRegistry>,
    config: LifecycleConfig,
    sync_config: SyncConfig,
    /// Live status notifications per session, used by waiters
    status_watch: DashMap<SessionId, watch::Sender<SessionStatus>>,
    /// Sessions whose next disconnect follows an explicit logout, which also
    /// removes on-disk credentials
    logout_pending: DashMap<SessionId, ()>,
    /// Serializes load-modify-store cycles on each session's durable record,
    /// so a stale snapshot can never overwrite a newer status
    record_locks: DashMap<SessionId, Arc<AsyncMutex<()>>>,
    audit: Mutex<VecDeque<AuditEntry>>,
}

impl SessionLifecycleController {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        groups: Arc<dyn GroupStore>,
        registry: Arc<ClientRegistry>,
        config: LifecycleConfig,
        sync_config: SyncConfig,
    ) -> Self {
        Self {
            sessions,
            groups,
            registry,
            config,
            sync_config,
            status_watch: DashMap::new(),
            logout_pending: DashMap::new(),
            record_locks: DashMap::new(),
            audit: Mutex::new(VecDeque::new()),
        }
    }

    // ------------------------------------------------------------------
    // Session initiation
    // ------------------------------------------------------------------

    /// Create a new session record for the tenant key, create its registry
    /// entry and begin the external connect. The new record supersedes any
    /// previously active one; superseded records are kept as history.
    pub async fn initiate(self: &Arc<Self>, key: &TenantKey) -> Result<SessionRecord> {
        // supersede whatever is still live for this key: an active session,
        // or a pairing still in flight. Driving the old record to
        // `disconnected` keeps at most one record per key in an active
        // status; its credentials stay on disk.
        let prev = match self.sessions.find_active(key).await? {
            Some(prev) => Some(prev),
            None => self
                .sessions
                .find_latest(key)
                .await?
                .filter(|r| !r.status.is_terminal()),
        };
        if let Some(prev) = prev {
            info!(session_id = %prev.session_id, %key, "superseding live session");
            self.apply_event(
                prev.session_id,
                SessionEvent::ClientDisconnected {
                    reason: "superseded by a new session".to_string(),
                },
            )
            .await;
        }

        let record = SessionRecord::new(key, Timestamp::now());
        let session_id = record.session_id;
        self.sessions.insert(record.clone()).await?;
        self.watch_sender(session_id, record.status);

        let client = self.registry.create(&session_id).await?;
        self.spawn_event_pump(session_id, client.clone());
        tokio::spawn(async move {
            if let Err(err) = client.initialize().await {
                warn!(%session_id, error = %err, "client initialize failed");
            }
        });

        info!(%session_id, %key, "session initiated");
        Ok(record)
    }

    /// Most recent record for a tenant key
    pub async fn get_status(&self, key: &TenantKey) -> Result<SessionRecord> {
        self.sessions
            .find_latest(key)
            .await?
            .ok_or_else(|| MsghubError::session_not_found(key))
    }

    // ------------------------------------------------------------------
    // Event pump
    // ------------------------------------------------------------------

    /// Consume a client's event stream and apply each event to the session
    /// record. Runs until the client (and its channel) is torn down.
    pub fn spawn_event_pump(self: &Arc<Self>, session_id: SessionId, client: Arc<dyn MessagingClient>) {
        let controller = self.clone();
        let mut events = client.events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let session_event = map_client_event(event);
                        controller.apply_event(session_id, session_event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(%session_id, missed, "event pump lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(%session_id, "client event stream closed");
                        break;
                    }
                }
            }
        });
    }

    fn record_lock(&self, session_id: SessionId) -> Arc<AsyncMutex<()>> {
        self.record_locks
            .entry(session_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Apply one event to the session's durable record. Invalid transitions
    /// are dropped with a log line; persistence failures are logged, never
    /// propagated into the event path.
    pub async fn apply_event(&self, session_id: SessionId, event: SessionEvent) -> Option<SessionRecord> {
        let lock = self.record_lock(session_id);
        let _guard = lock.lock().await;

        let mut record = match self.sessions.get(&session_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(%session_id, event = event.name(), "event for unknown session dropped");
                return None;
            }
            Err(err) => {
                error!(%session_id, error = %err, "session load failed in event handler");
                return None;
            }
        };

        let transition = match record.status.transition(&event) {
            Ok(transition) => transition,
            Err(err) => {
                debug!(%session_id, error = %err, "event ignored");
                return None;
            }
        };

        let audit = record.apply_transition(&transition, Timestamp::now());
        debug!(
            %session_id,
            from = %audit.from_status,
            to = %audit.to_status,
            event = %audit.event,
            "session transition"
        );
        self.push_audit(audit);

        if let Err(err) = self.sessions.update(&record).await {
            error!(%session_id, error = %err, "session persist failed in event handler");
        }
        self.notify_status(session_id, record.status);

        for effect in &transition.effects {
            match effect {
                TransitionEffect::EnsureCanonicalGroups => {
                    if let Err(err) = self.ensure_canonical_groups(&record.tenant_key()).await {
                        error!(%session_id, error = %err, "canonical group creation failed");
                    }
                }
                TransitionEffect::LogoutClient => {
                    if let Some(client) = self.registry.get(&session_id) {
                        if let Err(err) = client.logout().await {
                            warn!(%session_id, error = %err, "client logout failed");
                        }
                    }
                }
                TransitionEffect::CleanupClient { remove_credentials } => {
                    let logout_driven = self.logout_pending.remove(&session_id).is_some();
                    self.registry
                        .cleanup(&session_id, *remove_credentials || logout_driven)
                        .await;
                }
                _ => {}
            }
        }

        Some(record)
    }

    /// Create the two canonical auto groups if absent (idempotent)
    pub async fn ensure_canonical_groups(&self, key: &TenantKey) -> Result<Vec<DerivedGroup>> {
        let now = Timestamp::now();
        let days = self.sync_config.recent_window_days;

        let all = self
            .groups
            .find_or_create(
                key,
                ALL_CONTACTS_GROUP,
                "Every active contact",
                GroupType::Auto,
                FilterCriteria::AllActive,
                now,
            )
            .await?;
        let recent = self
            .groups
            .find_or_create(
                key,
                RECENT_CONTACTS_GROUP,
                &format!("Contacts active in the last {days} days"),
                GroupType::Auto,
                FilterCriteria::RecentWindow { days },
                now,
            )
            .await?;
        Ok(vec![all, recent])
    }

    // ------------------------------------------------------------------
    // Synchronization gating
    // ------------------------------------------------------------------

    /// Validate and claim a synchronization start: resolves (or recreates)
    /// the live client, then atomically moves the record into
    /// `fetching_contacts`. A rejected swap means another run is in flight.
    pub async fn begin_sync(
        self: &Arc<Self>,
        key: &TenantKey,
    ) -> Result<(SessionRecord, Arc<dyn MessagingClient>)> {
        let record = self.get_status(key).await?;
        let session_id = record.session_id;

        if record.status == SessionStatus::FetchingContacts {
            return Err(MsghubError::sync_in_progress(session_id));
        }
        if !record.status.sync_eligible() {
            return Err(MsghubError::session_not_ready(record.status));
        }

        let client = self.resolve_client(session_id).await?;

        let lock = self.record_lock(session_id);
        let _guard = lock.lock().await;

        match self
            .sessions
            .compare_and_swap_status(
                &session_id,
                &[SessionStatus::Ready, SessionStatus::Completed],
                SessionStatus::FetchingContacts,
            )
            .await?
        {
            StatusSwap::Swapped { from } => {
                let mut record = self
                    .sessions
                    .get(&session_id)
                    .await?
                    .ok_or_else(|| MsghubError::session_not_found(key))?;
                record.reset_sync_bookkeeping();
                record.touch(Timestamp::now());
                self.sessions.update(&record).await?;
                self.notify_status(session_id, record.status);
                self.push_audit(AuditEntry {
                    timestamp: Timestamp::now(),
                    session_id,
                    from_status: from,
                    to_status: SessionStatus::FetchingContacts,
                    event: "sync_started".to_string(),
                });
                Ok((record, client))
            }
            StatusSwap::Rejected { current } if current == SessionStatus::FetchingContacts => {
                Err(MsghubError::sync_in_progress(session_id))
            }
            StatusSwap::Rejected { current } => Err(MsghubError::session_not_ready(current)),
        }
    }

    /// Resolve the live client for a session, recreating it from persisted
    /// credentials when the registry has no handle. Recreation waits (bounded
    /// by the configured timeout) for the fresh client to report ready and
    /// never mutates the session status on failure.
    async fn resolve_client(
        self: &Arc<Self>,
        session_id: SessionId,
    ) -> Result<Arc<dyn MessagingClient>> {
        let had_handle = self.registry.has(&session_id);
        let client = self
            .registry
            .get_or_create(&session_id)
            .await
            .map_err(|err| {
                warn!(%session_id, error = %err, "client recreation failed");
                MsghubError::client_unavailable(session_id)
            })?;

        let mut events = client.events();

        if !had_handle {
            info!(%session_id, "recreating client from persisted credentials");
            self.spawn_event_pump(session_id, client.clone());
            let init_client = client.clone();
            tokio::spawn(async move {
                if let Err(err) = init_client.initialize().await {
                    warn!(%session_id, error = %err, "recreated client initialize failed");
                }
            });
        }

        if self.registry.is_ready(&session_id).await {
            return Ok(client);
        }

        let timeout = self.config.recreation_timeout;
        let wait = tokio::time::timeout(timeout, async {
            loop {
                match events.recv().await {
                    Ok(ClientEvent::Ready { .. }) => break Ok(()),
                    Ok(ClientEvent::AuthFailure { reason }) => {
                        break Err(MsghubError::Client(ClientError::AuthFailure { reason }))
                    }
                    Ok(ClientEvent::Disconnected { reason }) => {
                        break Err(MsghubError::Client(ClientError::Transport { reason }))
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        break Err(MsghubError::client_unavailable(session_id))
                    }
                }
            }
        })
        .await;

        match wait {
            Ok(Ok(())) => Ok(client),
            Ok(Err(err)) => Err(err),
            Err(_elapsed) => Err(MsghubError::Client(ClientError::RecreationTimeout {
                session_id,
                timeout_ms: timeout.as_millis() as u64,
            })),
        }
    }

    // ------------------------------------------------------------------
    // Sync progress plumbing
    // ------------------------------------------------------------------

    /// Persist progress of the in-flight run. Ignored once the session has
    /// left `fetching_contacts`.
    pub async fn record_sync_progress(&self, session_id: SessionId, progress: u8) {
        let lock = self.record_lock(session_id);
        let _guard = lock.lock().await;

        let record = match self.sessions.get(&session_id).await {
            Ok(Some(record)) if record.status == SessionStatus::FetchingContacts => record,
            Ok(_) => return,
            Err(err) => {
                error!(%session_id, error = %err, "session load failed for progress update");
                return;
            }
        };
        let mut record = record;
        record.record_sync_progress(progress, Timestamp::now());
        if let Err(err) = self.sessions.update(&record).await {
            error!(%session_id, error = %err, "progress persist failed");
        }
    }

    /// Mark the in-flight run completed
    pub async fn complete_sync(&self, session_id: SessionId, total_contacts: u64) {
        self.apply_event(session_id, SessionEvent::SyncCompleted { total_contacts })
            .await;
    }

    /// Mark the in-flight run failed; the session reverts to `ready`
    pub async fn fail_sync(&self, session_id: SessionId, reason: String) {
        self.apply_event(session_id, SessionEvent::SyncFailed { reason })
            .await;
    }

    // ------------------------------------------------------------------
    // Logout and activity
    // ------------------------------------------------------------------

    /// Explicit logout: invoke client logout, move to `disconnected`, tear
    /// down the registry entry and remove on-disk credentials
    pub async fn logout(&self, key: &TenantKey) -> Result<SessionRecord> {
        let record = self.get_status(key).await?;
        let session_id = record.session_id;
        self.logout_pending.insert(session_id, ());

        match self.apply_event(session_id, SessionEvent::LogoutRequested).await {
            Some(record) => Ok(record),
            None => {
                self.logout_pending.remove(&session_id);
                Err(MsghubError::session_not_ready(record.status))
            }
        }
    }

    /// Bump the session's activity timestamp
    pub async fn touch(&self, session_id: SessionId) {
        let lock = self.record_lock(session_id);
        let _guard = lock.lock().await;

        if let Ok(Some(mut record)) = self.sessions.get(&session_id).await {
            record.touch(Timestamp::now());
            if let Err(err) = self.sessions.update(&record).await {
                error!(%session_id, error = %err, "activity persist failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Watch + audit plumbing
    // ------------------------------------------------------------------

    fn watch_sender(&self, session_id: SessionId, initial: SessionStatus) -> watch::Sender<SessionStatus> {
        self.status_watch
            .entry(session_id)
            .or_insert_with(|| watch::channel(initial).0)
            .clone()
    }

    fn notify_status(&self, session_id: SessionId, status: SessionStatus) {
        let sender = self.watch_sender(session_id, status);
        sender.send_replace(status);
    }

    /// Subscribe to a session's status changes
    pub fn watch_status(&self, session_id: SessionId, current: SessionStatus) -> watch::Receiver<SessionStatus> {
        self.watch_sender(session_id, current).subscribe()
    }

    fn push_audit(&self, entry: AuditEntry) {
        let mut audit = self.audit.lock().unwrap();
        audit.push_back(entry);
        while audit.len() > self.config.audit_trail_limit {
            audit.pop_front();
        }
    }

    /// Most recent transition audit entries, oldest first
    pub fn recent_audit(&self, limit: usize) -> Vec<AuditEntry> {
        let audit = self.audit.lock().unwrap();
        let skip = audit.len().saturating_sub(limit);
        audit.iter().skip(skip).cloned().collect()
    }
}

/// Map an external client event onto a session lifecycle event
fn map_client_event(event: ClientEvent) -> SessionEvent {
    match event {
        ClientEvent::Qr { payload } => SessionEvent::ClientQr { payload },
        ClientEvent::Authenticated => SessionEvent::ClientAuthenticated,
        ClientEvent::LoadingScreen => SessionEvent::ClientLoading,
        ClientEvent::Ready {
            phone_number,
            display_name,
        } => SessionEvent::ClientReady {
            phone_number,
            display_name,
        },
        ClientEvent::AuthFailure { reason } => SessionEvent::ClientAuthFailure { reason },
        ClientEvent::Disconnected { reason } => SessionEvent::ClientDisconnected { reason },
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
