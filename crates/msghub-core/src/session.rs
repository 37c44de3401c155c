//! Session lifecycle state machine
//!
//! Models a messaging session's connection lifecycle as pure transition
//! functions `(status, event) -> (new status, effects)`. The runtime applies
//! the resulting effects (registry cleanup, group creation, client logout);
//! the record-local effects mutate the durable `SessionRecord`. Replaying
//! synthetic events exercises the whole machine without a live connection.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::SessionError;
use crate::types::{SessionId, TenantKey, Timestamp};

// ----------------------------------------------------------------------------
// Session Status
// ----------------------------------------------------------------------------

/// Lifecycle status of a session record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    QrReady,
    Loading,
    Authenticated,
    Ready,
    FetchingContacts,
    Completed,
    Disconnected,
    Error,
}

impl SessionStatus {
    /// Status name in wire form, used in errors and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::QrReady => "qr_ready",
            SessionStatus::Loading => "loading",
            SessionStatus::Authenticated => "authenticated",
            SessionStatus::Ready => "ready",
            SessionStatus::FetchingContacts => "fetching_contacts",
            SessionStatus::Completed => "completed",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Error => "error",
        }
    }

    /// States counted as "active": at most one record per tenant key may be
    /// in one of these at a time
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionStatus::Authenticated
                | SessionStatus::Ready
                | SessionStatus::FetchingContacts
                | SessionStatus::Completed
        )
    }

    /// States from which a synchronization run may be started
    pub fn sync_eligible(&self) -> bool {
        matches!(self, SessionStatus::Ready | SessionStatus::Completed)
    }

    /// States in which outbound messages may be sent
    pub fn can_send_messages(&self) -> bool {
        matches!(
            self,
            SessionStatus::Ready | SessionStatus::FetchingContacts | SessionStatus::Completed
        )
    }

    /// Resting states: no live connection is expected to exist
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Disconnected | SessionStatus::Error)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Session Events
// ----------------------------------------------------------------------------

/// Events driving session lifecycle transitions. Client-originated events are
/// mapped from the external connection's event stream; the rest are issued by
/// the lifecycle controller itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Client produced a QR payload for pairing
    ClientQr { payload: String },
    /// Client is loading a restored session
    ClientLoading,
    /// Client authenticated against the messaging network
    ClientAuthenticated,
    /// Client connection is fully ready
    ClientReady {
        phone_number: Option<String>,
        display_name: Option<String>,
    },
    /// Client authentication failed
    ClientAuthFailure { reason: String },
    /// Client connection dropped
    ClientDisconnected { reason: String },
    /// Controller accepted a synchronization start request
    SyncStarted,
    /// Synchronization run finished successfully
    SyncCompleted { total_contacts: u64 },
    /// Synchronization run failed; the session stays usable for messaging
    SyncFailed { reason: String },
    /// Explicit logout requested by the user
    LogoutRequested,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::ClientQr { .. } => "client_qr",
            SessionEvent::ClientLoading => "client_loading",
            SessionEvent::ClientAuthenticated => "client_authenticated",
            SessionEvent::ClientReady { .. } => "client_ready",
            SessionEvent::ClientAuthFailure { .. } => "client_auth_failure",
            SessionEvent::ClientDisconnected { .. } => "client_disconnected",
            SessionEvent::SyncStarted => "sync_started",
            SessionEvent::SyncCompleted { .. } => "sync_completed",
            SessionEvent::SyncFailed { .. } => "sync_failed",
            SessionEvent::LogoutRequested => "logout_requested",
        }
    }
}

// ----------------------------------------------------------------------------
// Transition Effects
// ----------------------------------------------------------------------------

/// Effects produced by a transition. Record-local effects are applied by
/// `SessionRecord::apply_transition`; the rest are executed by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionEffect {
    /// Persist the QR payload on the record
    SetQr(String),
    /// Clear any stored QR payload
    ClearQr,
    /// Persist phone number / display name and stamp `connected_at`
    RecordReadyInfo {
        phone_number: Option<String>,
        display_name: Option<String>,
    },
    /// Persist a failure reason on the record
    RecordLastError(String),
    /// Reset sync bookkeeping for a new run
    BeginSync,
    /// Finalize sync bookkeeping with the run's totals
    CompleteSync { total_contacts: u64 },
    /// Record a failed sync without leaving the messaging-capable state
    RecordSyncFailure(String),
    /// Runtime: create the two canonical derived groups (idempotent)
    EnsureCanonicalGroups,
    /// Runtime: tear down the registry entry; optionally remove credentials
    CleanupClient { remove_credentials: bool },
    /// Runtime: invoke client logout/destroy
    LogoutClient,
}

impl TransitionEffect {
    /// Whether this effect mutates only the session record itself
    pub fn is_record_local(&self) -> bool {
        !matches!(
            self,
            TransitionEffect::EnsureCanonicalGroups
                | TransitionEffect::CleanupClient { .. }
                | TransitionEffect::LogoutClient
        )
    }
}

/// Result of a state transition
#[derive(Debug, Clone)]
pub struct StatusTransition {
    pub from: SessionStatus,
    pub to: SessionStatus,
    pub event_name: &'static str,
    pub effects: Vec<TransitionEffect>,
}

/// Audit trail entry for applied transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: Timestamp,
    pub session_id: SessionId,
    pub from_status: SessionStatus,
    pub to_status: SessionStatus,
    pub event: String,
}

// ----------------------------------------------------------------------------
// State Machine
// ----------------------------------------------------------------------------

impl SessionStatus {
    /// Process an event and compute the resulting status and effects.
    ///
    /// Invalid combinations return an error and leave the caller's status
    /// untouched; the runtime logs and drops them rather than crashing the
    /// client's event path.
    pub fn transition(
        self,
        event: &SessionEvent,
    ) -> core::result::Result<StatusTransition, SessionError> {
        use SessionEvent as E;
        use SessionStatus as S;
        use TransitionEffect as Fx;

        let (to, effects) = match (self, event) {
            // Pairing: QR codes may be re-issued while waiting, and loading
            // and qr_ready alternate when a restored session is probed
            (S::Initializing | S::QrReady | S::Loading, E::ClientQr { payload }) => {
                (S::QrReady, vec![Fx::SetQr(payload.clone())])
            }
            (S::Initializing | S::QrReady, E::ClientLoading) => (S::Loading, vec![Fx::ClearQr]),
            (S::Loading, E::ClientLoading) => (S::Loading, vec![]),

            (S::Initializing | S::QrReady | S::Loading, E::ClientAuthenticated) => {
                (S::Authenticated, vec![Fx::ClearQr])
            }

            // Some clients skip the authenticated notification when restoring
            // a persisted session, so ready is accepted from any pairing
            // state; it also brings a transiently disconnected session back
            (
                S::Initializing
                | S::QrReady
                | S::Loading
                | S::Authenticated
                | S::Ready
                | S::Disconnected,
                E::ClientReady {
                    phone_number,
                    display_name,
                },
            ) => (
                S::Ready,
                vec![
                    Fx::ClearQr,
                    Fx::RecordReadyInfo {
                        phone_number: phone_number.clone(),
                        display_name: display_name.clone(),
                    },
                    Fx::EnsureCanonicalGroups,
                ],
            ),

            // A recreated client reporting ready does not demote a completed
            // session back to ready
            (
                S::Completed,
                E::ClientReady {
                    phone_number,
                    display_name,
                },
            ) => (
                S::Completed,
                vec![
                    Fx::ClearQr,
                    Fx::RecordReadyInfo {
                        phone_number: phone_number.clone(),
                        display_name: display_name.clone(),
                    },
                    Fx::EnsureCanonicalGroups,
                ],
            ),

            (s, E::ClientAuthFailure { reason }) if !s.is_terminal() => (
                S::Error,
                vec![
                    Fx::ClearQr,
                    Fx::RecordLastError(reason.clone()),
                    Fx::CleanupClient {
                        remove_credentials: true,
                    },
                ],
            ),

            // Transient disconnect keeps credentials on disk so the session
            // can be restored without re-pairing
            (s, E::ClientDisconnected { reason }) if !s.is_terminal() => (
                S::Disconnected,
                vec![
                    Fx::ClearQr,
                    Fx::RecordLastError(reason.clone()),
                    Fx::CleanupClient {
                        remove_credentials: false,
                    },
                ],
            ),
            // Duplicate disconnect notifications are a no-op
            (S::Disconnected, E::ClientDisconnected { .. }) => (S::Disconnected, vec![]),

            (S::Ready | S::Completed, E::SyncStarted) => {
                (S::FetchingContacts, vec![Fx::BeginSync])
            }
            (S::FetchingContacts, E::SyncCompleted { total_contacts }) => (
                S::Completed,
                vec![Fx::CompleteSync {
                    total_contacts: *total_contacts,
                }],
            ),
            // A failed sync reverts to ready, not error: messaging only
            // requires a live connection, not a successful sync
            (S::FetchingContacts, E::SyncFailed { reason }) => {
                (S::Ready, vec![Fx::RecordSyncFailure(reason.clone())])
            }

            // Logout is accepted from any state; effects are idempotent
            (_, E::LogoutRequested) => (
                S::Disconnected,
                vec![
                    Fx::ClearQr,
                    Fx::LogoutClient,
                    Fx::CleanupClient {
                        remove_credentials: true,
                    },
                ],
            ),

            (s, event) => {
                return Err(SessionError::InvalidTransition {
                    from: s,
                    event: event.name().to_string(),
                })
            }
        };

        Ok(StatusTransition {
            from: self,
            to,
            event_name: event.name(),
            effects,
        })
    }
}

// ----------------------------------------------------------------------------
// Session Record
// ----------------------------------------------------------------------------

/// Durable record of a session: one per (tenant, place) pair currently or
/// most recently active. Never physically deleted; superseded records are
/// left behind in disconnected/error status for history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub tenant_id: String,
    pub place_id: String,
    pub status: SessionStatus,

    /// Present only while status is `qr_ready`
    pub qr_code: Option<String>,
    pub phone_number: Option<String>,
    pub display_name: Option<String>,
    /// Most recent auth-failure or disconnect reason
    pub last_error: Option<String>,

    pub contacts_fetch_progress: u8,
    pub contacts_fetch_completed: bool,
    pub contacts_fetch_error: Option<String>,
    pub total_contacts: u64,
    pub last_contacts_sync: Option<Timestamp>,

    pub connected_at: Option<Timestamp>,
    pub last_activity: Timestamp,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl SessionRecord {
    /// Create a fresh record in `initializing` status
    pub fn new(key: &TenantKey, now: Timestamp) -> Self {
        Self {
            session_id: SessionId::generate(),
            tenant_id: key.tenant_id.clone(),
            place_id: key.place_id.clone(),
            status: SessionStatus::Initializing,
            qr_code: None,
            phone_number: None,
            display_name: None,
            last_error: None,
            contacts_fetch_progress: 0,
            contacts_fetch_completed: false,
            contacts_fetch_error: None,
            total_contacts: 0,
            last_contacts_sync: None,
            connected_at: None,
            last_activity: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn tenant_key(&self) -> TenantKey {
        TenantKey::new(self.tenant_id.clone(), self.place_id.clone())
    }

    /// Apply a computed transition: set the new status, run record-local
    /// effects, and return an audit entry. Runtime effects are left in the
    /// transition for the caller to execute.
    pub fn apply_transition(&mut self, transition: &StatusTransition, now: Timestamp) -> AuditEntry {
        self.status = transition.to;
        for effect in &transition.effects {
            self.apply_effect(effect, now);
        }
        self.last_activity = now;
        self.updated_at = now;

        AuditEntry {
            timestamp: now,
            session_id: self.session_id,
            from_status: transition.from,
            to_status: transition.to,
            event: transition.event_name.to_string(),
        }
    }

    fn apply_effect(&mut self, effect: &TransitionEffect, now: Timestamp) {
        match effect {
            TransitionEffect::SetQr(payload) => self.qr_code = Some(payload.clone()),
            TransitionEffect::ClearQr => self.qr_code = None,
            TransitionEffect::RecordReadyInfo {
                phone_number,
                display_name,
            } => {
                if phone_number.is_some() {
                    self.phone_number = phone_number.clone();
                }
                if display_name.is_some() {
                    self.display_name = display_name.clone();
                }
                self.connected_at = Some(now);
                self.last_error = None;
            }
            TransitionEffect::RecordLastError(reason) => self.last_error = Some(reason.clone()),
            TransitionEffect::BeginSync => self.reset_sync_bookkeeping(),
            TransitionEffect::CompleteSync { total_contacts } => {
                self.contacts_fetch_progress = 100;
                self.contacts_fetch_completed = true;
                self.contacts_fetch_error = None;
                self.total_contacts = *total_contacts;
                self.last_contacts_sync = Some(now);
            }
            TransitionEffect::RecordSyncFailure(reason) => {
                self.contacts_fetch_completed = false;
                self.contacts_fetch_error = Some(reason.clone());
            }
            // Runtime effects: executed by the lifecycle controller
            TransitionEffect::EnsureCanonicalGroups
            | TransitionEffect::CleanupClient { .. }
            | TransitionEffect::LogoutClient => {}
        }
    }

    /// Reset sync bookkeeping at the start of a run
    pub fn reset_sync_bookkeeping(&mut self) {
        self.contacts_fetch_progress = 0;
        self.contacts_fetch_completed = false;
        self.contacts_fetch_error = None;
    }

    /// Record progress of an in-flight sync run without a status transition.
    /// Progress never moves backwards.
    pub fn record_sync_progress(&mut self, progress: u8, now: Timestamp) {
        self.contacts_fetch_progress = self.contacts_fetch_progress.max(progress.min(100));
        self.updated_at = now;
    }

    /// Bump the activity timestamp (e.g. on outbound message send)
    pub fn touch(&mut self, now: Timestamp) {
        self.last_activity = now;
        self.updated_at = now;
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
