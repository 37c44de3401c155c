//! Error types for msghub
//!
//! This module contains all error types used throughout the core and runtime,
//! including session lifecycle errors, client connection errors, sync errors,
//! and the main MsghubError type that unifies them all. Every error maps to a
//! coarse status class plus a remediation hint so operators can self-service
//! without reading logs.

use crate::session::SessionStatus;
use crate::types::SessionId;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Session record and lifecycle errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No session found for {tenant_id}/{place_id}")]
    SessionNotFound {
        tenant_id: String,
        place_id: String,
    },
    #[error("Session is not ready for this operation (current status: {status})")]
    SessionNotReady { status: SessionStatus },
    #[error("Contact synchronization already in progress for session {session_id}")]
    SyncInProgress { session_id: SessionId },
    #[error("Invalid transition from {from} on {event}")]
    InvalidTransition { from: SessionStatus, event: String },
}

/// Live client connection errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("No live client for session {session_id}")]
    ClientUnavailable { session_id: SessionId },
    #[error("Client recreation for session {session_id} timed out after {timeout_ms}ms")]
    RecreationTimeout {
        session_id: SessionId,
        timeout_ms: u64,
    },
    #[error("Client authentication failed: {reason}")]
    AuthFailure { reason: String },
    #[error("Client transport failure: {reason}")]
    Transport { reason: String },
}

/// Contact synchronization errors
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Contact fetch failed: {reason}")]
    Fetch { reason: String },
}

/// Durable store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store backend error: {reason}")]
    Backend { reason: String },
    #[error("Record not found: {entity} {id}")]
    RecordMissing { entity: &'static str, id: String },
}

// ----------------------------------------------------------------------------
// Unified Error Type
// ----------------------------------------------------------------------------

/// Core error type for msghub
#[derive(Debug, thiserror::Error)]
pub enum MsghubError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Sync failed: {0}")]
    Sync(#[from] SyncError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Malformed contact or group input from a collaborator; non-fatal during
    /// synchronization (logged and skipped)
    #[error("Validation error: {reason}")]
    Validation { reason: String },
}

// ----------------------------------------------------------------------------
// Status Classification
// ----------------------------------------------------------------------------

/// Coarse status class for an error, suitable for mapping onto an HTTP-style
/// response class by an outer layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Unavailable,
    Invalid,
    Internal,
}

impl MsghubError {
    /// Classify this error into a coarse status class
    pub fn kind(&self) -> ErrorKind {
        match self {
            MsghubError::Session(SessionError::SessionNotFound { .. }) => ErrorKind::NotFound,
            MsghubError::Session(SessionError::SyncInProgress { .. }) => ErrorKind::Conflict,
            MsghubError::Session(_) => ErrorKind::Conflict,
            MsghubError::Client(_) => ErrorKind::Unavailable,
            MsghubError::Sync(_) => ErrorKind::Internal,
            MsghubError::Store(StoreError::RecordMissing { .. }) => ErrorKind::NotFound,
            MsghubError::Store(_) => ErrorKind::Internal,
            MsghubError::Validation { .. } => ErrorKind::Invalid,
        }
    }

    /// Human-readable remediation hint for operators
    pub fn remediation(&self) -> &'static str {
        match self {
            MsghubError::Session(SessionError::SessionNotFound { .. }) => {
                "Initiate a new session for this tenant and place"
            }
            MsghubError::Session(SessionError::SessionNotReady { .. }) => {
                "Wait for the session to reach the ready state or restart it"
            }
            MsghubError::Session(SessionError::SyncInProgress { .. }) => {
                "Wait for the running synchronization to finish before retrying"
            }
            MsghubError::Session(SessionError::InvalidTransition { .. }) => {
                "Restart the session if it is stuck in an unexpected state"
            }
            MsghubError::Client(ClientError::ClientUnavailable { .. }) => {
                "Restart the session to establish a new client connection"
            }
            MsghubError::Client(ClientError::RecreationTimeout { .. }) => {
                "Retry later; if the timeout persists, restart the session"
            }
            MsghubError::Client(ClientError::AuthFailure { .. }) => {
                "Re-initialize the session and scan the QR code again"
            }
            MsghubError::Client(ClientError::Transport { .. }) => "Retry later",
            MsghubError::Sync(_) => {
                "The session remains usable; retry the synchronization later"
            }
            MsghubError::Store(_) => "Check store connectivity and retry",
            MsghubError::Validation { .. } => "Correct the input and retry",
        }
    }
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl MsghubError {
    /// Create a session-not-found error for a tenant key
    pub fn session_not_found(key: &crate::types::TenantKey) -> Self {
        MsghubError::Session(SessionError::SessionNotFound {
            tenant_id: key.tenant_id.clone(),
            place_id: key.place_id.clone(),
        })
    }

    /// Create a session-not-ready error carrying the current status
    pub fn session_not_ready(status: SessionStatus) -> Self {
        MsghubError::Session(SessionError::SessionNotReady { status })
    }

    /// Create a sync-in-progress error
    pub fn sync_in_progress(session_id: SessionId) -> Self {
        MsghubError::Session(SessionError::SyncInProgress { session_id })
    }

    /// Create a client-unavailable error
    pub fn client_unavailable(session_id: SessionId) -> Self {
        MsghubError::Client(ClientError::ClientUnavailable { session_id })
    }

    /// Create a fetch-level sync error
    pub fn sync_fetch<R: Into<String>>(reason: R) -> Self {
        MsghubError::Sync(SyncError::Fetch {
            reason: reason.into(),
        })
    }

    /// Create a store backend error
    pub fn store_backend<R: Into<String>>(reason: R) -> Self {
        MsghubError::Store(StoreError::Backend {
            reason: reason.into(),
        })
    }

    /// Create a validation error
    pub fn validation<R: Into<String>>(reason: R) -> Self {
        MsghubError::Validation {
            reason: reason.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, MsghubError>;
pub type MsghubResult<T> = Result<T>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TenantKey;

    #[test]
    fn error_kinds_map_to_status_classes() {
        let key = TenantKey::new("t", "p");
        assert_eq!(
            MsghubError::session_not_found(&key).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            MsghubError::sync_in_progress(SessionId::generate()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            MsghubError::client_unavailable(SessionId::generate()).kind(),
            ErrorKind::Unavailable
        );
        assert_eq!(MsghubError::sync_fetch("boom").kind(), ErrorKind::Internal);
        assert_eq!(MsghubError::validation("bad").kind(), ErrorKind::Invalid);
    }

    #[test]
    fn not_ready_error_carries_current_status() {
        let err = MsghubError::session_not_ready(SessionStatus::QrReady);
        assert!(err.to_string().contains("qr_ready"));
    }

    #[test]
    fn every_error_has_a_remediation_hint() {
        let errors = vec![
            MsghubError::session_not_found(&TenantKey::new("t", "p")),
            MsghubError::session_not_ready(SessionStatus::Initializing),
            MsghubError::sync_in_progress(SessionId::generate()),
            MsghubError::client_unavailable(SessionId::generate()),
            MsghubError::sync_fetch("x"),
            MsghubError::store_backend("x"),
            MsghubError::validation("x"),
        ];
        for err in errors {
            assert!(!err.remediation().is_empty());
        }
    }
}
