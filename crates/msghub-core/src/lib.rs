//! msghub Core
//!
//! This crate provides the foundational types, the session lifecycle state
//! machine, the cumulative contact merge rules and the storage/client
//! abstractions for the msghub session manager. It contains no orchestration:
//! pure transition functions and trait definitions live here, while
//! `msghub-runtime` provides the stateful engine built on top of them.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod client;
pub mod config;
pub mod contact;
pub mod errors;
pub mod group;
pub mod session;
pub mod store;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use client::{
    ClientEvent, ClientFactory, ClientState, CredentialStore, MessageHandle, MessagingClient,
};
pub use contact::{Contact, ContactStatus, MergeOutcome, RawContact};
pub use errors::{ErrorKind, MsghubError, MsghubResult, Result};
pub use group::{DerivedGroup, FilterCriteria, GroupType};
pub use session::{
    AuditEntry, SessionEvent, SessionRecord, SessionStatus, StatusTransition, TransitionEffect,
};
pub use store::{
    ContactStore, GroupStore, MemoryContactStore, MemoryGroupStore, MemorySessionStore,
    SessionStore, StatusSwap,
};
pub use types::{
    ContactId, GroupId, SessionId, SystemTimeSource, TenantKey, TimeSource, Timestamp,
};
