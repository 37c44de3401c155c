//! msghub Runtime
//!
//! Stateful orchestration over `msghub-core`: the client registry, the
//! session lifecycle controller, the contact synchronization engine and the
//! service facade that ties them together. Everything here is built on tokio
//! tasks and channels; the pure decision logic lives in the core crate.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod lifecycle;
pub mod registry;
pub mod service;
pub mod sync;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use lifecycle::SessionLifecycleController;
pub use registry::{ClientRegistry, RegistryStats};
pub use service::{MsghubService, SessionStatusView};
pub use sync::{
    ContactSyncEngine, ProgressReceiver, ProgressSender, SyncProgress, SyncStage, SyncSummary,
};

// convenience re-exports for callers that only pull in the runtime crate
pub use msghub_core::{MsghubError, MsghubResult, Result};
