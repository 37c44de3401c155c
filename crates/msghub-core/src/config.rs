//! Configuration for msghub components

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Sync Configuration
// ----------------------------------------------------------------------------

/// Configuration for the contact synchronization engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Number of contacts merged per durable-store batch
    pub batch_size: usize,
    /// Rolling window (in days) for "Recent Contacts" membership
    pub recent_window_days: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            recent_window_days: 90,
        }
    }
}

impl SyncConfig {
    /// The recency window as a duration
    pub fn recent_window(&self) -> Duration {
        Duration::from_secs(u64::from(self.recent_window_days) * 86_400)
    }
}

// ----------------------------------------------------------------------------
// Registry Configuration
// ----------------------------------------------------------------------------

/// Configuration for the client registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Default idle threshold used by periodic eviction callers
    pub max_idle: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_idle: Duration::from_secs(30 * 60),
        }
    }
}

// ----------------------------------------------------------------------------
// Lifecycle Configuration
// ----------------------------------------------------------------------------

/// Configuration for the session lifecycle controller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Maximum time to wait for a recreated client to report ready
    pub recreation_timeout: Duration,
    /// Maximum number of retained state-transition audit entries
    pub audit_trail_limit: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            recreation_timeout: Duration::from_secs(30),
            audit_trail_limit: 1000,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
