//! Core types for msghub
//!
//! This module defines the fundamental identifier and time types used
//! throughout the system, using newtype patterns for semantic validation
//! and type safety.

use core::fmt;
use core::ops::{Add, Sub};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ----------------------------------------------------------------------------
// Tenant Key
// ----------------------------------------------------------------------------

/// Identifies the owner of a session: one messaging identity per
/// (tenant, place) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantKey {
    pub tenant_id: String,
    pub place_id: String,
}

impl TenantKey {
    pub fn new(tenant_id: impl Into<String>, place_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            place_id: place_id.into(),
        }
    }
}

impl fmt::Display for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.place_id)
    }
}

// ----------------------------------------------------------------------------
// Session Identifier
// ----------------------------------------------------------------------------

/// Opaque unique identifier for a session record and its live client binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    /// Generate a fresh session identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

// ----------------------------------------------------------------------------
// Contact Identifier
// ----------------------------------------------------------------------------

/// Deterministic contact identifier derived from (tenant, place, external id).
///
/// Repeated observation of the same external contact always resolves to the
/// same record, so synchronization can never create duplicates.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContactId(String);

impl ContactId {
    /// Derive the identifier from the tenant key and the contact's external id
    pub fn derive(key: &TenantKey, external_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(key.tenant_id.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(key.place_id.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(external_id.as_bytes());
        let digest = hasher.finalize();
        // 16 bytes of the digest is plenty of collision margin for a
        // per-tenant contact directory
        Self(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Group Identifier
// ----------------------------------------------------------------------------

/// Unique identifier for a derived or manual contact group
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(uuid::Uuid);

impl GroupId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Milliseconds since the UNIX epoch
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Create a new timestamp from epoch milliseconds
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Get the current wall-clock timestamp
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Elapsed time since `earlier` (zero if `earlier` is in the future)
    pub fn elapsed_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    /// Timestamp shifted back by `duration` (saturating at the epoch)
    pub fn checked_back(&self, duration: Duration) -> Timestamp {
        Timestamp(self.0.saturating_sub(duration.as_millis() as u64))
    }
}

impl Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, millis: u64) -> Timestamp {
        Timestamp(self.0 + millis)
    }
}

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

// ----------------------------------------------------------------------------
// Time Source
// ----------------------------------------------------------------------------

/// Source of current time, injectable so recency-window math and activity
/// tracking are deterministic under test
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time source used in production
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Fixed time source for tests; the reported instant can be advanced manually
#[derive(Debug, Default)]
pub struct FixedTimeSource {
    millis: std::sync::atomic::AtomicU64,
}

impl FixedTimeSource {
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: std::sync::atomic::AtomicU64::new(start.as_millis()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.millis.fetch_add(
            duration.as_millis() as u64,
            std::sync::atomic::Ordering::SeqCst,
        );
    }

    pub fn set(&self, instant: Timestamp) {
        self.millis
            .store(instant.as_millis(), std::sync::atomic::Ordering::SeqCst);
    }
}

impl TimeSource for FixedTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.millis.load(std::sync::atomic::Ordering::SeqCst))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
