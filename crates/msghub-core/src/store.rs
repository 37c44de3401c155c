//! Durable store abstractions
//!
//! Trait definitions over the Session, Contact and Derived Group entities,
//! plus in-memory reference implementations used for tests and as a fallback.
//! Any durable keyed store can back these traits; the only hard requirements
//! are atomic check-and-set on session status (the state-based mutex for
//! sync runs) and atomic find-or-create by group name (idempotent canonical
//! group creation).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::contact::{Contact, ContactStatus};
use crate::errors::Result;
use crate::group::{DerivedGroup, FilterCriteria, GroupType};
use crate::session::{SessionRecord, SessionStatus};
use crate::types::{ContactId, GroupId, SessionId, TenantKey, Timestamp};

// ----------------------------------------------------------------------------
// Session Store
// ----------------------------------------------------------------------------

/// Outcome of an atomic status check-and-set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSwap {
    /// Status was one of the expected values and has been replaced
    Swapped { from: SessionStatus },
    /// Status did not match; nothing changed
    Rejected { current: SessionStatus },
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, record: SessionRecord) -> Result<()>;

    async fn update(&self, record: &SessionRecord) -> Result<()>;

    async fn get(&self, session_id: &SessionId) -> Result<Option<SessionRecord>>;

    /// Most recent record for a tenant key, by creation time (supersession:
    /// history is retained, most-recent wins for lookups)
    async fn find_latest(&self, key: &TenantKey) -> Result<Option<SessionRecord>>;

    /// Most recent record in an active status, if any
    async fn find_active(&self, key: &TenantKey) -> Result<Option<SessionRecord>>;

    /// Atomically replace the status if it currently matches one of
    /// `expected`. This is the mutual-exclusion primitive guarding
    /// concurrent sync starts.
    async fn compare_and_swap_status(
        &self,
        session_id: &SessionId,
        expected: &[SessionStatus],
        next: SessionStatus,
    ) -> Result<StatusSwap>;
}

// ----------------------------------------------------------------------------
// Contact Store
// ----------------------------------------------------------------------------

#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn get(&self, contact_id: &ContactId) -> Result<Option<Contact>>;

    async fn upsert(&self, contact: Contact) -> Result<()>;

    /// All active contacts for a tenant key
    async fn list_active(&self, key: &TenantKey) -> Result<Vec<Contact>>;

    async fn count_active(&self, key: &TenantKey) -> Result<u64>;

    /// Soft delete or restore by explicit user action; synchronization never
    /// calls this
    async fn set_status(&self, contact_id: &ContactId, status: ContactStatus) -> Result<()>;
}

// ----------------------------------------------------------------------------
// Group Store
// ----------------------------------------------------------------------------

#[async_trait]
pub trait GroupStore: Send + Sync {
    /// Find a group by name or create it atomically; repeated calls with the
    /// same name return the same group
    async fn find_or_create(
        &self,
        key: &TenantKey,
        name: &str,
        description: &str,
        group_type: GroupType,
        criteria: FilterCriteria,
        now: Timestamp,
    ) -> Result<DerivedGroup>;

    async fn get(&self, group_id: &GroupId) -> Result<Option<DerivedGroup>>;

    async fn find_by_name(&self, key: &TenantKey, name: &str) -> Result<Option<DerivedGroup>>;

    async fn list(&self, key: &TenantKey) -> Result<Vec<DerivedGroup>>;

    /// Replace a group's membership wholesale (auto groups are recomputed,
    /// never patched)
    async fn replace_members(&self, group_id: &GroupId, refs: Vec<ContactId>) -> Result<()>;

    /// Soft-delete a manual group
    async fn deactivate(&self, group_id: &GroupId) -> Result<()>;
}

// ----------------------------------------------------------------------------
// In-Memory Implementations
// ----------------------------------------------------------------------------

/// In-memory session store for tests and fallback
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    records: RwLock<HashMap<SessionId, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert(&self, record: SessionRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.session_id, record);
        Ok(())
    }

    async fn update(&self, record: &SessionRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.session_id, record.clone());
        Ok(())
    }

    async fn get(&self, session_id: &SessionId) -> Result<Option<SessionRecord>> {
        Ok(self.records.read().await.get(session_id).cloned())
    }

    async fn find_latest(&self, key: &TenantKey) -> Result<Option<SessionRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.tenant_id == key.tenant_id && r.place_id == key.place_id)
            .max_by_key(|r| (r.created_at, r.session_id))
            .cloned())
    }

    async fn find_active(&self, key: &TenantKey) -> Result<Option<SessionRecord>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| {
                r.tenant_id == key.tenant_id
                    && r.place_id == key.place_id
                    && r.status.is_active()
            })
            .max_by_key(|r| (r.created_at, r.session_id))
            .cloned())
    }

    async fn compare_and_swap_status(
        &self,
        session_id: &SessionId,
        expected: &[SessionStatus],
        next: SessionStatus,
    ) -> Result<StatusSwap> {
        let mut records = self.records.write().await;
        let record = records.get_mut(session_id).ok_or_else(|| {
            crate::errors::MsghubError::Store(crate::errors::StoreError::RecordMissing {
                entity: "session",
                id: session_id.to_string(),
            })
        })?;

        if expected.contains(&record.status) {
            let from = record.status;
            record.status = next;
            record.updated_at = Timestamp::now();
            Ok(StatusSwap::Swapped { from })
        } else {
            Ok(StatusSwap::Rejected {
                current: record.status,
            })
        }
    }
}

/// In-memory contact store for tests and fallback
#[derive(Debug, Default)]
pub struct MemoryContactStore {
    contacts: RwLock<HashMap<ContactId, Contact>>,
}

impl MemoryContactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl ContactStore for MemoryContactStore {
    async fn get(&self, contact_id: &ContactId) -> Result<Option<Contact>> {
        Ok(self.contacts.read().await.get(contact_id).cloned())
    }

    async fn upsert(&self, contact: Contact) -> Result<()> {
        self.contacts
            .write()
            .await
            .insert(contact.contact_id.clone(), contact);
        Ok(())
    }

    async fn list_active(&self, key: &TenantKey) -> Result<Vec<Contact>> {
        let mut contacts: Vec<Contact> = self
            .contacts
            .read()
            .await
            .values()
            .filter(|c| {
                c.is_active() && c.tenant_id == key.tenant_id && c.place_id == key.place_id
            })
            .cloned()
            .collect();
        contacts.sort_by(|a, b| a.contact_id.cmp(&b.contact_id));
        Ok(contacts)
    }

    async fn count_active(&self, key: &TenantKey) -> Result<u64> {
        Ok(self.list_active(key).await?.len() as u64)
    }

    async fn set_status(&self, contact_id: &ContactId, status: ContactStatus) -> Result<()> {
        let mut contacts = self.contacts.write().await;
        let contact = contacts.get_mut(contact_id).ok_or_else(|| {
            crate::errors::MsghubError::Store(crate::errors::StoreError::RecordMissing {
                entity: "contact",
                id: contact_id.to_string(),
            })
        })?;
        contact.status = status;
        contact.updated_at = Timestamp::now();
        Ok(())
    }
}

/// In-memory group store for tests and fallback
#[derive(Debug, Default)]
pub struct MemoryGroupStore {
    groups: RwLock<HashMap<GroupId, DerivedGroup>>,
}

impl MemoryGroupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl GroupStore for MemoryGroupStore {
    async fn find_or_create(
        &self,
        key: &TenantKey,
        name: &str,
        description: &str,
        group_type: GroupType,
        criteria: FilterCriteria,
        now: Timestamp,
    ) -> Result<DerivedGroup> {
        // single write lock makes find-or-create atomic
        let mut groups = self.groups.write().await;
        if let Some(existing) = groups.values().find(|g| {
            g.tenant_id == key.tenant_id
                && g.place_id == key.place_id
                && g.name == name
                && g.is_active
        }) {
            return Ok(existing.clone());
        }

        let group = DerivedGroup::new(key, name, description, group_type, criteria, now);
        groups.insert(group.group_id, group.clone());
        Ok(group)
    }

    async fn get(&self, group_id: &GroupId) -> Result<Option<DerivedGroup>> {
        Ok(self.groups.read().await.get(group_id).cloned())
    }

    async fn find_by_name(&self, key: &TenantKey, name: &str) -> Result<Option<DerivedGroup>> {
        Ok(self
            .groups
            .read()
            .await
            .values()
            .find(|g| {
                g.tenant_id == key.tenant_id
                    && g.place_id == key.place_id
                    && g.name == name
                    && g.is_active
            })
            .cloned())
    }

    async fn list(&self, key: &TenantKey) -> Result<Vec<DerivedGroup>> {
        Ok(self
            .groups
            .read()
            .await
            .values()
            .filter(|g| g.tenant_id == key.tenant_id && g.place_id == key.place_id && g.is_active)
            .cloned()
            .collect())
    }

    async fn replace_members(&self, group_id: &GroupId, refs: Vec<ContactId>) -> Result<()> {
        let mut groups = self.groups.write().await;
        let group = groups.get_mut(group_id).ok_or_else(|| {
            crate::errors::MsghubError::Store(crate::errors::StoreError::RecordMissing {
                entity: "group",
                id: group_id.to_string(),
            })
        })?;
        group.contact_refs = refs;
        group.updated_at = Timestamp::now();
        Ok(())
    }

    async fn deactivate(&self, group_id: &GroupId) -> Result<()> {
        let mut groups = self.groups.write().await;
        let group = groups.get_mut(group_id).ok_or_else(|| {
            crate::errors::MsghubError::Store(crate::errors::StoreError::RecordMissing {
                entity: "group",
                id: group_id.to_string(),
            })
        })?;
        group.is_active = false;
        group.updated_at = Timestamp::now();
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
