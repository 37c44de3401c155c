//! Contact model and cumulative merge rules
//!
//! Synchronization is additive: a contact is created on first observation and
//! merged on every later one. Unknown or empty incoming fields never erase
//! previously stored data, and `last_interaction` only ever moves forward.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::types::{ContactId, TenantKey, Timestamp};

// ----------------------------------------------------------------------------
// Raw Contact (client wire shape)
// ----------------------------------------------------------------------------

/// Contact entry as returned by the external messaging client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawContact {
    /// External identifier, e.g. `5511999999999@c.us`
    pub id: String,
    pub name: Option<String>,
    /// Self-assigned display name on the messaging network
    pub pushname: Option<String>,
    pub number: Option<String>,
    pub is_business: bool,
    pub is_wa_contact: bool,
    pub is_group: bool,
    pub is_me: bool,
    pub last_seen: Option<Timestamp>,
    pub profile_picture_url: Option<String>,
}

impl RawContact {
    /// Whether this entry is a well-formed peer contact worth syncing.
    ///
    /// Broadcast lists, status updates, group chats, the account itself, and
    /// entries without a usable identifier or phone number are discarded.
    pub fn is_syncable(&self) -> bool {
        if self.is_group || self.is_me {
            return false;
        }
        if self.id.is_empty() || self.id.ends_with("@broadcast") || self.id.ends_with("@g.us") {
            return false;
        }
        match &self.number {
            Some(number) => !number.trim().is_empty(),
            None => false,
        }
    }

    /// Best available display name: saved name, then pushname, then number
    pub fn display_name(&self) -> String {
        non_empty(&self.name)
            .or_else(|| non_empty(&self.pushname))
            .or_else(|| non_empty(&self.number))
            .unwrap_or_else(|| self.id.clone())
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

// ----------------------------------------------------------------------------
// Stored Contact
// ----------------------------------------------------------------------------

/// Soft-delete status; synchronization never sets `Deleted`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    Active,
    Deleted,
}

/// Outcome of merging one observation into the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    New,
    Updated,
}

/// Durable contact record, one per (tenant, place, external id)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub contact_id: ContactId,
    pub tenant_id: String,
    pub place_id: String,
    pub external_id: String,

    pub name: String,
    pub phone_number: String,
    pub is_business: bool,
    pub profile_picture_url: Option<String>,

    pub last_seen: Option<Timestamp>,
    /// Bumped forward on every observation; never moves backwards
    pub last_interaction: Timestamp,

    pub status: ContactStatus,
    pub tags: BTreeSet<String>,

    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Contact {
    /// Create a contact from its first observation
    pub fn from_observation(key: &TenantKey, raw: &RawContact, now: Timestamp) -> Self {
        Self {
            contact_id: ContactId::derive(key, &raw.id),
            tenant_id: key.tenant_id.clone(),
            place_id: key.place_id.clone(),
            external_id: raw.id.clone(),
            name: raw.display_name(),
            phone_number: raw.number.clone().unwrap_or_default(),
            is_business: raw.is_business,
            profile_picture_url: non_empty(&raw.profile_picture_url),
            last_seen: raw.last_seen,
            last_interaction: now,
            status: ContactStatus::Active,
            tags: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Merge a fresh observation into this record.
    ///
    /// A newly observed value replaces the stored value only when it is
    /// non-empty; absent fields leave stored data untouched. `last_seen`
    /// only advances, and `last_interaction` is bumped to `now`.
    pub fn merge_observation(&mut self, raw: &RawContact, now: Timestamp) {
        if let Some(name) = non_empty(&raw.name).or_else(|| non_empty(&raw.pushname)) {
            self.name = name;
        }
        if let Some(number) = non_empty(&raw.number) {
            self.phone_number = number;
        }
        self.is_business = raw.is_business;
        if let Some(url) = non_empty(&raw.profile_picture_url) {
            self.profile_picture_url = Some(url);
        }
        if let Some(seen) = raw.last_seen {
            self.last_seen = Some(self.last_seen.map_or(seen, |prior| prior.max(seen)));
        }
        self.last_interaction = self.last_interaction.max(now);
        self.updated_at = now;
    }

    pub fn is_active(&self) -> bool {
        self.status == ContactStatus::Active
    }

    pub fn tenant_key(&self) -> TenantKey {
        TenantKey::new(self.tenant_id.clone(), self.place_id.clone())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> TenantKey {
        TenantKey::new("t1", "p1")
    }

    fn raw(id: &str, number: &str) -> RawContact {
        RawContact {
            id: id.to_string(),
            number: Some(number.to_string()),
            is_wa_contact: true,
            ..Default::default()
        }
    }

    #[test]
    fn filters_non_peer_entries() {
        assert!(raw("5511@c.us", "5511").is_syncable());

        let mut group = raw("123@g.us", "123");
        group.is_group = true;
        assert!(!group.is_syncable());

        let mut me = raw("5511@c.us", "5511");
        me.is_me = true;
        assert!(!me.is_syncable());

        assert!(!raw("status@broadcast", "1").is_syncable());
        assert!(!raw("", "5511").is_syncable());

        let mut no_number = raw("5511@c.us", "");
        assert!(!no_number.is_syncable());
        no_number.number = None;
        assert!(!no_number.is_syncable());
    }

    #[test]
    fn display_name_fallback_chain() {
        let mut c = raw("x@c.us", "5511");
        assert_eq!(c.display_name(), "5511");
        c.pushname = Some("Pusha".into());
        assert_eq!(c.display_name(), "Pusha");
        c.name = Some("Saved".into());
        assert_eq!(c.display_name(), "Saved");
    }

    #[test]
    fn empty_incoming_fields_never_erase() {
        let mut observed = raw("x@c.us", "5511");
        observed.name = Some("Alice".into());
        observed.profile_picture_url = Some("http://pic/x".into());

        let mut contact = Contact::from_observation(&key(), &observed, Timestamp::new(1_000));
        assert_eq!(contact.name, "Alice");
        assert_eq!(contact.profile_picture_url.as_deref(), Some("http://pic/x"));

        // second observation with unknown picture and blank name
        let mut sparse = raw("x@c.us", "5511");
        sparse.name = Some("   ".into());
        sparse.profile_picture_url = None;
        contact.merge_observation(&sparse, Timestamp::new(2_000));

        assert_eq!(contact.name, "Alice");
        assert_eq!(contact.profile_picture_url.as_deref(), Some("http://pic/x"));
        assert_eq!(contact.phone_number, "5511");
    }

    #[test]
    fn last_interaction_is_monotonic() {
        let observed = raw("x@c.us", "5511");
        let mut contact = Contact::from_observation(&key(), &observed, Timestamp::new(5_000));
        contact.merge_observation(&observed, Timestamp::new(3_000));
        assert_eq!(contact.last_interaction, Timestamp::new(5_000));
        contact.merge_observation(&observed, Timestamp::new(9_000));
        assert_eq!(contact.last_interaction, Timestamp::new(9_000));
    }

    #[test]
    fn last_seen_only_advances() {
        let mut observed = raw("x@c.us", "5511");
        observed.last_seen = Some(Timestamp::new(10_000));
        let mut contact = Contact::from_observation(&key(), &observed, Timestamp::new(10_000));

        observed.last_seen = Some(Timestamp::new(4_000));
        contact.merge_observation(&observed, Timestamp::new(11_000));
        assert_eq!(contact.last_seen, Some(Timestamp::new(10_000)));
    }

    #[test]
    fn same_external_id_resolves_to_same_contact_id() {
        let observed = raw("x@c.us", "5511");
        let a = Contact::from_observation(&key(), &observed, Timestamp::new(1));
        let b = Contact::from_observation(&key(), &observed, Timestamp::new(2));
        assert_eq!(a.contact_id, b.contact_id);
    }
}
