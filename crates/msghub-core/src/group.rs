//! Derived contact groups
//!
//! Auto groups are a pure function of current contact state: membership is
//! always fully recomputed from a store query, never incrementally patched,
//! so contacts aging out of the recency window drop out without an explicit
//! removal step. Manual groups are user-managed and excluded from
//! recomputation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::contact::Contact;
use crate::types::{ContactId, GroupId, TenantKey, Timestamp};

/// Canonical auto-group names, created idempotently per tenant
pub const ALL_CONTACTS_GROUP: &str = "All Contacts";
pub const RECENT_CONTACTS_GROUP: &str = "Recent Contacts";

// ----------------------------------------------------------------------------
// Group Types
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    /// Recomputed after every synchronization run
    Auto,
    /// Created and edited directly by user action
    Manual,
}

/// Membership predicate for auto groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FilterCriteria {
    /// Every active contact of the tenant
    AllActive,
    /// Active contacts seen within a rolling window
    RecentWindow { days: u32 },
    /// No automatic membership; refs are user-managed
    Manual,
}

impl FilterCriteria {
    /// Whether `contact` belongs to a group with this criteria at `now`.
    ///
    /// The window boundary is strict: exactly `days` old is already out.
    pub fn matches(&self, contact: &Contact, now: Timestamp) -> bool {
        if !contact.is_active() {
            return false;
        }
        match self {
            FilterCriteria::AllActive => true,
            FilterCriteria::RecentWindow { days } => {
                in_recency_window(contact, now, window_duration(*days))
            }
            FilterCriteria::Manual => false,
        }
    }
}

/// Rolling window length for a day count
pub fn window_duration(days: u32) -> Duration {
    Duration::from_secs(u64::from(days) * 86_400)
}

/// Whether the contact's most recent sign of life falls strictly within the
/// window ending at `now`
pub fn in_recency_window(contact: &Contact, now: Timestamp, window: Duration) -> bool {
    let mut latest = contact.last_interaction.max(contact.created_at);
    if let Some(seen) = contact.last_seen {
        latest = latest.max(seen);
    }
    now.elapsed_since(latest) < window
}

// ----------------------------------------------------------------------------
// Derived Group
// ----------------------------------------------------------------------------

/// Named subset of a tenant's contacts. Holds ids only, never owning copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedGroup {
    pub group_id: GroupId,
    pub tenant_id: String,
    pub place_id: String,
    pub name: String,
    pub description: String,
    pub contact_refs: Vec<ContactId>,
    pub group_type: GroupType,
    pub filter_criteria: FilterCriteria,
    pub is_active: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl DerivedGroup {
    pub fn new(
        key: &TenantKey,
        name: impl Into<String>,
        description: impl Into<String>,
        group_type: GroupType,
        filter_criteria: FilterCriteria,
        now: Timestamp,
    ) -> Self {
        Self {
            group_id: GroupId::generate(),
            tenant_id: key.tenant_id.clone(),
            place_id: key.place_id.clone(),
            name: name.into(),
            description: description.into(),
            contact_refs: Vec::new(),
            group_type,
            filter_criteria,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// The canonical "All Contacts" auto group
    pub fn all_contacts(key: &TenantKey, now: Timestamp) -> Self {
        Self::new(
            key,
            ALL_CONTACTS_GROUP,
            "Every active contact",
            GroupType::Auto,
            FilterCriteria::AllActive,
            now,
        )
    }

    /// The canonical "Recent Contacts" auto group for a window of `days`
    pub fn recent_contacts(key: &TenantKey, days: u32, now: Timestamp) -> Self {
        Self::new(
            key,
            RECENT_CONTACTS_GROUP,
            format!("Contacts active in the last {days} days"),
            GroupType::Auto,
            FilterCriteria::RecentWindow { days },
            now,
        )
    }

    /// Compute this group's membership from a full contact snapshot
    pub fn compute_members(&self, contacts: &[Contact], now: Timestamp) -> Vec<ContactId> {
        contacts
            .iter()
            .filter(|c| self.filter_criteria.matches(c, now))
            .map(|c| c.contact_id.clone())
            .collect()
    }

    pub fn contact_count(&self) -> usize {
        self.contact_refs.len()
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
    use crate::contact::{ContactStatus, RawContact};

    fn key() -> TenantKey {
        TenantKey::new("t1", "p1")
    }

    fn contact_at(external_id: &str, last_interaction: Timestamp) -> Contact {
        let raw = RawContact {
            id: external_id.to_string(),
            number: Some("5511".into()),
            ..Default::default()
        };
        Contact::from_observation(&key(), &raw, last_interaction)
    }

    const DAY_MS: u64 = 86_400_000;

    #[test]
    fn window_boundary_is_exact() {
        let window = window_duration(90);
        let now = Timestamp::new(100 * DAY_MS);

        // 90 days minus one second ago: included
        let inside = contact_at("a@c.us", now.checked_back(window - Duration::from_secs(1)));
        assert!(in_recency_window(&inside, now, window));

        // 90 days plus one second ago: excluded
        let outside = contact_at("b@c.us", now.checked_back(window + Duration::from_secs(1)));
        assert!(!in_recency_window(&outside, now, window));

        // exactly 90 days ago: already out
        let boundary = contact_at("c@c.us", now.checked_back(window));
        assert!(!in_recency_window(&boundary, now, window));
    }

    #[test]
    fn recency_uses_most_recent_signal() {
        let window = window_duration(90);
        let now = Timestamp::new(200 * DAY_MS);

        // stale interaction but fresh last_seen keeps the contact recent
        let mut contact = contact_at("a@c.us", now.checked_back(window * 2));
        contact.last_seen = Some(now.checked_back(Duration::from_secs(60)));
        assert!(in_recency_window(&contact, now, window));
    }

    #[test]
    fn deleted_contacts_match_no_group() {
        let now = Timestamp::new(10 * DAY_MS);
        let mut contact = contact_at("a@c.us", now);
        contact.status = ContactStatus::Deleted;

        assert!(!FilterCriteria::AllActive.matches(&contact, now));
        assert!(!FilterCriteria::RecentWindow { days: 90 }.matches(&contact, now));
    }

    #[test]
    fn recent_is_subset_of_all() {
        let now = Timestamp::new(400 * DAY_MS);
        let contacts = vec![
            contact_at("fresh@c.us", now.checked_back(Duration::from_secs(3600))),
            contact_at("old@c.us", now.checked_back(window_duration(91))),
        ];

        let all = DerivedGroup::all_contacts(&key(), now).compute_members(&contacts, now);
        let recent =
            DerivedGroup::recent_contacts(&key(), 90, now).compute_members(&contacts, now);

        assert_eq!(all.len(), 2);
        assert_eq!(recent.len(), 1);
        assert!(recent.iter().all(|id| all.contains(id)));
    }

    #[test]
    fn manual_criteria_never_auto_matches() {
        let now = Timestamp::new(DAY_MS);
        let contact = contact_at("a@c.us", now);
        assert!(!FilterCriteria::Manual.matches(&contact, now));
    }
}
