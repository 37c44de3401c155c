//! Contact synchronization engine
//!
//! Pulls the full directory from a live client and merges it cumulatively
//! into the contact store: existing contacts are enriched, never overwritten
//! with blanks, and nothing is ever deleted because it stopped appearing in
//! a fetch. After the merge both canonical auto groups are recomputed from a
//! fresh store snapshot.
//!
//! Progress flows over an unbounded channel so observers see updates in emit
//! order without the engine ever blocking on a slow consumer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use msghub_core::client::MessagingClient;
use msghub_core::config::SyncConfig;
use msghub_core::contact::{Contact, MergeOutcome, RawContact};
use msghub_core::errors::{ErrorKind, MsghubError, Result, SyncError};
use msghub_core::group::{ALL_CONTACTS_GROUP, RECENT_CONTACTS_GROUP};
use msghub_core::store::{ContactStore, GroupStore};
use msghub_core::types::{ContactId, SystemTimeSource, TenantKey, TimeSource};
use msghub_core::{FilterCriteria, GroupType};

// ----------------------------------------------------------------------------
// Progress Reporting
// ----------------------------------------------------------------------------

/// Stage of an in-flight synchronization run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStage {
    ProcessingContacts,
    Completed,
    Error,
}

/// One progress update; emitted after each persisted batch and once at the
/// end (completed or error)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncProgress {
    pub stage: SyncStage,
    /// 0..=100
    pub progress: u8,
    pub processed: usize,
    pub total: usize,
    pub new_count: u64,
    pub updated_count: u64,
    pub error: Option<String>,
}

/// Longest external id the engine will accept; anything beyond this is a
/// corrupt directory entry, not a real address
const MAX_EXTERNAL_ID_LEN: usize = 256;

pub type ProgressSender = mpsc::UnboundedSender<SyncProgress>;
pub type ProgressReceiver = mpsc::UnboundedReceiver<SyncProgress>;

/// Final tally of a completed run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub new_contacts: u64,
    pub updated_contacts: u64,
    pub skipped_contacts: u64,
    /// Active contacts for the tenant after the merge (cumulative count, not
    /// just this fetch)
    pub total_contacts: u64,
    pub contacts_in_window: u64,
}

// ----------------------------------------------------------------------------
// Sync Engine
// ----------------------------------------------------------------------------

pub struct ContactSyncEngine {
    contacts: Arc<dyn ContactStore>,
    groups: Arc<dyn GroupStore>,
    config: SyncConfig,
    time: Arc<dyn TimeSource>,
}

impl ContactSyncEngine {
    pub fn new(
        contacts: Arc<dyn ContactStore>,
        groups: Arc<dyn GroupStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            contacts,
            groups,
            config,
            time: Arc::new(SystemTimeSource),
        }
    }

    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    /// Run one full synchronization for a tenant: fetch, merge in batches,
    /// recompute the canonical groups. Any fatal failure (fetch or store)
    /// aborts the run and emits an error-stage progress update; a malformed
    /// individual contact is skipped and counted, not fatal.
    pub async fn sync(
        &self,
        client: &dyn MessagingClient,
        key: &TenantKey,
        progress: &ProgressSender,
    ) -> Result<SyncSummary> {
        match self.run(client, key, progress).await {
            Ok((summary, processed, total)) => {
                let _ = progress.send(SyncProgress {
                    stage: SyncStage::Completed,
                    progress: 100,
                    processed,
                    total,
                    new_count: summary.new_contacts,
                    updated_count: summary.updated_contacts,
                    error: None,
                });
                info!(
                    %key,
                    new = summary.new_contacts,
                    updated = summary.updated_contacts,
                    skipped = summary.skipped_contacts,
                    total = summary.total_contacts,
                    in_window = summary.contacts_in_window,
                    "synchronization complete"
                );
                Ok(summary)
            }
            Err(err) => {
                self.send_error(progress, &err.to_string());
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        client: &dyn MessagingClient,
        key: &TenantKey,
        progress: &ProgressSender,
    ) -> Result<(SyncSummary, usize, usize)> {
        let raw = client.get_contacts().await.map_err(|err| {
            MsghubError::Sync(SyncError::Fetch {
                reason: err.to_string(),
            })
        })?;

        let fetched = raw.len();
        let syncable: Vec<_> = raw.into_iter().filter(|r| r.is_syncable()).collect();
        let mut summary = SyncSummary {
            skipped_contacts: (fetched - syncable.len()) as u64,
            ..SyncSummary::default()
        };
        let total = syncable.len();
        info!(%key, fetched, syncable = total, "contact fetch complete");

        let mut processed = 0usize;
        for batch in syncable.chunks(self.config.batch_size) {
            for raw in batch {
                match self.merge_one(key, raw).await {
                    Ok(MergeOutcome::New) => summary.new_contacts += 1,
                    Ok(MergeOutcome::Updated) => summary.updated_contacts += 1,
                    // a single malformed contact never aborts the run
                    Err(err) if err.kind() == ErrorKind::Invalid => {
                        warn!(external_id = %raw.id, error = %err, "contact skipped");
                        summary.skipped_contacts += 1;
                    }
                    Err(err) => return Err(err),
                }
            }
            processed += batch.len();
            self.send_batch_progress(progress, processed, total, &summary);
        }

        let in_window = self.recompute_groups(key).await?;
        summary.contacts_in_window = in_window;
        summary.total_contacts = self.contacts.count_active(key).await?;
        Ok((summary, processed, total))
    }

    /// Merge one observation into the store, creating or enriching
    async fn merge_one(&self, key: &TenantKey, raw: &RawContact) -> Result<MergeOutcome> {
        if raw.id.len() > MAX_EXTERNAL_ID_LEN {
            return Err(MsghubError::validation(format!(
                "external id exceeds {MAX_EXTERNAL_ID_LEN} bytes"
            )));
        }
        let now = self.time.now();
        let contact_id = ContactId::derive(key, &raw.id);
        match self.contacts.get(&contact_id).await? {
            Some(mut existing) => {
                existing.merge_observation(raw, now);
                self.contacts.upsert(existing).await?;
                Ok(MergeOutcome::Updated)
            }
            None => {
                let contact = Contact::from_observation(key, raw, now);
                self.contacts.upsert(contact).await?;
                Ok(MergeOutcome::New)
            }
        }
    }

    /// Recompute both canonical auto groups from a fresh snapshot of active
    /// contacts. Returns the recent-window membership count.
    pub async fn recompute_groups(&self, key: &TenantKey) -> Result<u64> {
        let now = self.time.now();
        let days = self.config.recent_window_days;

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

        let snapshot = self.contacts.list_active(key).await?;

        let all_members = all.compute_members(&snapshot, now);
        let recent_members = recent.compute_members(&snapshot, now);
        let in_window = recent_members.len() as u64;
        debug!(
            %key,
            all = all_members.len(),
            recent = recent_members.len(),
            "auto group membership recomputed"
        );

        self.groups.replace_members(&all.group_id, all_members).await?;
        self.groups
            .replace_members(&recent.group_id, recent_members)
            .await?;
        Ok(in_window)
    }

    fn send_batch_progress(
        &self,
        progress: &ProgressSender,
        processed: usize,
        total: usize,
        summary: &SyncSummary,
    ) {
        let percent = if total == 0 {
            100
        } else {
            ((processed * 100) / total) as u8
        };
        let _ = progress.send(SyncProgress {
            stage: SyncStage::ProcessingContacts,
            progress: percent,
            processed,
            total,
            new_count: summary.new_contacts,
            updated_count: summary.updated_contacts,
            error: None,
        });
    }

    fn send_error(&self, progress: &ProgressSender, reason: &str) {
        warn!(reason, "synchronization failed");
        let _ = progress.send(SyncProgress {
            stage: SyncStage::Error,
            progress: 0,
            processed: 0,
            total: 0,
            new_count: 0,
            updated_count: 0,
            error: Some(reason.to_string()),
        });
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use msghub_core::client::mock::MockClient;
    use msghub_core::contact::{ContactStatus, RawContact};
    use msghub_core::store::{MemoryContactStore, MemoryGroupStore};
    use msghub_core::types::{FixedTimeSource, Timestamp};

    const DAY_MS: u64 = 86_400_000;

    fn key() -> TenantKey {
        TenantKey::new("t1", "p1")
    }

    fn raw(id: &str, name: &str) -> RawContact {
        RawContact {
            id: id.to_string(),
            name: Some(name.to_string()),
            number: Some("5511999".into()),
            ..Default::default()
        }
    }

    struct Rig {
        engine: ContactSyncEngine,
        contacts: Arc<MemoryContactStore>,
        groups: Arc<MemoryGroupStore>,
        time: Arc<FixedTimeSource>,
    }

    fn rig() -> Rig {
        let contacts = MemoryContactStore::shared();
        let groups = MemoryGroupStore::shared();
        let time = Arc::new(FixedTimeSource::new(Timestamp::new(100 * DAY_MS)));
        let engine = ContactSyncEngine::new(
            contacts.clone(),
            groups.clone(),
            SyncConfig::default(),
        )
        .with_time_source(time.clone());
        Rig {
            engine,
            contacts,
            groups,
            time,
        }
    }

    /// Contact store that can be flipped into failing upserts mid-run
    struct FlakyContactStore {
        inner: MemoryContactStore,
        fail_upserts: AtomicBool,
    }

    impl FlakyContactStore {
        fn shared() -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryContactStore::new(),
                fail_upserts: AtomicBool::new(false),
            })
        }
    }

    #[async_trait::async_trait]
    impl ContactStore for FlakyContactStore {
        async fn get(&self, contact_id: &ContactId) -> Result<Option<Contact>> {
            self.inner.get(contact_id).await
        }

        async fn upsert(&self, contact: Contact) -> Result<()> {
            if self.fail_upserts.load(Ordering::SeqCst) {
                return Err(MsghubError::store_backend("contact upsert rejected"));
            }
            self.inner.upsert(contact).await
        }

        async fn list_active(&self, key: &TenantKey) -> Result<Vec<Contact>> {
            self.inner.list_active(key).await
        }

        async fn count_active(&self, key: &TenantKey) -> Result<u64> {
            self.inner.count_active(key).await
        }

        async fn set_status(&self, contact_id: &ContactId, status: ContactStatus) -> Result<()> {
            self.inner.set_status(contact_id, status).await
        }
    }

    fn channel() -> (ProgressSender, ProgressReceiver) {
        mpsc::unbounded_channel()
    }

    fn drain(mut rx: ProgressReceiver) -> Vec<SyncProgress> {
        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        updates
    }

    #[tokio::test]
    async fn first_run_creates_then_second_run_updates() {
        let r = rig();
        let client = MockClient::new();
        client.set_contacts(vec![raw("a@c.us", "Alice"), raw("b@c.us", "Bob")]);

        let (tx, rx) = channel();
        let summary = r.engine.sync(&client, &key(), &tx).await.unwrap();
        assert_eq!(summary.new_contacts, 2);
        assert_eq!(summary.updated_contacts, 0);
        assert_eq!(summary.total_contacts, 2);
        drop(tx);
        let updates = drain(rx);
        assert_eq!(updates.last().unwrap().stage, SyncStage::Completed);

        // same fetch again: everything merges as an update, nothing new
        let (tx, _rx) = channel();
        let summary = r.engine.sync(&client, &key(), &tx).await.unwrap();
        assert_eq!(summary.new_contacts, 0);
        assert_eq!(summary.updated_contacts, 2);
        assert_eq!(summary.total_contacts, 2);
    }

    #[tokio::test]
    async fn contacts_absent_from_fetch_survive() {
        let r = rig();
        let client = MockClient::new();
        client.set_contacts(vec![raw("a@c.us", "Alice"), raw("b@c.us", "Bob")]);

        let (tx, _rx) = channel();
        r.engine.sync(&client, &key(), &tx).await.unwrap();

        // second fetch no longer contains Bob
        client.set_contacts(vec![raw("a@c.us", "Alice")]);
        let (tx, _rx) = channel();
        let summary = r.engine.sync(&client, &key(), &tx).await.unwrap();

        assert_eq!(summary.total_contacts, 2);
        let names: Vec<String> = r
            .contacts
            .list_active(&key())
            .await
            .unwrap()
            .iter()
            .map(|c| c.name.clone())
            .collect();
        assert!(names.contains(&"Bob".to_string()));
    }

    #[tokio::test]
    async fn merge_never_blanks_existing_fields() {
        let r = rig();
        let client = MockClient::new();
        client.set_contacts(vec![raw("a@c.us", "Alice")]);

        let (tx, _rx) = channel();
        r.engine.sync(&client, &key(), &tx).await.unwrap();

        // later fetch has lost the display name
        let mut nameless = raw("a@c.us", "");
        nameless.name = None;
        client.set_contacts(vec![nameless]);
        let (tx, _rx) = channel();
        r.engine.sync(&client, &key(), &tx).await.unwrap();

        let stored = r.contacts.list_active(&key()).await.unwrap();
        assert_eq!(stored[0].name, "Alice");
    }

    #[tokio::test]
    async fn groups_and_broadcasts_are_skipped() {
        let r = rig();
        let client = MockClient::new();
        let mut group_chat = raw("g@g.us", "Team");
        group_chat.is_group = true;
        let broadcast = raw("status@broadcast", "Status");
        let mut me = raw("me@c.us", "Me");
        me.is_me = true;
        client.set_contacts(vec![raw("a@c.us", "Alice"), group_chat, broadcast, me]);

        let (tx, _rx) = channel();
        let summary = r.engine.sync(&client, &key(), &tx).await.unwrap();
        assert_eq!(summary.new_contacts, 1);
        assert_eq!(summary.skipped_contacts, 3);
        assert_eq!(summary.total_contacts, 1);
    }

    #[tokio::test]
    async fn auto_groups_are_recomputed_each_run() {
        let r = rig();
        let client = MockClient::new();
        client.set_contacts(vec![raw("a@c.us", "Alice")]);

        let (tx, _rx) = channel();
        let summary = r.engine.sync(&client, &key(), &tx).await.unwrap();
        assert_eq!(summary.contacts_in_window, 1);

        let all = r
            .groups
            .find_by_name(&key(), ALL_CONTACTS_GROUP)
            .await
            .unwrap()
            .unwrap();
        let recent = r
            .groups
            .find_by_name(&key(), RECENT_CONTACTS_GROUP)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(all.contact_count(), 1);
        assert_eq!(recent.contact_count(), 1);

        // 91 days later without new interactions: Alice ages out of the
        // recent window but stays in All Contacts
        r.time.advance(std::time::Duration::from_millis(91 * DAY_MS));
        client.set_contacts(vec![]);
        let (tx, _rx) = channel();
        let summary = r.engine.sync(&client, &key(), &tx).await.unwrap();
        assert_eq!(summary.contacts_in_window, 0);
        assert_eq!(summary.total_contacts, 1);

        let recent = r
            .groups
            .find_by_name(&key(), RECENT_CONTACTS_GROUP)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recent.contact_count(), 0);
    }

    #[tokio::test]
    async fn manual_groups_are_left_alone() {
        let r = rig();
        let client = MockClient::new();
        client.set_contacts(vec![raw("a@c.us", "Alice")]);

        let manual = r
            .groups
            .find_or_create(
                &key(),
                "VIP Customers",
                "hand picked",
                GroupType::Manual,
                FilterCriteria::Manual,
                r.time.now(),
            )
            .await
            .unwrap();
        let pinned = vec![ContactId::derive(&key(), "vip@c.us")];
        r.groups
            .replace_members(&manual.group_id, pinned.clone())
            .await
            .unwrap();

        let (tx, _rx) = channel();
        r.engine.sync(&client, &key(), &tx).await.unwrap();

        let manual = r.groups.get(&manual.group_id).await.unwrap().unwrap();
        assert_eq!(manual.contact_refs, pinned);
    }

    #[tokio::test]
    async fn fetch_failure_emits_error_progress() {
        let r = rig();
        let client = MockClient::new();
        client.fail_contacts_with("directory unavailable");

        let (tx, rx) = channel();
        let err = r.engine.sync(&client, &key(), &tx).await.unwrap_err();
        assert!(matches!(err, MsghubError::Sync(SyncError::Fetch { .. })));

        drop(tx);
        let updates = drain(rx);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].stage, SyncStage::Error);
        assert!(updates[0].error.as_deref().unwrap().contains("directory unavailable"));
    }

    #[tokio::test]
    async fn store_failure_mid_merge_emits_error_progress() {
        let contacts = FlakyContactStore::shared();
        let groups = MemoryGroupStore::shared();
        let engine = ContactSyncEngine::new(contacts.clone(), groups, SyncConfig::default());
        let client = MockClient::new();
        client.set_contacts(vec![raw("a@c.us", "Alice")]);
        contacts.fail_upserts.store(true, Ordering::SeqCst);

        let (tx, rx) = channel();
        let err = engine.sync(&client, &key(), &tx).await.unwrap_err();
        assert!(matches!(err, MsghubError::Store(_)));

        drop(tx);
        let updates = drain(rx);
        let last = updates.last().unwrap();
        assert_eq!(last.stage, SyncStage::Error);
        assert!(last.error.as_deref().unwrap().contains("upsert rejected"));
    }

    #[tokio::test]
    async fn oversized_external_id_is_skipped_not_fatal() {
        let r = rig();
        let client = MockClient::new();
        let absurd_id = format!("{}@c.us", "x".repeat(300));
        client.set_contacts(vec![raw("a@c.us", "Alice"), raw(&absurd_id, "Noise")]);

        let (tx, rx) = channel();
        let summary = r.engine.sync(&client, &key(), &tx).await.unwrap();
        assert_eq!(summary.new_contacts, 1);
        assert_eq!(summary.skipped_contacts, 1);
        assert_eq!(summary.total_contacts, 1);

        drop(tx);
        let updates = drain(rx);
        assert_eq!(updates.last().unwrap().stage, SyncStage::Completed);
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_batched() {
        let r = rig();
        let client = MockClient::new();
        let contacts: Vec<RawContact> = (0..120)
            .map(|i| raw(&format!("c{i}@c.us"), &format!("Contact {i}")))
            .collect();
        client.set_contacts(contacts);

        let (tx, rx) = channel();
        r.engine.sync(&client, &key(), &tx).await.unwrap();
        drop(tx);

        let updates = drain(rx);
        // batch size 50 over 120 contacts: three batch updates plus completion
        assert_eq!(updates.len(), 4);
        let percents: Vec<u8> = updates.iter().map(|u| u.progress).collect();
        assert!(percents.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*percents.last().unwrap(), 100);
    }

    #[tokio::test]
    async fn empty_directory_still_completes() {
        let r = rig();
        let client = MockClient::new();

        let (tx, rx) = channel();
        let summary = r.engine.sync(&client, &key(), &tx).await.unwrap();
        assert_eq!(summary.new_contacts, 0);
        assert_eq!(summary.total_contacts, 0);

        drop(tx);
        let updates = drain(rx);
        assert_eq!(updates.last().unwrap().stage, SyncStage::Completed);
        assert_eq!(updates.last().unwrap().progress, 100);
    }
}
