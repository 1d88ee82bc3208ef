//! In-memory local store for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use edgeclass_common::{Error, RecordRef, Result, SyncMarker};

use crate::outbox::{NewOutboxEntry, OutboxEntry, OutboxStats, OutboxStatus};
use crate::projection::Projection;
use crate::provider::{LocalStore, SettingsStore};
use crate::record::{RecordWrite, StoredRecord, WriteBatch};

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    outbox: BTreeMap<u64, OutboxEntry>,
    records: HashMap<RecordRef, StoredRecord>,
    settings: HashMap<String, String>,
}

impl Inner {
    fn append(&mut self, new: NewOutboxEntry) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.outbox.insert(id, OutboxEntry::from_new(id, new));
        id
    }

    fn entry_mut(&mut self, id: u64) -> Result<&mut OutboxEntry> {
        self.outbox
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("Outbox entry {}", id)))
    }

    fn project(&mut self, entry_id: u64, record: &RecordRef) -> Projection {
        let newer_unsynced = self.outbox.range(entry_id + 1..).any(|(_, e)| {
            e.record.as_ref() == Some(record) && e.status != OutboxStatus::Synced
        });

        match self.records.get_mut(record) {
            Some(stored) => {
                let projection = Projection::decide(true, newer_unsynced);
                if projection.is_applied() {
                    stored.sync_status = SyncMarker::Synced;
                }
                projection
            }
            None => Projection::decide(false, newer_unsynced),
        }
    }
}

/// In-memory local store.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn write_through(&self, batch: WriteBatch) -> Result<Vec<u64>> {
        let mut inner = self.inner.write().await;

        for write in batch.writes {
            match write {
                RecordWrite::Upsert { record, body } => {
                    inner.records.insert(
                        record.clone(),
                        StoredRecord {
                            record,
                            body,
                            sync_status: SyncMarker::Pending,
                            updated_at: batch.written_at,
                        },
                    );
                }
                RecordWrite::Delete { record } => {
                    inner.records.remove(&record);
                }
            }
        }

        Ok(batch
            .entries
            .into_iter()
            .map(|entry| inner.append(entry))
            .collect())
    }

    async fn enqueue(&self, entry: NewOutboxEntry) -> Result<u64> {
        Ok(self.inner.write().await.append(entry))
    }

    async fn list_eligible(&self, now: DateTime<Utc>) -> Result<Vec<OutboxEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .outbox
            .values()
            .filter(|e| e.is_eligible(now))
            .cloned()
            .collect())
    }

    async fn has_due_retries(&self, now: DateTime<Utc>) -> Result<bool> {
        let inner = self.inner.read().await;
        Ok(inner.outbox.values().any(|e| e.is_retry_due(now)))
    }

    async fn get_entry(&self, id: u64) -> Result<Option<OutboxEntry>> {
        Ok(self.inner.read().await.outbox.get(&id).cloned())
    }

    async fn list_entries(&self) -> Result<Vec<OutboxEntry>> {
        Ok(self.inner.read().await.outbox.values().cloned().collect())
    }

    async fn mark_synced(&self, id: u64, at: DateTime<Utc>) -> Result<Projection> {
        let mut inner = self.inner.write().await;

        let entry = inner.entry_mut(id)?;
        if entry.status != OutboxStatus::Synced {
            entry.status = OutboxStatus::Synced;
            entry.synced_at = Some(at);
            entry.next_retry_at = None;
        }

        match entry.record.clone() {
            Some(record) => Ok(inner.project(id, &record)),
            None => Ok(Projection::Untracked),
        }
    }

    async fn mark_retry(
        &self,
        id: u64,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner.entry_mut(id)?;
        entry.status = OutboxStatus::Pending;
        entry.retry_count = retry_count;
        entry.next_retry_at = Some(next_retry_at);
        entry.last_error = Some(last_error.to_string());
        Ok(())
    }

    async fn mark_failed(&self, id: u64, retry_count: u32, last_error: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        let entry = inner.entry_mut(id)?;
        entry.status = OutboxStatus::Failed;
        entry.retry_count = retry_count;
        entry.next_retry_at = None;
        entry.last_error = Some(last_error.to_string());
        Ok(())
    }

    async fn reset_failed(&self) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let mut reset = 0;
        for entry in inner.outbox.values_mut() {
            if entry.status == OutboxStatus::Failed {
                entry.status = OutboxStatus::Pending;
                entry.next_retry_at = None;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let inner = self.inner.read().await;
        let mut stats = OutboxStats::default();
        for entry in inner.outbox.values() {
            stats.record(entry.status);
        }
        Ok(stats)
    }

    async fn purge_synced_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let before = inner.outbox.len();
        inner.outbox.retain(|_, e| {
            !(e.status == OutboxStatus::Synced && e.synced_at.is_some_and(|at| at < cutoff))
        });
        Ok(before - inner.outbox.len())
    }

    async fn get_record(&self, record: &RecordRef) -> Result<Option<StoredRecord>> {
        Ok(self.inner.read().await.records.get(record).cloned())
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.read().await.settings.get(key).cloned())
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .write()
            .await
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::SyncMethod;
    use chrono::Duration;
    use edgeclass_common::{DeviceId, RecordKind};

    fn device() -> DeviceId {
        DeviceId::new("device-a").unwrap()
    }

    fn quiz_entry(id: &str, now: DateTime<Utc>) -> NewOutboxEntry {
        NewOutboxEntry::new(
            "/sync/quizzes",
            SyncMethod::Create,
            &serde_json::json!({ "id": id }),
            device(),
            now,
        )
        .unwrap()
        .for_record(RecordRef::new(RecordKind::Quiz, id))
    }

    async fn write_quiz(store: &MemoryStore, id: &str, now: DateTime<Utc>) -> u64 {
        let batch = WriteBatch::new(now)
            .upsert(
                RecordRef::new(RecordKind::Quiz, id),
                serde_json::json!({ "id": id }),
            )
            .enqueue(quiz_entry(id, now));
        store.write_through(batch).await.unwrap()[0]
    }

    #[tokio::test]
    async fn test_write_through_commits_record_and_entry() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let id = write_quiz(&store, "quiz_1", now).await;

        let entry = store.get_entry(id).await.unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Pending);
        assert_eq!(entry.retry_count, 0);

        let record = store
            .get_record(&RecordRef::new(RecordKind::Quiz, "quiz_1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.sync_status, SyncMarker::Pending);
    }

    #[tokio::test]
    async fn test_ids_increase_and_listing_is_insertion_ordered() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let a = write_quiz(&store, "quiz_a", now).await;
        let b = write_quiz(&store, "quiz_b", now).await;
        assert!(b > a);

        let ids: Vec<u64> = store
            .list_eligible(now)
            .await
            .unwrap()
            .iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[tokio::test]
    async fn test_retry_and_failure_transitions() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let id = write_quiz(&store, "quiz_1", now).await;

        store
            .mark_retry(id, 1, now + Duration::seconds(10), "HTTP 500")
            .await
            .unwrap();
        assert!(store.list_eligible(now).await.unwrap().is_empty());
        assert!(!store.has_due_retries(now).await.unwrap());
        assert!(store.has_due_retries(now + Duration::seconds(10)).await.unwrap());

        store.mark_failed(id, 5, "HTTP 500").await.unwrap();
        let later = now + Duration::days(1);
        assert!(store.list_eligible(later).await.unwrap().is_empty());
        assert!(!store.has_due_retries(later).await.unwrap());

        assert_eq!(store.reset_failed().await.unwrap(), 1);
        let entry = store.get_entry(id).await.unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Pending);
        assert_eq!(entry.retry_count, 5);
        assert!(entry.next_retry_at.is_none());
        assert_eq!(entry.last_error.as_deref(), Some("HTTP 500"));
    }

    #[tokio::test]
    async fn test_mark_synced_projects_and_is_idempotent() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let id = write_quiz(&store, "quiz_1", now).await;

        let projection = store.mark_synced(id, now).await.unwrap();
        assert_eq!(projection, Projection::Applied);

        let later = now + Duration::minutes(1);
        store.mark_synced(id, later).await.unwrap();
        let entry = store.get_entry(id).await.unwrap().unwrap();
        assert_eq!(entry.synced_at, Some(now));

        let record = store
            .get_record(&RecordRef::new(RecordKind::Quiz, "quiz_1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.sync_status, SyncMarker::Synced);
    }

    #[tokio::test]
    async fn test_projection_waits_for_newer_mutation() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = write_quiz(&store, "quiz_1", now).await;
        let second = write_quiz(&store, "quiz_1", now).await;
        let record = RecordRef::new(RecordKind::Quiz, "quiz_1");

        assert_eq!(
            store.mark_synced(first, now).await.unwrap(),
            Projection::Superseded
        );
        let stored = store.get_record(&record).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncMarker::Pending);

        assert_eq!(
            store.mark_synced(second, now).await.unwrap(),
            Projection::Applied
        );
        let stored = store.get_record(&record).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncMarker::Synced);
    }

    #[tokio::test]
    async fn test_projection_tolerates_deleted_record() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let id = write_quiz(&store, "quiz_1", now).await;
        store
            .write_through(
                WriteBatch::new(now).delete(RecordRef::new(RecordKind::Quiz, "quiz_1")),
            )
            .await
            .unwrap();

        assert_eq!(
            store.mark_synced(id, now).await.unwrap(),
            Projection::RecordMissing
        );
        let entry = store.get_entry(id).await.unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Synced);
    }

    #[tokio::test]
    async fn test_unknown_entry_is_not_found() {
        let store = MemoryStore::new();
        let err = store.mark_failed(42, 1, "boom").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stats_and_purge() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let old = write_quiz(&store, "quiz_old", now).await;
        let fresh = write_quiz(&store, "quiz_fresh", now).await;
        let failed = write_quiz(&store, "quiz_failed", now).await;
        write_quiz(&store, "quiz_pending", now).await;

        store
            .mark_synced(old, now - Duration::days(8))
            .await
            .unwrap();
        store.mark_synced(fresh, now).await.unwrap();
        store.mark_failed(failed, 5, "HTTP 500").await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(
            stats,
            OutboxStats {
                pending: 1,
                synced: 2,
                failed: 1,
                total: 4
            }
        );

        let purged = store
            .purge_synced_older_than(now - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_entry(old).await.unwrap().is_none());
        assert!(store.get_entry(fresh).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_settings() {
        let store = MemoryStore::new();
        assert!(store.get_setting("lite_mode").await.unwrap().is_none());
        store.put_setting("lite_mode", "true").await.unwrap();
        assert_eq!(
            store.get_setting("lite_mode").await.unwrap().as_deref(),
            Some("true")
        );
    }
}
