//! Local store trait definitions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use edgeclass_common::{RecordRef, Result};

use crate::outbox::{NewOutboxEntry, OutboxEntry, OutboxStats};
use crate::projection::Projection;
use crate::record::{StoredRecord, WriteBatch};

/// Durable on-device store: the outbox queue plus the domain records it describes.
///
/// All multi-record changes are atomic: readers never observe a domain write
/// without its outbox entry, or a synced entry without its projection attempt.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Commit domain writes together with the outbox entries describing them.
    ///
    /// # Postconditions
    /// - Every upserted record has marker `pending`
    /// - Every entry is appended as `pending` with `retry_count = 0`
    /// - Returns the new entry ids, in the order given
    ///
    /// # Errors
    /// - Nothing is committed if any part fails
    async fn write_through(&self, batch: WriteBatch) -> Result<Vec<u64>>;

    /// Append a single entry that has no accompanying domain write.
    async fn enqueue(&self, entry: NewOutboxEntry) -> Result<u64>;

    /// Pending entries whose retry time (if any) has passed, in insertion order.
    async fn list_eligible(&self, now: DateTime<Utc>) -> Result<Vec<OutboxEntry>>;

    /// Whether any pending entry has a scheduled retry that is now due.
    async fn has_due_retries(&self, now: DateTime<Utc>) -> Result<bool>;

    /// Look up one entry.
    async fn get_entry(&self, id: u64) -> Result<Option<OutboxEntry>>;

    /// All entries, in insertion order.
    async fn list_entries(&self) -> Result<Vec<OutboxEntry>>;

    /// Mark an entry delivered and project the result onto its record.
    ///
    /// Idempotent: an already synced entry is left untouched.
    ///
    /// # Errors
    /// - Entry not found
    async fn mark_synced(&self, id: u64, at: DateTime<Utc>) -> Result<Projection>;

    /// Record a failed attempt that will be retried at `next_retry_at`.
    async fn mark_retry(
        &self,
        id: u64,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<()>;

    /// Record a terminal failure.
    async fn mark_failed(&self, id: u64, retry_count: u32, last_error: &str) -> Result<()>;

    /// Move every failed entry back to pending, keeping its retry count.
    async fn reset_failed(&self) -> Result<usize>;

    /// Aggregate counts by status.
    async fn stats(&self) -> Result<OutboxStats>;

    /// Delete synced entries delivered before `cutoff`.
    async fn purge_synced_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Fetch a domain record.
    async fn get_record(&self, record: &RecordRef) -> Result<Option<StoredRecord>>;
}

/// Small persistent key/value store for device-level preferences.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> Result<Option<String>>;

    async fn put_setting(&self, key: &str, value: &str) -> Result<()>;
}
