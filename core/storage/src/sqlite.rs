//! SQLite-backed local store.
//!
//! Persists the outbox, domain records and device settings in a single
//! database file so queued mutations survive restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use edgeclass_common::{DeviceId, Error, RecordKind, RecordRef, Result, SyncMarker};

use crate::outbox::{NewOutboxEntry, OutboxEntry, OutboxStats, OutboxStatus};
use crate::projection::Projection;
use crate::provider::{LocalStore, SettingsStore};
use crate::record::{RecordWrite, StoredRecord, WriteBatch};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS outbox (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        endpoint TEXT NOT NULL,
        method TEXT NOT NULL,
        payload TEXT NOT NULL,
        record_kind TEXT,
        record_id TEXT,
        enqueued_at INTEGER NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL DEFAULT 'pending',
        next_retry_at INTEGER,
        last_error TEXT,
        synced_at INTEGER,
        owner_device TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox(status);
    CREATE INDEX IF NOT EXISTS idx_outbox_record ON outbox(record_kind, record_id);

    CREATE TABLE IF NOT EXISTS records (
        kind TEXT NOT NULL,
        id TEXT NOT NULL,
        body TEXT NOT NULL,
        sync_status TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (kind, id)
    );

    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
"#;

const ENTRY_COLUMNS: &str = "id, endpoint, method, payload, record_kind, record_id, \
    enqueued_at, retry_count, status, next_retry_at, last_error, synced_at, owner_device";

fn storage(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Storage(format!("Timestamp out of range: {}", ms)))
}

/// Outbox row as stored, before parsing enums and timestamps.
struct EntryRow {
    id: i64,
    endpoint: String,
    method: String,
    payload: String,
    record_kind: Option<String>,
    record_id: Option<String>,
    enqueued_at: i64,
    retry_count: u32,
    status: String,
    next_retry_at: Option<i64>,
    last_error: Option<String>,
    synced_at: Option<i64>,
    owner_device: String,
}

impl EntryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            endpoint: row.get(1)?,
            method: row.get(2)?,
            payload: row.get(3)?,
            record_kind: row.get(4)?,
            record_id: row.get(5)?,
            enqueued_at: row.get(6)?,
            retry_count: row.get(7)?,
            status: row.get(8)?,
            next_retry_at: row.get(9)?,
            last_error: row.get(10)?,
            synced_at: row.get(11)?,
            owner_device: row.get(12)?,
        })
    }

    fn into_entry(self) -> Result<OutboxEntry> {
        let record = match (self.record_kind, self.record_id) {
            (Some(kind), Some(id)) => Some(RecordRef::new(kind.parse::<RecordKind>()?, id)),
            _ => None,
        };

        Ok(OutboxEntry {
            id: self.id as u64,
            endpoint: self.endpoint,
            method: self.method.parse()?,
            payload: self.payload,
            record,
            enqueued_at: from_millis(self.enqueued_at)?,
            retry_count: self.retry_count,
            status: self.status.parse()?,
            next_retry_at: self.next_retry_at.map(from_millis).transpose()?,
            last_error: self.last_error,
            synced_at: self.synced_at.map(from_millis).transpose()?,
            owner_device: DeviceId::new(self.owner_device)?,
        })
    }
}

fn insert_entry(conn: &Connection, entry: &NewOutboxEntry) -> rusqlite::Result<u64> {
    conn.execute(
        r#"
        INSERT INTO outbox
        (endpoint, method, payload, record_kind, record_id, enqueued_at, owner_device)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
        params![
            entry.endpoint,
            entry.method.as_str(),
            entry.payload,
            entry.record.as_ref().map(|r| r.kind.as_str()),
            entry.record.as_ref().map(|r| r.id.as_str()),
            entry.enqueued_at.timestamp_millis(),
            entry.owner_device.as_str(),
        ],
    )?;
    Ok(conn.last_insert_rowid() as u64)
}

fn project(conn: &Connection, entry_id: u64, record: &RecordRef) -> rusqlite::Result<Projection> {
    let newer_unsynced: bool = conn.query_row(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM outbox
            WHERE record_kind = ?1 AND record_id = ?2 AND id > ?3 AND status != 'synced'
        )
        "#,
        params![record.kind.as_str(), record.id, entry_id as i64],
        |row| row.get(0),
    )?;
    let record_exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM records WHERE kind = ?1 AND id = ?2)",
        params![record.kind.as_str(), record.id],
        |row| row.get(0),
    )?;

    let projection = Projection::decide(record_exists, newer_unsynced);
    if projection.is_applied() {
        conn.execute(
            "UPDATE records SET sync_status = 'synced' WHERE kind = ?1 AND id = ?2",
            params![record.kind.as_str(), record.id],
        )?;
    }
    Ok(projection)
}

/// Local store backed by SQLite.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or schema setup failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(storage)?;
        conn.execute_batch(SCHEMA).map_err(storage)?;

        info!(path = %db_path.as_ref().display(), "Local store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    async fn query_entries(&self, filter: &str, at: Option<i64>) -> Result<Vec<OutboxEntry>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM outbox {} ORDER BY id", ENTRY_COLUMNS, filter);
        let mut stmt = conn.prepare(&sql).map_err(storage)?;

        let rows = match at {
            Some(at) => stmt.query_map(params![at], EntryRow::from_row),
            None => stmt.query_map([], EntryRow::from_row),
        }
        .map_err(storage)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(storage)?.into_entry()?);
        }
        Ok(entries)
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn write_through(&self, batch: WriteBatch) -> Result<Vec<u64>> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(storage)?;
        let written_at = batch.written_at.timestamp_millis();

        for write in &batch.writes {
            match write {
                RecordWrite::Upsert { record, body } => {
                    tx.execute(
                        r#"
                        INSERT OR REPLACE INTO records (kind, id, body, sync_status, updated_at)
                        VALUES (?1, ?2, ?3, 'pending', ?4)
                        "#,
                        params![record.kind.as_str(), record.id, body.to_string(), written_at],
                    )
                    .map_err(storage)?;
                }
                RecordWrite::Delete { record } => {
                    tx.execute(
                        "DELETE FROM records WHERE kind = ?1 AND id = ?2",
                        params![record.kind.as_str(), record.id],
                    )
                    .map_err(storage)?;
                }
            }
        }

        let mut ids = Vec::with_capacity(batch.entries.len());
        for entry in &batch.entries {
            ids.push(insert_entry(&tx, entry).map_err(storage)?);
        }

        tx.commit().map_err(storage)?;
        debug!(writes = batch.writes.len(), entries = ids.len(), "Write batch committed");
        Ok(ids)
    }

    async fn enqueue(&self, entry: NewOutboxEntry) -> Result<u64> {
        let conn = self.conn.lock().await;
        insert_entry(&conn, &entry).map_err(storage)
    }

    async fn list_eligible(&self, now: DateTime<Utc>) -> Result<Vec<OutboxEntry>> {
        self.query_entries(
            "WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= ?1)",
            Some(now.timestamp_millis()),
        )
        .await
    }

    async fn has_due_retries(&self, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn.lock().await;
        conn.query_row(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM outbox
                WHERE status = 'pending' AND next_retry_at IS NOT NULL AND next_retry_at <= ?1
            )
            "#,
            params![now.timestamp_millis()],
            |row| row.get(0),
        )
        .map_err(storage)
    }

    async fn get_entry(&self, id: u64) -> Result<Option<OutboxEntry>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM outbox WHERE id = ?1", ENTRY_COLUMNS);
        let row = conn
            .query_row(&sql, params![id as i64], EntryRow::from_row)
            .optional()
            .map_err(storage)?;
        row.map(EntryRow::into_entry).transpose()
    }

    async fn list_entries(&self) -> Result<Vec<OutboxEntry>> {
        self.query_entries("", None).await
    }

    async fn mark_synced(&self, id: u64, at: DateTime<Utc>) -> Result<Projection> {
        let mut conn = self.conn.lock().await;
        let mut tx = conn.transaction().map_err(storage)?;

        let row: Option<(String, Option<String>, Option<String>)> = tx
            .query_row(
                "SELECT status, record_kind, record_id FROM outbox WHERE id = ?1",
                params![id as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(storage)?;
        let (status, kind, record_id) =
            row.ok_or_else(|| Error::NotFound(format!("Outbox entry {}", id)))?;

        if status.parse::<OutboxStatus>()? != OutboxStatus::Synced {
            tx.execute(
                r#"
                UPDATE outbox SET status = 'synced', synced_at = ?2, next_retry_at = NULL
                WHERE id = ?1
                "#,
                params![id as i64, at.timestamp_millis()],
            )
            .map_err(storage)?;
        }

        let projection = match (kind, record_id) {
            (Some(kind), Some(record_id)) => {
                let record = RecordRef::new(kind.parse::<RecordKind>()?, record_id);
                let sp = tx.savepoint().map_err(storage)?;
                match project(&sp, id, &record) {
                    Ok(projection) => {
                        sp.commit().map_err(storage)?;
                        projection
                    }
                    Err(e) => {
                        warn!(entry = id, record = %record, error = %e, "Sync status projection failed");
                        Projection::Failed(e.to_string())
                    }
                }
            }
            _ => Projection::Untracked,
        };

        tx.commit().map_err(storage)?;
        Ok(projection)
    }

    async fn mark_retry(
        &self,
        id: u64,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let updated = conn
            .execute(
                r#"
                UPDATE outbox
                SET status = 'pending', retry_count = ?2, next_retry_at = ?3, last_error = ?4
                WHERE id = ?1
                "#,
                params![id as i64, retry_count, next_retry_at.timestamp_millis(), last_error],
            )
            .map_err(storage)?;
        if updated == 0 {
            return Err(Error::NotFound(format!("Outbox entry {}", id)));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: u64, retry_count: u32, last_error: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let updated = conn
            .execute(
                r#"
                UPDATE outbox
                SET status = 'failed', retry_count = ?2, next_retry_at = NULL, last_error = ?3
                WHERE id = ?1
                "#,
                params![id as i64, retry_count, last_error],
            )
            .map_err(storage)?;
        if updated == 0 {
            return Err(Error::NotFound(format!("Outbox entry {}", id)));
        }
        Ok(())
    }

    async fn reset_failed(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE outbox SET status = 'pending', next_retry_at = NULL WHERE status = 'failed'",
            [],
        )
        .map_err(storage)
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM outbox GROUP BY status")
            .map_err(storage)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(storage)?;

        let mut stats = OutboxStats::default();
        for row in rows {
            let (status, count) = row.map_err(storage)?;
            let count = count as usize;
            match status.parse::<OutboxStatus>()? {
                OutboxStatus::Pending => stats.pending = count,
                OutboxStatus::Synced => stats.synced = count,
                OutboxStatus::Failed => stats.failed = count,
            }
            stats.total += count;
        }
        Ok(stats)
    }

    async fn purge_synced_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().await;
        let purged = conn
            .execute(
                "DELETE FROM outbox WHERE status = 'synced' AND synced_at < ?1",
                params![cutoff.timestamp_millis()],
            )
            .map_err(storage)?;
        debug!(purged, "Purged synced outbox entries");
        Ok(purged)
    }

    async fn get_record(&self, record: &RecordRef) -> Result<Option<StoredRecord>> {
        let conn = self.conn.lock().await;
        let row: Option<(String, String, i64)> = conn
            .query_row(
                "SELECT body, sync_status, updated_at FROM records WHERE kind = ?1 AND id = ?2",
                params![record.kind.as_str(), record.id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(storage)?;

        match row {
            Some((body, status, updated_at)) => Ok(Some(StoredRecord {
                record: record.clone(),
                body: serde_json::from_str(&body)?,
                sync_status: status.parse::<SyncMarker>()?,
                updated_at: from_millis(updated_at)?,
            })),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SettingsStore for SqliteStore {
    async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage)
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .map_err(storage)?;
        Ok(())
    }
}
