//! Server-side SQLite database.
//!
//! Every write is an idempotent upsert keyed by record id and appends a row
//! to `sync_logs`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use serde::Serialize;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

use edgeclass_common::{score_answers, Attempt, Error, Question, QuestionsBatch, Quiz, Result, User};

use crate::conflict::{ConflictResolver, Resolution};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        username TEXT NOT NULL,
        device_id TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        synced_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS quizzes (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        created_by TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        device_id TEXT NOT NULL,
        synced_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS questions (
        id TEXT PRIMARY KEY,
        quiz_id TEXT NOT NULL,
        question TEXT NOT NULL,
        options TEXT NOT NULL,
        correct_answer INTEGER NOT NULL,
        position INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS attempts (
        id TEXT PRIMARY KEY,
        quiz_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        answers TEXT NOT NULL,
        score INTEGER NOT NULL,
        total_questions INTEGER NOT NULL,
        completed_at INTEGER NOT NULL,
        device_id TEXT NOT NULL,
        synced_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS sync_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL,
        record_type TEXT NOT NULL,
        record_id TEXT NOT NULL,
        action TEXT NOT NULL,
        logged_at INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_quizzes_created_by ON quizzes(created_by);
    CREATE INDEX IF NOT EXISTS idx_questions_quiz_id ON questions(quiz_id);
    CREATE INDEX IF NOT EXISTS idx_attempts_quiz_id ON attempts(quiz_id);
    CREATE INDEX IF NOT EXISTS idx_sync_logs_device_id ON sync_logs(device_id);
"#;

fn db(err: rusqlite::Error) -> Error {
    Error::Storage(err.to_string())
}

fn from_millis(ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(0, ms))
}

fn from_json<T: serde::de::DeserializeOwned>(idx: usize, text: String) -> rusqlite::Result<T> {
    serde_json::from_str(&text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

/// One accepted write, as recorded in `sync_logs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLog {
    pub device_id: String,
    pub record_type: String,
    pub record_id: String,
    pub action: String,
    pub logged_at: DateTime<Utc>,
}

/// Rows returned in [`ServerStats::recent_syncs`].
pub const RECENT_SYNCS: usize = 10;
/// Rows returned in [`DeviceStats::sync_history`].
pub const DEVICE_HISTORY: usize = 20;

/// Server-wide totals for `GET /stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStats {
    pub users: usize,
    pub quizzes: usize,
    pub attempts: usize,
    pub sync_logs: usize,
    /// Distinct devices that registered a user.
    pub devices: usize,
    pub recent_syncs: Vec<SyncLog>,
}

/// Per-device totals for `GET /stats/device/{device_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStats {
    pub quizzes: usize,
    pub attempts: usize,
    pub last_sync: Option<SyncLog>,
    pub sync_history: Vec<SyncLog>,
}

/// Result of an attempt write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredAttempt {
    /// Score as stored: recomputed when the quiz's questions are known.
    pub score: u32,
    pub total_questions: u32,
    pub recomputed: bool,
}

/// Server database handle.
pub struct ServerDb {
    conn: Mutex<Connection>,
    resolver: ConflictResolver,
}

impl ServerDb {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(db)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db)?;
        info!("Opened server database at {:?}", path);
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).map_err(db)?;
        Ok(Self {
            conn: Mutex::new(conn),
            resolver: ConflictResolver::new(),
        })
    }

    pub async fn upsert_user(&self, user: &User) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(db)?;
        tx.execute(
            "INSERT OR REPLACE INTO users (id, username, device_id, created_at, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                user.id,
                user.username,
                user.device_id,
                user.created_at.timestamp_millis(),
                Utc::now().timestamp_millis(),
            ],
        )
        .map_err(db)?;
        log_sync(&tx, &user.device_id, "user", &user.id, "sync")?;
        tx.commit().map_err(db)?;
        debug!("Synced user {}", user.id);
        Ok(())
    }

    /// Store `quiz` unless a strictly newer version is already stored.
    ///
    /// The check and the write happen under one lock.
    pub async fn upsert_quiz(&self, quiz: &Quiz) -> Result<Resolution> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(db)?;

        let stored: Option<i64> = tx
            .query_row(
                "SELECT updated_at FROM quizzes WHERE id = ?1",
                params![quiz.id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db)?;
        let stored = stored.map(from_millis).transpose().map_err(db)?;

        let resolution = self.resolver.resolve(&quiz.id, stored, quiz.updated_at);
        if !resolution.is_accepted() {
            return Ok(resolution);
        }

        tx.execute(
            "INSERT OR REPLACE INTO quizzes
             (id, title, description, created_by, created_at, updated_at, device_id, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                quiz.id,
                quiz.title,
                quiz.description,
                quiz.created_by,
                quiz.created_at.timestamp_millis(),
                quiz.updated_at.timestamp_millis(),
                quiz.device_id,
                Utc::now().timestamp_millis(),
            ],
        )
        .map_err(db)?;
        log_sync(&tx, &quiz.device_id, "quiz", &quiz.id, "sync")?;
        tx.commit().map_err(db)?;
        debug!("Synced quiz {}", quiz.id);
        Ok(resolution)
    }

    pub async fn upsert_questions(&self, batch: &QuestionsBatch) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(db)?;
        for question in &batch.questions {
            let options = serde_json::to_string(&question.options)?;
            tx.execute(
                "INSERT OR REPLACE INTO questions
                 (id, quiz_id, question, options, correct_answer, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    question.id,
                    question.quiz_id,
                    question.question,
                    options,
                    question.correct_answer,
                    question.order,
                ],
            )
            .map_err(db)?;
            log_sync(&tx, &batch.device_id, "question", &question.id, "sync")?;
        }
        tx.commit().map_err(db)?;
        debug!("Synced {} questions", batch.questions.len());
        Ok(batch.questions.len())
    }

    /// Store `attempt`, recomputing its score when the questions are known.
    pub async fn upsert_attempt(&self, attempt: &Attempt) -> Result<StoredAttempt> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(db)?;

        let questions = load_questions(&tx, &attempt.quiz_id)?;
        let stored = if questions.is_empty() {
            StoredAttempt {
                score: attempt.score,
                total_questions: attempt.total_questions,
                recomputed: false,
            }
        } else {
            StoredAttempt {
                score: score_answers(&questions, &attempt.answers),
                total_questions: questions.len() as u32,
                recomputed: true,
            }
        };
        if stored.recomputed && stored.score != attempt.score {
            info!(
                attempt = %attempt.id,
                client = attempt.score,
                server = stored.score,
                "Attempt score corrected"
            );
        }

        let answers = serde_json::to_string(&attempt.answers)?;
        tx.execute(
            "INSERT OR REPLACE INTO attempts
             (id, quiz_id, user_id, answers, score, total_questions, completed_at, device_id, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                attempt.id,
                attempt.quiz_id,
                attempt.user_id,
                answers,
                stored.score,
                stored.total_questions,
                attempt.completed_at.timestamp_millis(),
                attempt.device_id,
                Utc::now().timestamp_millis(),
            ],
        )
        .map_err(db)?;
        log_sync(&tx, &attempt.device_id, "attempt", &attempt.id, "sync")?;
        tx.commit().map_err(db)?;
        debug!("Synced attempt {}", attempt.id);
        Ok(stored)
    }

    /// Delete a quiz and its questions. Returns the number of quizzes removed.
    pub async fn delete_quiz(&self, id: &str, device_id: &str) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(db)?;
        tx.execute("DELETE FROM questions WHERE quiz_id = ?1", params![id])
            .map_err(db)?;
        let deleted = tx
            .execute("DELETE FROM quizzes WHERE id = ?1", params![id])
            .map_err(db)?;
        log_sync(&tx, device_id, "quiz", id, "delete")?;
        tx.commit().map_err(db)?;
        debug!("Deleted quiz {} ({} rows)", id, deleted);
        Ok(deleted)
    }

    pub async fn get_quiz(&self, id: &str) -> Result<Option<Quiz>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, title, description, created_by, created_at, updated_at, device_id
             FROM quizzes WHERE id = ?1",
            params![id],
            quiz_from_row,
        )
        .optional()
        .map_err(db)
    }

    /// All quizzes, newest first.
    pub async fn list_quizzes(&self) -> Result<Vec<Quiz>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, title, description, created_by, created_at, updated_at, device_id
                 FROM quizzes ORDER BY created_at DESC",
            )
            .map_err(db)?;
        let rows = stmt.query_map([], quiz_from_row).map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    pub async fn get_questions(&self, quiz_id: &str) -> Result<Vec<Question>> {
        let conn = self.conn.lock().await;
        load_questions(&conn, quiz_id)
    }

    /// All attempts, most recently completed first.
    pub async fn list_attempts(&self) -> Result<Vec<Attempt>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare(
                "SELECT id, quiz_id, user_id, answers, score, total_questions, completed_at, device_id
                 FROM attempts ORDER BY completed_at DESC",
            )
            .map_err(db)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Attempt {
                    id: row.get(0)?,
                    quiz_id: row.get(1)?,
                    user_id: row.get(2)?,
                    answers: from_json(3, row.get(3)?)?,
                    score: row.get(4)?,
                    total_questions: row.get(5)?,
                    completed_at: from_millis(row.get(6)?)?,
                    device_id: row.get(7)?,
                })
            })
            .map_err(db)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
    }

    /// Totals across every device, with the latest accepted writes.
    pub async fn stats(&self) -> Result<ServerStats> {
        let conn = self.conn.lock().await;
        Ok(ServerStats {
            users: count(&conn, "SELECT COUNT(*) FROM users", [])?,
            quizzes: count(&conn, "SELECT COUNT(*) FROM quizzes", [])?,
            attempts: count(&conn, "SELECT COUNT(*) FROM attempts", [])?,
            sync_logs: count(&conn, "SELECT COUNT(*) FROM sync_logs", [])?,
            devices: count(&conn, "SELECT COUNT(DISTINCT device_id) FROM users", [])?,
            recent_syncs: load_logs(&conn, None, RECENT_SYNCS)?,
        })
    }

    /// Records written by one device and its sync history.
    pub async fn device_stats(&self, device_id: &str) -> Result<DeviceStats> {
        let conn = self.conn.lock().await;
        let sync_history = load_logs(&conn, Some(device_id), DEVICE_HISTORY)?;
        Ok(DeviceStats {
            quizzes: count(
                &conn,
                "SELECT COUNT(*) FROM quizzes WHERE device_id = ?1",
                params![device_id],
            )?,
            attempts: count(
                &conn,
                "SELECT COUNT(*) FROM attempts WHERE device_id = ?1",
                params![device_id],
            )?,
            last_sync: sync_history.first().cloned(),
            sync_history,
        })
    }

    /// Latest sync log rows for one device, newest first.
    pub async fn sync_logs(&self, device_id: &str, limit: usize) -> Result<Vec<SyncLog>> {
        let conn = self.conn.lock().await;
        load_logs(&conn, Some(device_id), limit)
    }
}

fn count<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<usize> {
    let n: i64 = conn.query_row(sql, params, |row| row.get(0)).map_err(db)?;
    Ok(n as usize)
}

fn load_logs(conn: &Connection, device_id: Option<&str>, limit: usize) -> Result<Vec<SyncLog>> {
    let mut stmt = conn
        .prepare(
            "SELECT device_id, record_type, record_id, action, logged_at
             FROM sync_logs WHERE ?1 IS NULL OR device_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )
        .map_err(db)?;
    let rows = stmt
        .query_map(params![device_id, limit as i64], |row| {
            Ok(SyncLog {
                device_id: row.get(0)?,
                record_type: row.get(1)?,
                record_id: row.get(2)?,
                action: row.get(3)?,
                logged_at: from_millis(row.get(4)?)?,
            })
        })
        .map_err(db)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
}

fn quiz_from_row(row: &Row<'_>) -> rusqlite::Result<Quiz> {
    Ok(Quiz {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        created_by: row.get(3)?,
        created_at: from_millis(row.get(4)?)?,
        updated_at: from_millis(row.get(5)?)?,
        device_id: row.get(6)?,
    })
}

fn load_questions(conn: &Connection, quiz_id: &str) -> Result<Vec<Question>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, quiz_id, question, options, correct_answer, position
             FROM questions WHERE quiz_id = ?1 ORDER BY position",
        )
        .map_err(db)?;
    let rows = stmt
        .query_map(params![quiz_id], |row| {
            Ok(Question {
                id: row.get(0)?,
                quiz_id: row.get(1)?,
                question: row.get(2)?,
                options: from_json(3, row.get(3)?)?,
                correct_answer: row.get(4)?,
                order: row.get(5)?,
            })
        })
        .map_err(db)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db)
}

fn log_sync(
    tx: &Transaction<'_>,
    device_id: &str,
    record_type: &str,
    record_id: &str,
    action: &str,
) -> Result<()> {
    tx.execute(
        "INSERT INTO sync_logs (device_id, record_type, record_id, action, logged_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            device_id,
            record_type,
            record_id,
            action,
            Utc::now().timestamp_millis()
        ],
    )
    .map_err(db)?;
    Ok(())
}
