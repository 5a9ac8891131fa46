//! Write outbox: attendance submissions that failed with a retryable error.
//!
//! Backed by SQLite through [`tokio_rusqlite`], so every statement runs on
//! the connection's own thread. Rows are keyed by (session, student), which
//! keeps the queue idempotent in the same way as the backend upsert.

use std::path::Path;

use chrono::{DateTime, Utc};
use rollcall_core::{AttendanceSubmission, SessionId, StudentId};
use serde::Serialize;
use thiserror::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS pending_writes (
    session_id  INTEGER NOT NULL,
    student_id  INTEGER NOT NULL,
    confidence  REAL    NOT NULL,
    device_id   INTEGER,
    attempts    INTEGER NOT NULL DEFAULT 1,
    last_error  TEXT,
    queued_at   INTEGER NOT NULL,
    PRIMARY KEY (session_id, student_id)
);
";

#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("outbox database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("failed to create outbox directory: {0}")]
    Io(#[from] std::io::Error),
}

/// One queued attendance write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingWrite {
    pub session_id: SessionId,
    pub student_id: StudentId,
    pub confidence: f32,
    pub device_id: Option<i64>,
    /// Failed submissions so far, including the original one.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub queued_at: DateTime<Utc>,
}

impl PendingWrite {
    pub fn submission(&self) -> AttendanceSubmission {
        AttendanceSubmission {
            session_id: self.session_id,
            student_id: self.student_id,
            confidence: self.confidence,
            device_id: self.device_id,
        }
    }
}

/// Cloning is cheap; the connection is reference-counted.
#[derive(Clone)]
pub struct Outbox {
    conn: tokio_rusqlite::Connection,
}

impl Outbox {
    /// Open (or create) the outbox at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, OutboxError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = tokio_rusqlite::Connection::open(path).await?;
        Self::init(conn).await
    }

    pub async fn open_in_memory() -> Result<Self, OutboxError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: tokio_rusqlite::Connection) -> Result<Self, OutboxError> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    /// Queue a submission after a failed attempt. Re-queuing the same
    /// (session, student) bumps its attempt count instead of adding a row.
    pub async fn enqueue(
        &self,
        submission: &AttendanceSubmission,
        error: &str,
    ) -> Result<(), OutboxError> {
        let s = submission.clone();
        let error = error.to_string();
        let now = Utc::now().timestamp_millis();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO pending_writes
                        (session_id, student_id, confidence, device_id, attempts, last_error, queued_at)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)
                     ON CONFLICT (session_id, student_id) DO UPDATE SET
                        confidence = MAX(confidence, excluded.confidence),
                        attempts   = attempts + 1,
                        last_error = excluded.last_error",
                    rusqlite::params![
                        s.session_id,
                        s.student_id,
                        s.confidence as f64,
                        s.device_id,
                        error,
                        now
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// All queued writes, optionally restricted to one session, oldest first.
    pub async fn list(&self, session_id: Option<SessionId>) -> Result<Vec<PendingWrite>, OutboxError> {
        self.select(session_id, None).await
    }

    /// Queued writes still eligible for automatic retry.
    pub async fn due(&self, max_attempts: u32) -> Result<Vec<PendingWrite>, OutboxError> {
        self.select(None, Some(max_attempts)).await
    }

    async fn select(
        &self,
        session_id: Option<SessionId>,
        below_attempts: Option<u32>,
    ) -> Result<Vec<PendingWrite>, OutboxError> {
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT session_id, student_id, confidence, device_id, attempts, last_error, queued_at
                     FROM pending_writes
                     WHERE (?1 IS NULL OR session_id = ?1)
                       AND (?2 IS NULL OR attempts < ?2)
                     ORDER BY queued_at, session_id, student_id",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![session_id, below_attempts], |r| {
                        let confidence: f64 = r.get(2)?;
                        let queued_ms: i64 = r.get(6)?;
                        Ok(PendingWrite {
                            session_id: r.get(0)?,
                            student_id: r.get(1)?,
                            confidence: confidence as f32,
                            device_id: r.get(3)?,
                            attempts: r.get(4)?,
                            last_error: r.get(5)?,
                            queued_at: DateTime::from_timestamp_millis(queued_ms).unwrap_or_default(),
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    /// Drop a write once the store has accepted it. Returns whether a row existed.
    pub async fn remove(&self, session_id: SessionId, student_id: StudentId) -> Result<bool, OutboxError> {
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM pending_writes WHERE session_id = ?1 AND student_id = ?2",
                    rusqlite::params![session_id, student_id],
                )?;
                Ok(n)
            })
            .await?;
        Ok(removed > 0)
    }

    /// Record another failed resubmission; returns the new attempt count.
    pub async fn record_failure(
        &self,
        session_id: SessionId,
        student_id: StudentId,
        error: &str,
    ) -> Result<u32, OutboxError> {
        let error = error.to_string();
        let attempts = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE pending_writes SET attempts = attempts + 1, last_error = ?3
                     WHERE session_id = ?1 AND student_id = ?2",
                    rusqlite::params![session_id, student_id, error],
                )?;
                let attempts: u32 = conn
                    .query_row(
                        "SELECT attempts FROM pending_writes WHERE session_id = ?1 AND student_id = ?2",
                        rusqlite::params![session_id, student_id],
                        |r| r.get(0),
                    )
                    .unwrap_or(0);
                Ok(attempts)
            })
            .await?;
        Ok(attempts)
    }

    /// Make stalled writes eligible for automatic retry again.
    pub async fn reset_attempts(&self) -> Result<usize, OutboxError> {
        let n = self
            .conn
            .call(|conn| {
                let n = conn.execute("UPDATE pending_writes SET attempts = 0", [])?;
                Ok(n)
            })
            .await?;
        Ok(n)
    }

    pub async fn count(&self, session_id: Option<SessionId>) -> Result<usize, OutboxError> {
        let n = self
            .conn
            .call(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM pending_writes WHERE ?1 IS NULL OR session_id = ?1",
                    rusqlite::params![session_id],
                    |r| r.get(0),
                )?;
                Ok(n)
            })
            .await?;
        Ok(n as usize)
    }
}
