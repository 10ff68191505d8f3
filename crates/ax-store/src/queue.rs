//! Message queue with per-session serialization.
//!
//! Invariants enforced here rather than in the dispatcher:
//!
//! - at most one message per session is in `processing` at any time;
//! - FIFO within a session (claim order follows enqueue order);
//! - status transitions form a strict DAG:
//!   `pending -> processing -> {done, error}`.
//!
//! The claim is a single `UPDATE ... RETURNING` statement, so concurrent
//! dispatcher ticks cannot double-claim: SQLite serializes writers and the
//! `NOT EXISTS` guard sees the winner's row.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::{now_rfc3339, Database, Result, StoreError};

/// Lifecycle state of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Processing,
    Done,
    Error,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processing => "processing",
            MessageStatus::Done => "done",
            MessageStatus::Error => "error",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "pending" => MessageStatus::Pending,
            "processing" => MessageStatus::Processing,
            "done" => MessageStatus::Done,
            _ => MessageStatus::Error,
        }
    }
}

/// A row in the message queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub session_id: String,
    pub channel: String,
    pub sender: String,
    pub content: String,
    pub status: MessageStatus,
    pub created_at: String,
    pub processed_at: Option<String>,
}

impl QueuedMessage {
    fn from_row(row: &SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            session_id: row.get("session_id"),
            channel: row.get("channel"),
            sender: row.get("sender"),
            content: row.get("content"),
            status: MessageStatus::parse(row.get::<String, _>("status").as_str()),
            created_at: row.get("created_at"),
            processed_at: row.get("processed_at"),
        }
    }
}

const RETURNING: &str =
    "RETURNING id, session_id, channel, sender, content, status, created_at, processed_at";

/// Queue operations over the shared database.
#[derive(Clone)]
pub struct MessageQueue {
    db: Database,
}

impl MessageQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Enqueue a message with a fresh UUID; returns the stored row.
    pub async fn enqueue(
        &self,
        session_id: &str,
        channel: &str,
        sender: &str,
        content: &str,
    ) -> Result<QueuedMessage> {
        let id = Uuid::new_v4().to_string();
        let sql = format!(
            "INSERT INTO messages (id, session_id, channel, sender, content, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6) {RETURNING}"
        );
        let row = sqlx::query(&sql)
            .bind(&id)
            .bind(session_id)
            .bind(channel)
            .bind(sender)
            .bind(content)
            .bind(now_rfc3339())
            .fetch_one(self.db.pool())
            .await?;
        Ok(QueuedMessage::from_row(&row))
    }

    /// Atomically claim the oldest pending message of any session that has
    /// no message currently processing. Returns `None` when nothing is
    /// claimable.
    pub async fn claim_next(&self) -> Result<Option<QueuedMessage>> {
        let sql = format!(
            "UPDATE messages SET status = 'processing', processed_at = ?1
             WHERE id = (
                 SELECT m.id FROM messages m
                 WHERE m.status = 'pending'
                   AND NOT EXISTS (
                       SELECT 1 FROM messages p
                       WHERE p.session_id = m.session_id AND p.status = 'processing'
                   )
                 ORDER BY m.created_at ASC, m.rowid ASC
                 LIMIT 1
             ) {RETURNING}"
        );
        let row = sqlx::query(&sql)
            .bind(now_rfc3339())
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.as_ref().map(QueuedMessage::from_row))
    }

    /// Mark a processing message done. Errors if the row is not processing;
    /// terminal states never transition again.
    pub async fn complete(&self, id: &str) -> Result<()> {
        self.finish(id, MessageStatus::Done).await
    }

    /// Mark a processing message failed. The session stays usable.
    pub async fn fail(&self, id: &str) -> Result<()> {
        self.finish(id, MessageStatus::Error).await
    }

    async fn finish(&self, id: &str, status: MessageStatus) -> Result<()> {
        let result = sqlx::query(
            "UPDATE messages SET status = ?1, processed_at = ?2
             WHERE id = ?3 AND status = 'processing'",
        )
        .bind(status.as_str())
        .bind(now_rfc3339())
        .bind(id)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                expected: "processing",
            });
        }
        Ok(())
    }

    /// Fetch a message by id.
    pub async fn get(&self, id: &str) -> Result<Option<QueuedMessage>> {
        let row = sqlx::query(
            "SELECT id, session_id, channel, sender, content, status, created_at, processed_at
             FROM messages WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row.as_ref().map(QueuedMessage::from_row))
    }

    /// Count of messages in a given status, for diagnostics.
    pub async fn count(&self, status: MessageStatus) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM messages WHERE status = ?1")
            .bind(status.as_str())
            .fetch_one(self.db.pool())
            .await?;
        Ok(row.get("n"))
    }
}
