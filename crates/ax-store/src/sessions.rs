//! Session rows and ordered conversation turns.
//!
//! A session is created on first contact and never destroyed by the core;
//! channels may expire them out-of-band. The row also carries the most
//! recently issued canary token so the outbound path can check the right
//! one after a restart.

use serde::{Deserialize, Serialize};
use sqlx::Row;

use crate::{now_rfc3339, Database, Result};

/// Speaker role of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    System,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
            TurnRole::System => "system",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "assistant" => TurnRole::Assistant,
            "system" => TurnRole::System,
            _ => TurnRole::User,
        }
    }
}

/// One conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub sender: Option<String>,
    pub created_at: String,
}

/// Session and turn operations over the shared database.
#[derive(Clone)]
pub struct SessionStore {
    db: Database,
}

impl SessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create the session row if it does not exist yet.
    pub async fn ensure(&self, session_id: &str, provider: &str, scope: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (id, provider, scope, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(session_id)
        .bind(provider)
        .bind(scope)
        .bind(now_rfc3339())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub async fn exists(&self, session_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM sessions WHERE id = ?1")
            .bind(session_id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.is_some())
    }

    /// Store the canary minted for the session's latest inbound message.
    pub async fn set_canary(&self, session_id: &str, canary: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_canary = ?1 WHERE id = ?2")
            .bind(canary)
            .bind(session_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    pub async fn last_canary(&self, session_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT last_canary FROM sessions WHERE id = ?1")
            .bind(session_id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.and_then(|r| r.get::<Option<String>, _>("last_canary")))
    }

    /// Append a turn to the session's conversation.
    pub async fn append_turn(
        &self,
        session_id: &str,
        role: TurnRole,
        content: &str,
        sender: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO turns (session_id, role, content, sender, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(session_id)
        .bind(role.as_str())
        .bind(content)
        .bind(sender)
        .bind(now_rfc3339())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// The most recent `limit` turns in chronological order.
    pub async fn history(&self, session_id: &str, limit: u32) -> Result<Vec<Turn>> {
        let rows = sqlx::query(
            "SELECT role, content, sender, created_at FROM (
                 SELECT id, role, content, sender, created_at FROM turns
                 WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2
             ) ORDER BY id ASC",
        )
        .bind(session_id)
        .bind(limit as i64)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows
            .iter()
            .map(|row| Turn {
                role: TurnRole::parse(row.get::<String, _>("role").as_str()),
                content: row.get("content"),
                sender: row.get("sender"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SessionStore {
        SessionStore::new(Database::open_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn ensure_is_idempotent() {
        let s = store().await;
        s.ensure("cli:dm:u1", "cli", "dm").await.unwrap();
        s.ensure("cli:dm:u1", "cli", "dm").await.unwrap();
        assert!(s.exists("cli:dm:u1").await.unwrap());
    }

    #[tokio::test]
    async fn canary_round_trips() {
        let s = store().await;
        s.ensure("s", "cli", "dm").await.unwrap();
        assert!(s.last_canary("s").await.unwrap().is_none());

        s.set_canary("s", "axc-deadbeef").await.unwrap();
        assert_eq!(s.last_canary("s").await.unwrap().unwrap(), "axc-deadbeef");

        // Overwritten by the next message's canary.
        s.set_canary("s", "axc-cafef00d").await.unwrap();
        assert_eq!(s.last_canary("s").await.unwrap().unwrap(), "axc-cafef00d");
    }

    #[tokio::test]
    async fn history_is_ordered_and_limited() {
        let s = store().await;
        s.ensure("s", "cli", "dm").await.unwrap();
        for i in 0..5 {
            s.append_turn("s", TurnRole::User, &format!("u{i}"), Some("u"))
                .await
                .unwrap();
            s.append_turn("s", TurnRole::Assistant, &format!("a{i}"), None)
                .await
                .unwrap();
        }

        let turns = s.history("s", 4).await.unwrap();
        assert_eq!(turns.len(), 4);
        // Most recent four, oldest first.
        assert_eq!(turns[0].content, "u3");
        assert_eq!(turns[1].content, "a3");
        assert_eq!(turns[2].content, "u4");
        assert_eq!(turns[3].content, "a4");
        assert_eq!(turns[3].role, TurnRole::Assistant);
    }
}
