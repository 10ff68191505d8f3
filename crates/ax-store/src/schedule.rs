//! Persisted scheduler entries.
//!
//! An entry is either a one-shot (`run_at` set) or a recurring task
//! (`interval_min` set). The runner in the supervisor polls for due entries;
//! this module only owns persistence.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::{now_rfc3339, Database, Result};

/// A scheduled task row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub id: String,
    pub session_id: String,
    pub prompt: String,
    /// RFC 3339 instant for one-shot entries.
    pub run_at: Option<String>,
    /// Interval in minutes for recurring entries.
    pub interval_min: Option<i64>,
    pub created_at: String,
}

fn from_row(row: &SqliteRow) -> ScheduleEntry {
    ScheduleEntry {
        id: row.get("id"),
        session_id: row.get("session_id"),
        prompt: row.get("prompt"),
        run_at: row.get("run_at"),
        interval_min: row.get("interval_min"),
        created_at: row.get("created_at"),
    }
}

/// Schedule persistence over the shared database.
#[derive(Clone)]
pub struct ScheduleStore {
    db: Database,
}

impl ScheduleStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Add a recurring entry.
    pub async fn add(
        &self,
        session_id: &str,
        prompt: &str,
        interval_min: i64,
    ) -> Result<ScheduleEntry> {
        self.insert(session_id, prompt, None, Some(interval_min)).await
    }

    /// Add a one-shot entry due at `run_at` (RFC 3339).
    pub async fn add_run_at(
        &self,
        session_id: &str,
        prompt: &str,
        run_at: &str,
    ) -> Result<ScheduleEntry> {
        self.insert(session_id, prompt, Some(run_at), None).await
    }

    async fn insert(
        &self,
        session_id: &str,
        prompt: &str,
        run_at: Option<&str>,
        interval_min: Option<i64>,
    ) -> Result<ScheduleEntry> {
        let row = sqlx::query(
            "INSERT INTO schedule (id, session_id, prompt, run_at, interval_min, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             RETURNING id, session_id, prompt, run_at, interval_min, created_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(session_id)
        .bind(prompt)
        .bind(run_at)
        .bind(interval_min)
        .bind(now_rfc3339())
        .fetch_one(self.db.pool())
        .await?;
        Ok(from_row(&row))
    }

    /// Remove by id; returns whether it existed.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM schedule WHERE id = ?1")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All entries for a session.
    pub async fn list(&self, session_id: &str) -> Result<Vec<ScheduleEntry>> {
        let rows = sqlx::query(
            "SELECT id, session_id, prompt, run_at, interval_min, created_at
             FROM schedule WHERE session_id = ?1 ORDER BY created_at",
        )
        .bind(session_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows.iter().map(from_row).collect())
    }

    /// One-shot entries due at or before `now` (RFC 3339 compare).
    pub async fn due(&self, now: &str) -> Result<Vec<ScheduleEntry>> {
        let rows = sqlx::query(
            "SELECT id, session_id, prompt, run_at, interval_min, created_at
             FROM schedule WHERE run_at IS NOT NULL AND run_at <= ?1",
        )
        .bind(now)
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows.iter().map(from_row).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> ScheduleStore {
        ScheduleStore::new(Database::open_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn add_list_remove() {
        let s = store().await;
        let entry = s.add("sess", "check email", 30).await.unwrap();
        assert_eq!(entry.interval_min, Some(30));

        let listed = s.list("sess").await.unwrap();
        assert_eq!(listed.len(), 1);

        assert!(s.remove(&entry.id).await.unwrap());
        assert!(!s.remove(&entry.id).await.unwrap());
        assert!(s.list("sess").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn due_returns_past_one_shots() {
        let s = store().await;
        s.add_run_at("sess", "early", "2026-01-01T00:00:00+00:00")
            .await
            .unwrap();
        s.add_run_at("sess", "late", "2030-01-01T00:00:00+00:00")
            .await
            .unwrap();
        s.add("sess", "recurring", 5).await.unwrap();

        let due = s.due("2026-06-01T00:00:00+00:00").await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].prompt, "early");
    }
}
