//! Scope-partitioned persistent memory with full-text query.
//!
//! Entries live under a scope (typically the session or agent id) and a key.
//! Content written from an external source carries a taint tag that is
//! returned on read so the caller can re-record taint when the content
//! re-enters a conversation.

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use ax_taint::TaintTag;

use crate::{now_rfc3339, Database, Result};

/// A stored memory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub scope: String,
    pub key: String,
    pub content: String,
    pub tags: Vec<String>,
    pub taint: Option<TaintTag>,
    pub created_at: String,
    pub updated_at: String,
}

/// Query parameters for [`MemoryStore::query`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryQuery {
    /// Optional FTS5 match expression over content.
    pub text: Option<String>,
    /// Entries must carry every listed tag.
    pub tags: Vec<String>,
    /// Maximum rows returned; default 50.
    pub limit: Option<u32>,
}

fn entry_from_row(row: &SqliteRow) -> MemoryEntry {
    let tags: Vec<String> =
        serde_json::from_str(row.get::<String, _>("tags").as_str()).unwrap_or_default();
    let tainted: i64 = row.get("tainted");
    let taint = if tainted != 0 {
        let source: Option<String> = row.get("taint_source");
        Some(TaintTag::external(
            source.unwrap_or_else(|| "memory".to_string()),
        ))
    } else {
        None
    };

    MemoryEntry {
        id: row.get("id"),
        scope: row.get("scope"),
        key: row.get("key"),
        content: row.get("content"),
        tags,
        taint,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

const COLUMNS: &str =
    "id, scope, key, content, tags, tainted, taint_source, created_at, updated_at";

/// Memory operations over the shared database.
#[derive(Clone)]
pub struct MemoryStore {
    db: Database,
}

impl MemoryStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Write (or overwrite) the entry at `(scope, key)`.
    pub async fn write(
        &self,
        scope: &str,
        key: &str,
        content: &str,
        tags: &[String],
        taint: Option<&TaintTag>,
    ) -> Result<MemoryEntry> {
        let now = now_rfc3339();
        let tags_json = serde_json::to_string(tags)?;
        let sql = format!(
            "INSERT INTO memory (id, scope, key, content, tags, tainted, taint_source,
                                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT (scope, key) DO UPDATE SET
                 content = excluded.content,
                 tags = excluded.tags,
                 tainted = excluded.tainted,
                 taint_source = excluded.taint_source,
                 updated_at = excluded.updated_at
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4().to_string())
            .bind(scope)
            .bind(key)
            .bind(content)
            .bind(&tags_json)
            .bind(taint.is_some() as i64)
            .bind(taint.map(|t| t.source.as_str()))
            .bind(&now)
            .fetch_one(self.db.pool())
            .await?;
        Ok(entry_from_row(&row))
    }

    /// Read a single entry by scope and key.
    pub async fn read(&self, scope: &str, key: &str) -> Result<Option<MemoryEntry>> {
        let sql = format!("SELECT {COLUMNS} FROM memory WHERE scope = ?1 AND key = ?2");
        let row = sqlx::query(&sql)
            .bind(scope)
            .bind(key)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row.as_ref().map(entry_from_row))
    }

    /// Query entries in a scope, optionally narrowed by full-text match and
    /// required tags.
    pub async fn query(&self, scope: &str, query: &MemoryQuery) -> Result<Vec<MemoryEntry>> {
        let limit = query.limit.unwrap_or(50) as i64;

        let rows = match &query.text {
            Some(text) => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM memory
                     WHERE scope = ?1
                       AND rowid IN (SELECT rowid FROM memory_fts WHERE memory_fts MATCH ?2)
                     ORDER BY updated_at DESC LIMIT ?3"
                );
                sqlx::query(&sql)
                    .bind(scope)
                    .bind(text)
                    .bind(limit)
                    .fetch_all(self.db.pool())
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {COLUMNS} FROM memory
                     WHERE scope = ?1 ORDER BY updated_at DESC LIMIT ?2"
                );
                sqlx::query(&sql)
                    .bind(scope)
                    .bind(limit)
                    .fetch_all(self.db.pool())
                    .await?
            }
        };

        let mut entries: Vec<MemoryEntry> = rows.iter().map(entry_from_row).collect();
        if !query.tags.is_empty() {
            entries.retain(|e| query.tags.iter().all(|t| e.tags.contains(t)));
        }
        Ok(entries)
    }

    /// Delete the entry at `(scope, key)`; returns whether it existed.
    pub async fn delete(&self, scope: &str, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM memory WHERE scope = ?1 AND key = ?2")
            .bind(scope)
            .bind(key)
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// List keys in a scope.
    pub async fn list(&self, scope: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT key FROM memory WHERE scope = ?1 ORDER BY key")
            .bind(scope)
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows.iter().map(|r| r.get("key")).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> MemoryStore {
        MemoryStore::new(Database::open_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn write_read_round_trip() {
        let m = store().await;
        let written = m
            .write("s1", "note", "remember the milk", &[], None)
            .await
            .unwrap();

        let read = m.read("s1", "note").await.unwrap().unwrap();
        assert_eq!(read.id, written.id);
        assert_eq!(read.content, "remember the milk");
        assert!(read.taint.is_none());
    }

    #[tokio::test]
    async fn overwrite_keeps_identity() {
        let m = store().await;
        let first = m.write("s1", "k", "v1", &[], None).await.unwrap();
        let second = m.write("s1", "k", "v2", &[], None).await.unwrap();

        assert_eq!(first.id, second.id, "upsert must not mint a new id");
        assert_eq!(m.read("s1", "k").await.unwrap().unwrap().content, "v2");
    }

    #[tokio::test]
    async fn tainted_write_round_trips_tag() {
        let m = store().await;
        let tag = TaintTag::external("web_fetch:example.com");
        m.write("s1", "page", "external text", &[], Some(&tag))
            .await
            .unwrap();

        let read = m.read("s1", "page").await.unwrap().unwrap();
        let taint = read.taint.unwrap();
        assert_eq!(taint.source, "web_fetch:example.com");
    }

    #[tokio::test]
    async fn scopes_partition() {
        let m = store().await;
        m.write("a", "k", "in-a", &[], None).await.unwrap();
        assert!(m.read("b", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn full_text_query_matches_content() {
        let m = store().await;
        m.write("s", "one", "the quick brown fox", &[], None)
            .await
            .unwrap();
        m.write("s", "two", "lazy dogs sleep", &[], None)
            .await
            .unwrap();

        let hits = m
            .query(
                "s",
                &MemoryQuery {
                    text: Some("fox".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "one");
    }

    #[tokio::test]
    async fn fts_index_follows_updates() {
        let m = store().await;
        m.write("s", "k", "alpha", &[], None).await.unwrap();
        m.write("s", "k", "bravo", &[], None).await.unwrap();

        let stale = m
            .query(
                "s",
                &MemoryQuery {
                    text: Some("alpha".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(stale.is_empty(), "old content must leave the index");

        let fresh = m
            .query(
                "s",
                &MemoryQuery {
                    text: Some("bravo".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(fresh.len(), 1);
    }

    #[tokio::test]
    async fn tag_filter_requires_all() {
        let m = store().await;
        m.write(
            "s",
            "k1",
            "c",
            &["work".to_string(), "urgent".to_string()],
            None,
        )
        .await
        .unwrap();
        m.write("s", "k2", "c", &["work".to_string()], None)
            .await
            .unwrap();

        let hits = m
            .query(
                "s",
                &MemoryQuery {
                    tags: vec!["work".to_string(), "urgent".to_string()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "k1");
    }

    #[tokio::test]
    async fn delete_and_list() {
        let m = store().await;
        m.write("s", "a", "1", &[], None).await.unwrap();
        m.write("s", "b", "2", &[], None).await.unwrap();

        assert_eq!(m.list("s").await.unwrap(), vec!["a", "b"]);
        assert!(m.delete("s", "a").await.unwrap());
        assert!(!m.delete("s", "a").await.unwrap());
        assert_eq!(m.list("s").await.unwrap(), vec!["b"]);
    }
}
