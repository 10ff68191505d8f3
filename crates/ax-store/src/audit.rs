//! Append-only audit log.
//!
//! Every IPC action, router decision, and security event lands here as one
//! JSON line. Entries are never mutated; the only write operation is an
//! append through a single serialized writer, which makes appends globally
//! linearizable. Arguments are stored as a SHA-256 digest, not verbatim, so
//! the log itself cannot become an exfiltration channel.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::warn;

use crate::{now_rfc3339, Result};

/// Outcome recorded for an audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Success,
    Blocked,
    Error,
}

/// One audit line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: String,
    pub action: String,
    pub session_id: String,
    pub agent_id: String,
    pub args_digest: String,
    pub result: AuditResult,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<String>,
}

impl AuditEntry {
    /// Build an entry for `action` with its arguments digested.
    pub fn new(
        action: &str,
        session_id: &str,
        agent_id: &str,
        args: &serde_json::Value,
        result: AuditResult,
    ) -> Self {
        Self {
            ts: now_rfc3339(),
            action: action.to_string(),
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            args_digest: digest_args(args),
            result,
            patterns: Vec::new(),
        }
    }

    /// Attach the scanner patterns that matched.
    pub fn with_patterns(mut self, patterns: Vec<String>) -> Self {
        self.patterns = patterns;
        self
    }
}

/// SHA-256 hex digest of a JSON value's canonical serialization.
pub fn digest_args(args: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(args).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Filter for [`AuditLog::query`]. All populated fields must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    pub action: Option<String>,
    pub session_id: Option<String>,
    pub result: Option<AuditResult>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(action) = &self.action {
            if entry.action != *action {
                return false;
            }
        }
        if let Some(session) = &self.session_id {
            if entry.session_id != *session {
                return false;
            }
        }
        if let Some(result) = self.result {
            if entry.result != result {
                return false;
            }
        }
        true
    }
}

/// The JSONL audit log.
pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<()>,
}

impl AuditLog {
    /// Use (or create on first append) the log at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry. Serialized by an internal mutex so concurrent
    /// appends interleave at line granularity, never mid-line.
    pub async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let _guard = self.writer.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read entries matching `filter`, oldest first. Malformed lines are
    /// skipped with a warning rather than failing the whole query.
    pub async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let file = match tokio::fs::File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let limit = filter.limit.unwrap_or(usize::MAX);
        let mut entries = Vec::new();
        let mut lines = BufReader::new(file).lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEntry>(&line) {
                Ok(entry) => {
                    if filter.matches(&entry) {
                        entries.push(entry);
                        if entries.len() >= limit {
                            break;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "skipping malformed audit line"),
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(action: &str, session: &str, result: AuditResult) -> AuditEntry {
        AuditEntry::new(action, session, "main", &json!({"k": "v"}), result)
    }

    #[tokio::test]
    async fn append_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl"));

        log.append(&entry("web_fetch", "s1", AuditResult::Success))
            .await
            .unwrap();
        log.append(&entry("web_fetch", "s2", AuditResult::Blocked))
            .await
            .unwrap();

        let all = log.query(&AuditFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let blocked = log
            .query(&AuditFilter {
                result: Some(AuditResult::Blocked),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(blocked.len(), 1);
        assert_eq!(blocked[0].session_id, "s2");
    }

    #[tokio::test]
    async fn appends_never_mutate_prior_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::new(&path);

        log.append(&entry("a", "s", AuditResult::Success))
            .await
            .unwrap();
        let first = tokio::fs::read_to_string(&path).await.unwrap();

        log.append(&entry("b", "s", AuditResult::Error))
            .await
            .unwrap();
        let second = tokio::fs::read_to_string(&path).await.unwrap();

        assert!(second.starts_with(&first), "prior bytes changed on append");
    }

    #[tokio::test]
    async fn digest_hides_arguments() {
        let args = json!({"password": "hunter2"});
        let e = AuditEntry::new("x", "s", "main", &args, AuditResult::Success);
        assert!(!serde_json::to_string(&e).unwrap().contains("hunter2"));
        assert_eq!(e.args_digest.len(), 64);
    }

    #[tokio::test]
    async fn digest_is_deterministic() {
        let a = digest_args(&json!({"a": 1}));
        let b = digest_args(&json!({"a": 1}));
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn query_on_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("never-written.jsonl"));
        assert!(log.query(&AuditFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn limit_caps_results() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl"));
        for i in 0..10 {
            log.append(&entry(&format!("a{i}"), "s", AuditResult::Success))
                .await
                .unwrap();
        }
        let limited = log
            .query(&AuditFilter {
                limit: Some(3),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 3);
        assert_eq!(limited[0].action, "a0");
    }
}
