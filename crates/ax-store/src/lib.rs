//! # AX Persistent State
//!
//! Everything the supervisor keeps on disk:
//!
//! - the **message queue**, **sessions/turns**, and **memory** tables in a
//!   single SQLite database (WAL mode, foreign keys on, FTS5 over memory
//!   content);
//! - the **audit log**, an append-only JSONL file;
//! - the **credential store**, process-wide secret state resolved from the
//!   environment or an encrypted file.
//!
//! Ownership follows the supervisor: it opens these once and hands `Arc`s to
//! the router and IPC handlers. Workers never touch any of this directly;
//! their only route here is an IPC action.

pub mod audit;
pub mod credentials;
pub mod db;
pub mod memory;
pub mod queue;
pub mod schedule;
pub mod sessions;

pub use audit::{AuditEntry, AuditFilter, AuditLog, AuditResult};
pub use credentials::{CredentialMode, Credentials};
pub use db::Database;
pub use memory::{MemoryEntry, MemoryQuery, MemoryStore};
pub use queue::{MessageQueue, MessageStatus, QueuedMessage};
pub use schedule::{ScheduleEntry, ScheduleStore};
pub use sessions::{SessionStore, Turn, TurnRole};

use thiserror::Error;

/// Error type for all store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying database failure.
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    /// Audit log or credential file I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization of a stored blob failed.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A queue row was asked to make an illegal status transition.
    #[error("invalid message transition: {id} is not in '{expected}'")]
    InvalidTransition { id: String, expected: &'static str },

    /// Credential store cipher failure (wrong passphrase or corrupt file).
    #[error("credential store error: {0}")]
    Crypto(String),

    /// Encrypted credentials exist but no passphrase was provided.
    #[error("credential store is encrypted and no passphrase is set")]
    MissingPassphrase,
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Current time in RFC 3339, the timestamp format used across all tables.
pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
