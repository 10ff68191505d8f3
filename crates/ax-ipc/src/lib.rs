//! # IPC Boundary
//!
//! The sandboxed worker's sole route to any privileged operation. The server
//! listens on a Unix socket owned by the supervisor; the worker sends
//! length-prefixed JSON frames naming one of a closed set of actions.
//!
//! ## Request lifecycle
//!
//! ```text
//!  frame ──▶ JSON parse ──▶ envelope ──▶ per-action schema ──▶ taint gate
//!                │              │               │                  │
//!                ▼              ▼               ▼                  ▼
//!          "Invalid JSON"  "Unknown      "Validation        policy reason
//!                           action"       failed: ..."
//!                                                                  │
//!                                                   handler ◀──────┘
//!                                                      │
//!                                    audit append (every action, any outcome)
//! ```
//!
//! A failed stage never reaches a handler, and every stage's outcome lands
//! in the audit log. Handler failures answer `{ok:false, error}` without
//! dropping the connection.
//!
//! ## Growing the surface
//!
//! There is no free-form escape hatch: adding an action means adding a
//! variant to [`schema::Action`] and a typed parameter struct. The compiler
//! then forces a schema, a dispatch arm, and (via the sensitive-action set)
//! a taint-gating decision.

pub mod context;
pub mod frame;
pub mod handlers;
pub mod schema;
pub mod server;

pub use context::ConnContext;
pub use frame::{FrameDecoder, MAX_FRAME};
pub use schema::{Action, ActionRequest};
pub use server::IpcServer;

use thiserror::Error;

/// Error taxonomy for the IPC boundary, mirroring how each kind surfaces:
/// validation verbatim to the caller, policy as structured audited reasons,
/// upstream kinds driving router fallback, resource kinds killing workers,
/// internal logged and returned generically.
#[derive(Debug, Error)]
pub enum IpcError {
    /// Input failed schema validation. Surfaced verbatim, never logged at
    /// error level.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A security policy refused the action (taint gate, allowlist, path
    /// escape). Audited.
    #[error("{0}")]
    Policy(String),

    /// Recoverable upstream failure: rate limit, 5xx, timeout.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Permanent upstream failure: auth, malformed request, not found.
    #[error("upstream error: {0}")]
    UpstreamPermanent(String),

    /// Resource exhaustion or spawn failure; the worker dies, the session
    /// survives.
    #[error("resource error: {0}")]
    Resource(String),

    /// A bug. Full detail goes to the log; callers get this generic text.
    #[error("internal error")]
    Internal(String),

    /// Socket-level failure on the connection itself.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ax_store::StoreError> for IpcError {
    fn from(e: ax_store::StoreError) -> Self {
        IpcError::Internal(e.to_string())
    }
}

impl From<ax_pathsafe::PathError> for IpcError {
    fn from(e: ax_pathsafe::PathError) -> Self {
        match e {
            ax_pathsafe::PathError::Escape { .. } => IpcError::Policy(format!("Blocked: {e}")),
            other => IpcError::Internal(other.to_string()),
        }
    }
}

/// Result alias for IPC operations.
pub type Result<T> = std::result::Result<T, IpcError>;
