//! # Message Router & Prompt Core
//!
//! Accepts inbound messages from channels, scans them for injection,
//! embeds canary tokens, enqueues them for the per-session dispatcher,
//! re-scans worker output, and enforces canary non-leakage. Also home to
//! prompt assembly: the ordered module set that builds each worker's
//! system prompt under a token budget.
//!
//! ## The canary invariant
//!
//! Every inbound message mints a fresh high-entropy token that rides into
//! the worker's context. If that token ever appears in worker output, the
//! output is proof of prompt leakage and is replaced wholesale; a scrub
//! pass additionally rewrites any occurrence even when the leak check
//! somehow missed. The token delivered to a channel is never the one that
//! came back.

pub mod canary;
pub mod dispatch;
pub mod prompt;
pub mod router;
pub mod scanner;
pub mod session;

pub use dispatch::{DispatchOutcome, Dispatcher, WorkerRunner};
pub use prompt::{PromptAssembler, PromptContext, PromptModule};
pub use router::{InboundMessage, InboundResult, OutboundResult, Router};
pub use scanner::{ScanReport, ScanRule, Scanner, Severity, Verdict};
pub use session::{Scope, SessionAddress};

use thiserror::Error;

/// Router-level errors. Scan verdicts are not errors; they are results.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("store error: {0}")]
    Store(#[from] ax_store::StoreError),

    /// Worker execution failed; the message is marked `error` and the
    /// session survives.
    #[error("worker failed: {0}")]
    Worker(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias for router operations.
pub type Result<T> = std::result::Result<T, RouterError>;
