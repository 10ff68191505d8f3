//! # AX Supervisor Core
//!
//! The long-running process that owns everything: the session store, audit
//! log, taint engine, IPC socket, proxy socket, sandbox supervision, and
//! the dispatcher. Channels hand it messages; sandboxed workers talk back
//! only through the sockets it controls.
//!
//! Subsystem wiring lives in [`supervisor`]; the strict configuration
//! schema in [`config`]; the closed provider registry in [`providers`].

pub mod channel;
pub mod config;
pub mod providers;
pub mod supervisor;

pub use channel::{Channel, ChannelMessage};
pub use config::{Config, ConfigError};
pub use supervisor::{DataDirs, Supervisor};

use thiserror::Error;

/// Errors from supervisor startup and operation.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] ax_store::StoreError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] ax_sandbox::SandboxError),

    #[error("router error: {0}")]
    Router(#[from] ax_router::RouterError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
