//! # Sandbox Supervisor
//!
//! Launches the agent worker under an OS-level isolation mechanism. The rest
//! of the host only sees the contract in this crate: build a [`SandboxSpec`],
//! pick a back-end, get a [`SandboxHandle`] back.
//!
//! ## Universal invariants
//!
//! Every back-end must hold these, in descending order of importance:
//!
//! 1. **Network denied by default.** The worker's only network surface is
//!    the IPC socket directory bind-mounted (or bind-visible) into it.
//! 2. **Memory and wall-clock limits** from the [`SandboxSpec`]. The host
//!    additionally arms its own SIGKILL timer at `timeout + grace` no
//!    matter what the back-end promises.
//! 3. **Filesystem scoped**: workspace rw, skills ro, identity ro, socket
//!    dir rw, plus the optional tier mounts.
//! 4. **Environment minimized**: only the declared variables. Host home,
//!    host user, and host caches must not leak into the worker.
//! 5. **`is_available` is cheap and side-effect-free.**
//!
//! Back-end selection picks the strictest available mechanism; the plain
//! subprocess fallback is allowed only with an explicit warning.

mod backend;
mod handle;
mod spec;

pub use backend::{select_backend, ContainerBackend, LinuxNamespaceBackend, SandboxBackend,
    SeatbeltBackend, SubprocessBackend};
pub use handle::SandboxHandle;
pub use spec::SandboxSpec;

use thiserror::Error;

/// The closed set of isolation back-ends.
///
/// Constructed through [`select_backend`] or an explicit constructor; never
/// resolved from configuration strings at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxKind {
    /// No isolation beyond a minimized environment. Last resort.
    Subprocess,
    /// macOS `sandbox-exec` with a generated default-deny profile.
    Seatbelt,
    /// Linux: new network and UTS namespaces, no-new-privs, rlimits.
    LinuxNamespace,
    /// Container runtime with networking detached.
    Container,
}

impl SandboxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxKind::Subprocess => "subprocess",
            SandboxKind::Seatbelt => "seatbelt",
            SandboxKind::LinuxNamespace => "linux-namespace",
            SandboxKind::Container => "container",
        }
    }
}

/// Errors from sandbox construction and supervision.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The worker process could not be started.
    #[error("sandbox spawn failed ({kind}): {source}")]
    Spawn {
        kind: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// No back-end is available on this host.
    #[error("no sandbox back-end available")]
    NoBackend,

    /// Waiting on or signalling the worker failed.
    #[error("worker supervision failed: {0}")]
    Supervise(#[from] std::io::Error),
}

/// Result alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;
