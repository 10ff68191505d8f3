//! Handle to a running sandboxed worker.

use std::process::ExitStatus;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::Result;

/// Grace period added to the configured timeout before the host-side
/// SIGKILL fires. In-sandbox enforcement gets first shot; this is the
/// backstop.
pub(crate) const KILL_GRACE_SECS: u64 = 5;

/// A live worker: stdio, pid, an awaitable exit, and a kill switch.
///
/// Dropping the handle aborts the kill timer but leaves the process to the
/// runtime's usual child reaping; callers that care about the outcome must
/// `wait`.
pub struct SandboxHandle {
    child: Child,
    pid: u32,
    kill_timer: Option<JoinHandle<()>>,
}

impl SandboxHandle {
    /// Wrap a spawned child and arm the host-side kill timer.
    pub(crate) fn supervise(child: Child, timeout_secs: u64) -> Self {
        let pid = child.id().unwrap_or_default();
        let deadline = timeout_secs + KILL_GRACE_SECS;
        let kill_timer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(deadline)).await;
            // pid 0 would signal our own process group; a child that already
            // exited has no id and needs no backstop.
            if pid == 0 {
                return;
            }
            warn!(pid, deadline, "worker exceeded wall clock, sending SIGKILL");
            // The timer outlives any borrow of the child, so signal by pid.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGKILL);
            }
        });

        Self {
            child,
            pid,
            kill_timer: Some(kill_timer),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Wait for the worker to exit; disarms the kill timer.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.disarm();
        Ok(status)
    }

    /// Kill the worker now.
    pub async fn kill(&mut self) -> Result<()> {
        self.disarm();
        self.child.kill().await?;
        Ok(())
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.kill_timer.take() {
            timer.abort();
        }
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        self.disarm();
    }
}
