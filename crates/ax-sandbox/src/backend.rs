//! Isolation back-ends.
//!
//! Each back-end builds the same minimized-environment `Command` and layers
//! its own containment on top. Network denial is the load-bearing property:
//! the namespace back-end removes the network by construction, seatbelt by
//! a default-deny profile, the container runtime by `--network none`. The
//! plain subprocess cannot deny networking and therefore requires an
//! explicit opt-in that logs a warning.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::handle::SandboxHandle;
use crate::spec::SandboxSpec;
use crate::{Result, SandboxError, SandboxKind};

/// Fixed path, deliberately not PATH-resolved: a tampered /usr/bin implies
/// the attacker already owns the host.
const SEATBELT_EXECUTABLE: &str = "/usr/bin/sandbox-exec";

/// Socket file names the seatbelt profile must permit connecting to.
const SOCKET_FILES: &[&str] = &["ipc.sock", "proxy.sock"];

/// The spawn contract every back-end implements.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    fn kind(&self) -> SandboxKind;

    /// Cheap, side-effect-free availability probe.
    fn is_available(&self) -> bool;

    /// Launch a worker. The returned handle already has the host-side kill
    /// timer armed.
    async fn spawn(&self, spec: &SandboxSpec) -> Result<SandboxHandle>;
}

/// Base command shared by all back-ends: cleared environment, declared
/// variables only, piped stdio, workspace cwd.
fn base_command(program: &str, spec: &SandboxSpec) -> Command {
    let mut cmd = Command::new(program);
    cmd.env_clear();
    for (key, value) in spec.env() {
        cmd.env(key, value);
    }
    cmd.current_dir(&spec.workspace)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

fn spawn_err(kind: &'static str) -> impl FnOnce(std::io::Error) -> SandboxError {
    move |source| SandboxError::Spawn { kind, source }
}

// ============================================================================
// Subprocess (no isolation)
// ============================================================================

/// No-isolation fallback. Construction requires acknowledging the risk.
pub struct SubprocessBackend {
    _acknowledged: (),
}

impl SubprocessBackend {
    /// The only constructor; logs the warning the contract demands.
    pub fn allow_with_warning() -> Self {
        warn!("sandboxing DISABLED: worker runs as a plain subprocess with host network access");
        Self { _acknowledged: () }
    }
}

#[async_trait]
impl SandboxBackend for SubprocessBackend {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Subprocess
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn spawn(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        let mut cmd = base_command(&spec.program, spec);
        cmd.args(&spec.args);
        apply_rlimits(&mut cmd, spec.memory_mb);

        let child = cmd.spawn().map_err(spawn_err("subprocess"))?;
        Ok(SandboxHandle::supervise(child, spec.timeout_secs))
    }
}

// ============================================================================
// Linux namespaces
// ============================================================================

/// Linux isolation: fresh network and UTS namespaces plus no-new-privs and
/// rlimits, applied between fork and exec.
pub struct LinuxNamespaceBackend;

#[async_trait]
impl SandboxBackend for LinuxNamespaceBackend {
    fn kind(&self) -> SandboxKind {
        SandboxKind::LinuxNamespace
    }

    fn is_available(&self) -> bool {
        cfg!(target_os = "linux") && Path::new("/proc/self/ns/net").exists()
    }

    async fn spawn(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        let mut cmd = base_command(&spec.program, spec);
        cmd.args(&spec.args);
        apply_rlimits(&mut cmd, spec.memory_mb);

        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                // New network namespace: the worker sees no interfaces at
                // all. This must succeed; running with host networking when
                // isolation was requested is not acceptable.
                if libc::unshare(libc::CLONE_NEWNET | libc::CLONE_NEWUTS) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(spawn_err("linux-namespace"))?;
        Ok(SandboxHandle::supervise(child, spec.timeout_secs))
    }
}

// ============================================================================
// macOS seatbelt
// ============================================================================

/// macOS isolation through `sandbox-exec` with a generated default-deny
/// profile.
pub struct SeatbeltBackend;

impl SeatbeltBackend {
    /// Build the SBPL profile for a spec: default deny, reads scoped to the
    /// system prefixes and the declared mounts, writes to the writable
    /// mounts, outbound network only to the host's sockets.
    pub fn profile(spec: &SandboxSpec) -> String {
        let mut reads = vec![
            "/usr".to_string(),
            "/bin".to_string(),
            "/sbin".to_string(),
            "/System".to_string(),
            "/Library".to_string(),
            "/private/tmp".to_string(),
        ];
        let mut writes = vec!["/private/tmp".to_string()];

        for (path, writable) in spec.mounts() {
            let path = path.display().to_string();
            reads.push(path.clone());
            if writable {
                writes.push(path);
            }
        }

        let read_rules = reads
            .iter()
            .map(|p| format!("(subpath \"{p}\")"))
            .collect::<Vec<_>>()
            .join(" ");
        let write_rules = writes
            .iter()
            .map(|p| format!("(subpath \"{p}\")"))
            .collect::<Vec<_>>()
            .join(" ");
        let socket_rules = SOCKET_FILES
            .iter()
            .map(|name| format!("(literal \"{}\")", spec.socket_dir.join(name).display()))
            .collect::<Vec<_>>()
            .join(" ");

        format!(
            "(version 1)\n\
             (deny default)\n\
             (allow file-read* {read_rules})\n\
             (allow file-write* {write_rules})\n\
             (allow process-exec)\n\
             (allow process-fork)\n\
             (allow sysctl-read)\n\
             (allow mach-lookup)\n\
             (allow signal (target self))\n\
             (allow network-outbound {socket_rules})\n"
        )
    }
}

#[async_trait]
impl SandboxBackend for SeatbeltBackend {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Seatbelt
    }

    fn is_available(&self) -> bool {
        cfg!(target_os = "macos") && Path::new(SEATBELT_EXECUTABLE).exists()
    }

    async fn spawn(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        let profile = Self::profile(spec);

        let mut cmd = base_command(SEATBELT_EXECUTABLE, spec);
        cmd.arg("-p").arg(profile).arg("--").arg(&spec.program);
        cmd.args(&spec.args);
        apply_rlimits(&mut cmd, spec.memory_mb);

        let child = cmd.spawn().map_err(spawn_err("seatbelt"))?;
        Ok(SandboxHandle::supervise(child, spec.timeout_secs))
    }
}

// ============================================================================
// Container
// ============================================================================

/// Container runtime with networking detached. Requires an image in the
/// spec; unavailable without one.
pub struct ContainerBackend {
    runtime: String,
}

impl ContainerBackend {
    pub fn new() -> Self {
        Self {
            runtime: "docker".to_string(),
        }
    }

    fn runtime_on_path(&self) -> bool {
        std::env::var_os("PATH")
            .map(|paths| {
                std::env::split_paths(&paths).any(|dir| dir.join(&self.runtime).is_file())
            })
            .unwrap_or(false)
    }
}

impl Default for ContainerBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxBackend for ContainerBackend {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Container
    }

    fn is_available(&self) -> bool {
        self.runtime_on_path()
    }

    async fn spawn(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        let image = spec.container_image.as_deref().ok_or_else(|| {
            SandboxError::Spawn {
                kind: "container",
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "no container image configured",
                ),
            }
        })?;

        let mut cmd = base_command(&self.runtime, spec);
        cmd.arg("run")
            .arg("--rm")
            .arg("--network")
            .arg("none")
            .arg("--memory")
            .arg(format!("{}m", spec.memory_mb));

        for (path, writable) in spec.mounts() {
            let mode = if writable { "rw" } else { "ro" };
            let host = path.display();
            cmd.arg("-v").arg(format!("{host}:{host}:{mode}"));
        }
        for (key, value) in spec.env() {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }

        cmd.arg(image).arg(&spec.program).args(&spec.args);

        let child = cmd.spawn().map_err(spawn_err("container"))?;
        Ok(SandboxHandle::supervise(child, spec.timeout_secs))
    }
}

// ============================================================================
// Selection
// ============================================================================

/// Pick the strictest available back-end.
///
/// Order: container (when an image is configured), then the platform
/// mechanism, then plain subprocess only when `allow_unsandboxed` opts in.
pub fn select_backend(
    container_image_configured: bool,
    allow_unsandboxed: bool,
) -> Result<Box<dyn SandboxBackend>> {
    let container = ContainerBackend::new();
    if container_image_configured && container.is_available() {
        info!("sandbox back-end: container");
        return Ok(Box::new(container));
    }

    let namespace = LinuxNamespaceBackend;
    if namespace.is_available() {
        info!("sandbox back-end: linux-namespace");
        return Ok(Box::new(namespace));
    }

    let seatbelt = SeatbeltBackend;
    if seatbelt.is_available() {
        info!("sandbox back-end: seatbelt");
        return Ok(Box::new(seatbelt));
    }

    if allow_unsandboxed {
        return Ok(Box::new(SubprocessBackend::allow_with_warning()));
    }

    Err(SandboxError::NoBackend)
}

/// Address-space limit installed between fork and exec.
fn apply_rlimits(cmd: &mut Command, memory_mb: u64) {
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(move || {
            let bytes = memory_mb.saturating_mul(1024 * 1024);
            let limit = libc::rlimit {
                rlim_cur: bytes,
                rlim_max: bytes,
            };
            if libc::setrlimit(libc::RLIMIT_AS, &limit) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    #[cfg(not(unix))]
    let _ = (cmd, memory_mb);
}
