//! Spawn specification: what the worker runs, what it may touch, and the
//! resource bounds it runs under.

use std::path::PathBuf;

/// Everything a back-end needs to launch one worker.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Worker executable.
    pub program: String,
    pub args: Vec<String>,

    /// Read-write working directory owned by this worker alone.
    pub workspace: PathBuf,
    /// Read-only skills directory.
    pub skills_dir: PathBuf,
    /// Read-only agent identity directory.
    pub identity_dir: PathBuf,
    /// Directory holding the IPC (and proxy) sockets; read-write.
    pub socket_dir: PathBuf,

    /// Optional tier: shared agent workspace, read-only.
    pub agent_workspace: Option<PathBuf>,
    /// Optional tier: user workspace, read-write.
    pub user_workspace: Option<PathBuf>,
    /// Optional tier: scratch space, read-write.
    pub scratch_dir: Option<PathBuf>,

    /// Additional declared variables (name, value). Nothing else leaks.
    pub extra_env: Vec<(String, String)>,

    /// Wall-clock limit. The host kill timer fires at this plus grace.
    pub timeout_secs: u64,
    /// Address-space limit for the worker.
    pub memory_mb: u64,

    /// Image for the container back-end; that back-end is unavailable
    /// without one.
    pub container_image: Option<String>,
}

impl SandboxSpec {
    pub fn new(program: impl Into<String>, workspace: impl Into<PathBuf>) -> Self {
        let workspace = workspace.into();
        Self {
            program: program.into(),
            args: Vec::new(),
            skills_dir: workspace.join("skills"),
            identity_dir: workspace.join("identity"),
            socket_dir: workspace.join("sock"),
            workspace,
            agent_workspace: None,
            user_workspace: None,
            scratch_dir: None,
            extra_env: Vec::new(),
            timeout_secs: 300,
            memory_mb: 512,
            container_image: None,
        }
    }

    /// The complete environment the worker sees. The spawn path calls
    /// `env_clear()` first; this list is the whole surface.
    ///
    /// HOME points into the workspace and the cache variables point at /tmp
    /// so nothing the worker's tooling writes lands in (or reads from) the
    /// host user's directories.
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("AX_WORKSPACE".to_string(), self.workspace.display().to_string()),
            ("AX_SKILLS_DIR".to_string(), self.skills_dir.display().to_string()),
            ("AX_IDENTITY_DIR".to_string(), self.identity_dir.display().to_string()),
            ("AX_IPC_SOCKET_DIR".to_string(), self.socket_dir.display().to_string()),
            ("HOME".to_string(), self.workspace.display().to_string()),
            ("TMPDIR".to_string(), "/tmp".to_string()),
            ("XDG_CACHE_HOME".to_string(), "/tmp/.cache".to_string()),
            ("PATH".to_string(), "/usr/local/bin:/usr/bin:/bin".to_string()),
        ];

        if let Some(dir) = &self.agent_workspace {
            env.push(("AX_AGENT_WORKSPACE".to_string(), dir.display().to_string()));
        }
        if let Some(dir) = &self.user_workspace {
            env.push(("AX_USER_WORKSPACE".to_string(), dir.display().to_string()));
        }
        if let Some(dir) = &self.scratch_dir {
            env.push(("AX_SCRATCH_DIR".to_string(), dir.display().to_string()));
        }

        env.extend(self.extra_env.iter().cloned());
        env
    }

    /// Mounts as (host path, writable) pairs, for back-ends that bind-mount.
    pub fn mounts(&self) -> Vec<(PathBuf, bool)> {
        let mut mounts = vec![
            (self.workspace.clone(), true),
            (self.skills_dir.clone(), false),
            (self.identity_dir.clone(), false),
            (self.socket_dir.clone(), true),
        ];
        if let Some(dir) = &self.agent_workspace {
            mounts.push((dir.clone(), false));
        }
        if let Some(dir) = &self.user_workspace {
            mounts.push((dir.clone(), true));
        }
        if let Some(dir) = &self.scratch_dir {
            mounts.push((dir.clone(), true));
        }
        mounts
    }
}
