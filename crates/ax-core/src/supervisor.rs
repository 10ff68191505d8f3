//! Subsystem wiring.
//!
//! The supervisor owns every privileged resource for its lifetime: the
//! database, the audit log, the taint engine, both sockets, and the
//! sandbox back-end. Workers own only their workspace directory and their
//! socket connections. Components reference each other by id through
//! narrow seams (the audit sink, the queue) rather than holding each
//! other, and credential secrets zero themselves when the last handle
//! drops at shutdown.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, info, warn};

use ax_ipc::handlers::{HandlerDeps, HandlerRegistry, HttpProviderClient, NullBrowserDriver,
    NullDelegateSpawner};
use ax_ipc::IpcServer;
use ax_router::prompt::{IdentityFiles, PromptContext};
use ax_router::{
    DispatchOutcome, Dispatcher, PromptAssembler, Router, RouterError, SessionAddress,
    WorkerRunner,
};
use ax_sandbox::{select_backend, SandboxBackend, SandboxSpec};
use ax_store::{
    AuditLog, Credentials, Database, MessageQueue, QueuedMessage, ScheduleStore, SessionStore,
};
use ax_taint::TaintEngine;

use crate::channel::Channel;
use crate::config::{ActiveHours, Config};
use crate::{CoreError, Result};

/// Environment variable overriding the home directory.
pub const ENV_HOME: &str = "AX_HOME";
/// Environment variable overriding the data directory.
pub const ENV_DATA_DIR: &str = "AX_DATA_DIR";
/// Environment variable overriding the worker command.
pub const ENV_WORKER_CMD: &str = "AX_WORKER_CMD";
/// Environment variable with the search API key.
pub const ENV_SEARCH_API_KEY: &str = "AX_SEARCH_API_KEY";

const DEFAULT_WORKER_CMD: &str = "ax-worker";

/// Parallel dispatcher loops; sessions beyond this number queue behind the
/// busiest loops, FIFO per session either way.
const DISPATCHER_LOOPS: usize = 4;

/// Assumed model context window for prompt budgeting.
const CONTEXT_WINDOW: u32 = 200_000;

/// On-disk layout under the data directory.
#[derive(Debug, Clone)]
pub struct DataDirs {
    pub root: PathBuf,
    pub db_path: PathBuf,
    pub audit_path: PathBuf,
    pub socket_dir: PathBuf,
    pub identity_dir: PathBuf,
    pub skills_dir: PathBuf,
    pub workspaces_dir: PathBuf,
}

impl DataDirs {
    /// Resolve the data directory: `AX_DATA_DIR`, else `AX_HOME/.ax`,
    /// else `~/.ax`.
    pub fn resolve() -> Result<Self> {
        let root = if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
            PathBuf::from(dir)
        } else if let Ok(home) = std::env::var(ENV_HOME) {
            PathBuf::from(home).join(".ax")
        } else {
            dirs::home_dir()
                .ok_or_else(|| {
                    CoreError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "no home directory",
                    ))
                })?
                .join(".ax")
        };
        Ok(Self::at(root))
    }

    /// Layout rooted at an explicit directory.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            db_path: root.join("ax.db"),
            audit_path: root.join("audit.jsonl"),
            socket_dir: root.join("sock"),
            identity_dir: root.join("identity"),
            skills_dir: root.join("skills"),
            workspaces_dir: root.join("workspaces"),
            root,
        }
    }

    /// Create every directory.
    pub fn prepare(&self) -> Result<()> {
        for dir in [
            &self.root,
            &self.socket_dir,
            &self.identity_dir,
            &self.skills_dir,
            &self.workspaces_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn ipc_socket(&self) -> PathBuf {
        self.socket_dir.join("ipc.sock")
    }

    pub fn proxy_socket(&self) -> PathBuf {
        self.socket_dir.join("proxy.sock")
    }
}

/// Load whatever identity files exist.
pub fn load_identity(identity_dir: &Path) -> IdentityFiles {
    let read = |name: &str| std::fs::read_to_string(identity_dir.join(name)).ok();
    IdentityFiles {
        bootstrap: read("bootstrap.md"),
        soul: read("soul.md"),
        identity: read("identity.md"),
        user: read("user.md"),
        user_bootstrap: read("user-bootstrap.md"),
        agents: read("agents.md"),
        heartbeat: read("heartbeat.md"),
    }
}

/// Runs a sandboxed worker process for one claimed message.
///
/// The worker receives one JSON document on stdin (`prompt`, `content`,
/// `session_id`, socket paths) and must print its final response text to
/// stdout. Everything else it wants to do goes through the IPC socket.
pub struct SandboxWorkerRunner {
    backend: Box<dyn SandboxBackend>,
    dirs: DataDirs,
    config: Config,
    taint: Arc<TaintEngine>,
    assembler: PromptAssembler,
    worker_cmd: String,
}

impl SandboxWorkerRunner {
    pub fn new(config: Config, dirs: DataDirs, taint: Arc<TaintEngine>) -> Result<Self> {
        let backend = select_backend(
            config.sandbox.container_image.is_some(),
            config.sandbox.allow_unsandboxed,
        )?;
        Ok(Self {
            backend,
            dirs,
            config,
            taint,
            assembler: PromptAssembler::standard(),
            worker_cmd: std::env::var(ENV_WORKER_CMD)
                .unwrap_or_else(|_| DEFAULT_WORKER_CMD.to_string()),
        })
    }

    fn spec_for(&self, message: &QueuedMessage) -> Result<SandboxSpec> {
        let workspace = ax_pathsafe::constrain(
            &self.dirs.workspaces_dir,
            &[message.session_id.as_str()],
        )
        .map_err(|e| CoreError::Io(std::io::Error::other(e.to_string())))?;
        std::fs::create_dir_all(&workspace)?;

        let mut spec = SandboxSpec::new(self.worker_cmd.clone(), workspace);
        spec.skills_dir = self.dirs.skills_dir.clone();
        spec.identity_dir = self.dirs.identity_dir.clone();
        spec.socket_dir = self.dirs.socket_dir.clone();
        spec.timeout_secs = self.config.sandbox.timeout_sec;
        spec.memory_mb = self.config.sandbox.memory_mb;
        spec.container_image = self.config.sandbox.container_image.clone();
        Ok(spec)
    }

    fn prompt_for(&self, message: &QueuedMessage, spec: &SandboxSpec) -> String {
        let snapshot = self.taint.snapshot(&message.session_id);
        let ctx = PromptContext {
            agent_type: self.config.agent.as_str().to_string(),
            sandbox_type: self.backend.kind().as_str().to_string(),
            profile: self.config.profile,
            workspace_path: spec.workspace.display().to_string(),
            skills: load_skill_texts(&self.dirs.skills_dir),
            identity: load_identity(&self.dirs.identity_dir),
            taint_ratio: snapshot.ratio,
            taint_threshold: self.config.profile.taint_threshold(),
            context_window: CONTEXT_WINDOW,
            history_tokens: ax_taint::estimate_tokens(&message.content)
                .min(u64::from(u32::MAX)) as u32,
            reply_optional: message.channel == "scheduler",
        };
        self.assembler.assemble(&ctx)
    }
}

#[async_trait]
impl WorkerRunner for SandboxWorkerRunner {
    async fn run(&self, message: &QueuedMessage) -> ax_router::Result<String> {
        let spec = self
            .spec_for(message)
            .map_err(|e| RouterError::Worker(e.to_string()))?;
        let prompt = self.prompt_for(message, &spec);

        let mut handle = self
            .backend
            .spawn(&spec)
            .await
            .map_err(|e| RouterError::Worker(e.to_string()))?;

        let input = json!({
            "session_id": message.session_id,
            "prompt": prompt,
            "content": message.content,
            "ipc_socket": self.dirs.ipc_socket(),
            "proxy_socket": self.dirs.proxy_socket(),
        });

        if let Some(mut stdin) = handle.stdin() {
            let payload = serde_json::to_vec(&input)
                .map_err(|e| RouterError::Internal(e.to_string()))?;
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| RouterError::Worker(e.to_string()))?;
            drop(stdin);
        }

        let mut output = String::new();
        if let Some(mut stdout) = handle.stdout() {
            stdout
                .read_to_string(&mut output)
                .await
                .map_err(|e| RouterError::Worker(e.to_string()))?;
        }

        let status = handle
            .wait()
            .await
            .map_err(|e| RouterError::Worker(e.to_string()))?;
        if !status.success() {
            return Err(RouterError::Worker(format!(
                "worker exited with {status}"
            )));
        }

        Ok(output.trim_end().to_string())
    }
}

fn load_skill_texts(skills_dir: &Path) -> Vec<String> {
    let mut texts = Vec::new();
    if let Ok(entries) = std::fs::read_dir(skills_dir) {
        let mut paths: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("md"))
            .collect();
        paths.sort();
        for path in paths {
            if let Ok(text) = std::fs::read_to_string(&path) {
                texts.push(text);
            }
        }
    }
    texts
}

// ============================================================================
// Active hours
// ============================================================================

fn timezone_offset_minutes(timezone: &str) -> i32 {
    match timezone {
        "utc" => 0,
        "local" => chrono::Local::now().offset().local_minus_utc() / 60,
        other => {
            let sign = if other.starts_with('-') { -1 } else { 1 };
            let rest = &other[1..];
            let minutes = rest
                .split_once(':')
                .and_then(|(h, m)| Some(h.parse::<i32>().ok()? * 60 + m.parse::<i32>().ok()?))
                .unwrap_or(0);
            sign * minutes
        }
    }
}

fn parse_hhmm(value: &str) -> u32 {
    value
        .split_once(':')
        .and_then(|(h, m)| Some(h.parse::<u32>().ok()? * 60 + m.parse::<u32>().ok()?))
        .unwrap_or(0)
}

/// Whether `now` falls inside the configured active window. A window with
/// `end` before `start` wraps midnight.
pub fn within_active_hours(hours: &ActiveHours, now: DateTime<Utc>) -> bool {
    let offset = timezone_offset_minutes(&hours.timezone);
    let minute_of_day =
        ((now.hour() * 60 + now.minute()) as i32 + offset).rem_euclid(24 * 60) as u32;

    let start = parse_hhmm(&hours.start);
    let end = parse_hhmm(&hours.end);
    if start <= end {
        (start..end).contains(&minute_of_day)
    } else {
        minute_of_day >= start || minute_of_day < end
    }
}

// ============================================================================
// Supervisor
// ============================================================================

/// The assembled system, ready to run.
pub struct Supervisor {
    pub config: Config,
    pub dirs: DataDirs,
    pub db: Database,
    pub queue: MessageQueue,
    pub sessions: SessionStore,
    pub schedule: ScheduleStore,
    pub audit: Arc<AuditLog>,
    pub taint: Arc<TaintEngine>,
    pub credentials: Arc<Credentials>,
    pub router: Arc<Router>,
}

impl Supervisor {
    /// Open stores and build the component graph. Fails closed: any error
    /// here aborts startup.
    pub async fn start(config: Config, dirs: DataDirs) -> Result<Self> {
        dirs.prepare()?;

        let db = Database::open(&dirs.db_path).await?;
        let audit = Arc::new(AuditLog::new(&dirs.audit_path));
        let taint = Arc::new(TaintEngine::new(config.profile));
        let credentials = Arc::new(Credentials::load(&dirs.root)?);
        if credentials.is_empty() {
            warn!("no upstream credential configured; model calls will fail closed");
        }

        let sessions = SessionStore::new(db.clone());
        let queue = MessageQueue::new(db.clone());
        let schedule = ScheduleStore::new(db.clone());
        let router = Arc::new(Router::new(
            Arc::clone(&taint),
            Arc::clone(&audit),
            sessions.clone(),
            queue.clone(),
        ));

        info!(agent = config.agent.as_str(), profile = config.profile.as_str(), "supervisor ready");
        Ok(Self {
            config,
            dirs,
            db,
            queue,
            sessions,
            schedule,
            audit,
            taint,
            credentials,
            router,
        })
    }

    /// Build the IPC handler registry for this supervisor.
    pub fn handler_registry(&self) -> HandlerRegistry {
        let llm_primary = format!("{}/default", self.config.providers.llm);
        HandlerRegistry::new(HandlerDeps {
            db: self.db.clone(),
            audit_log: Arc::clone(&self.audit),
            taint: Arc::clone(&self.taint),
            skills_root: self.dirs.skills_dir.clone(),
            identity_root: self.dirs.identity_dir.clone(),
            browser_driver: Arc::new(NullBrowserDriver),
            browser_allowlist: ax_ipc::handlers::browser::allowlist_from_env(),
            delegate_spawner: Arc::new(NullDelegateSpawner),
            max_delegation_depth: 2,
            max_concurrent_delegations: 4,
            llm_primary,
            llm_fallbacks: self.config.providers.llm_fallbacks.clone(),
            llm_default_max_tokens: self.config.default_max_tokens(),
            llm_client: Arc::new(HttpProviderClient::new(
                Arc::clone(&self.credentials),
                None,
            )),
            search_api_key: std::env::var(ENV_SEARCH_API_KEY).ok(),
        })
    }

    /// Run until `shutdown` flips true: proxy, IPC server, dispatcher
    /// loops, scheduler, and the delivery pump for the given channels.
    pub async fn run(
        self: Arc<Self>,
        channels: Vec<Arc<dyn Channel>>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<()> {
        // Proxy.
        let proxy_socket = self.dirs.proxy_socket();
        let proxy_credentials = Arc::clone(&self.credentials);
        let proxy = tokio::spawn(async move {
            if let Err(e) = ax_proxy::serve(proxy_socket, proxy_credentials, None).await {
                error!(error = %e, "proxy exited");
            }
        });

        // IPC server.
        let ipc = Arc::new(IpcServer::new(
            self.handler_registry(),
            Arc::clone(&self.taint),
            Arc::clone(&self.audit),
        ));
        let ipc_socket = self.dirs.ipc_socket();
        let ipc_task = tokio::spawn(async move {
            if let Err(e) = ipc.serve(ipc_socket).await {
                error!(error = %e, "ipc server exited");
            }
        });

        // Dispatchers.
        let runner: Arc<dyn WorkerRunner> = Arc::new(SandboxWorkerRunner::new(
            self.config.clone(),
            self.dirs.clone(),
            Arc::clone(&self.taint),
        )?);
        let (deliveries_tx, mut deliveries_rx) =
            tokio::sync::mpsc::channel::<DispatchOutcome>(64);
        let mut dispatchers = Vec::new();
        for _ in 0..DISPATCHER_LOOPS {
            let dispatcher = Dispatcher::new(
                self.queue.clone(),
                Arc::clone(&self.router),
                Arc::clone(&runner),
            );
            let tx = deliveries_tx.clone();
            let rx = shutdown.clone();
            dispatchers.push(tokio::spawn(async move {
                dispatcher.run_loop(tx, rx).await;
            }));
        }
        drop(deliveries_tx);

        // Inbound pumps, one per channel.
        let mut pumps = Vec::new();
        for channel in &channels {
            let channel = Arc::clone(channel);
            let router = Arc::clone(&self.router);
            let mut rx = shutdown.clone();
            pumps.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        message = channel.next_message() => {
                            let Some(message) = message else { return };
                            let inbound = ax_router::InboundMessage {
                                channel: channel.name().to_string(),
                                sender: message.sender,
                                content: message.content,
                            };
                            match router.handle_inbound(&message.address, inbound).await {
                                Ok(result) if !result.queued => {
                                    if let Some(notice) = result.notice {
                                        channel.deliver(&result.session_id, notice).await;
                                    }
                                }
                                Ok(_) => {}
                                Err(e) => error!(error = %e, "inbound handling failed"),
                            }
                        }
                        _ = rx.changed() => return,
                    }
                }
            }));
        }

        // Scheduler.
        let scheduler = {
            let supervisor = Arc::clone(&self);
            let mut rx = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(std::time::Duration::from_secs(60));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = supervisor.scheduler_tick().await {
                                error!(error = %e, "scheduler tick failed");
                            }
                        }
                        _ = rx.changed() => return,
                    }
                }
            })
        };

        // Delivery pump.
        loop {
            tokio::select! {
                outcome = deliveries_rx.recv() => {
                    let Some(outcome) = outcome else { break };
                    let Some(response) = outcome.response else { continue };
                    for channel in &channels {
                        if channel.name() == outcome.message.channel {
                            channel.deliver(&outcome.message.session_id, &response).await;
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        info!("supervisor shutting down");
        proxy.abort();
        ipc_task.abort();
        scheduler.abort();
        for task in dispatchers.into_iter().chain(pumps) {
            task.abort();
        }
        // Credential zeroing rides on Drop of the last Arc<Credentials>.
        Ok(())
    }

    /// Enqueue due one-shot schedule entries and heartbeats.
    pub async fn scheduler_tick(&self) -> Result<()> {
        let now = Utc::now();

        for entry in self.schedule.due(&now.to_rfc3339()).await? {
            let address = SessionAddress::dm("scheduler", &entry.session_id);
            let _ = self
                .router
                .handle_inbound(
                    &address,
                    ax_router::InboundMessage {
                        channel: "scheduler".to_string(),
                        sender: "scheduler".to_string(),
                        content: entry.prompt.clone(),
                    },
                )
                .await;
            self.schedule.remove(&entry.id).await?;
        }

        if within_active_hours(&self.config.scheduler.active_hours, now) {
            // Heartbeats are cheap to skip: only fire on the interval
            // boundary minute.
            let minute = now.hour() * 60 + now.minute();
            if u64::from(minute) % self.config.scheduler.heartbeat_interval_min == 0 {
                let identity = load_identity(&self.dirs.identity_dir);
                if let Some(heartbeat) = identity.heartbeat {
                    let address = SessionAddress::dm("scheduler", "heartbeat");
                    let _ = self
                        .router
                        .handle_inbound(
                            &address,
                            ax_router::InboundMessage {
                                channel: "scheduler".to_string(),
                                sender: "scheduler".to_string(),
                                content: heartbeat,
                            },
                        )
                        .await;
                }
            }
        }

        Ok(())
    }
}
