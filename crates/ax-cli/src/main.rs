//! The `ax` binary: serve, chat, send, configure, bootstrap.

mod chat;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use ax_core::config::starter_config;
use ax_core::{Config, DataDirs, Supervisor};

#[derive(Parser)]
#[command(name = "ax")]
#[command(version, disable_version_flag = true)]
#[command(about = "AX - security-first personal agent host")]
struct Cli {
    /// Print version.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor (default).
    Serve {
        /// Detach and run in the background.
        #[arg(long)]
        daemon: bool,
        /// Override the IPC socket path.
        #[arg(long)]
        socket: Option<PathBuf>,
        /// Configuration file path.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Verbose logging.
        #[arg(long)]
        verbose: bool,
    },
    /// Interactive conversation through the full inbound/outbound pipeline.
    Chat {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Send a single message and print the response.
    Send {
        /// Message content.
        message: String,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Write a starter configuration (and credential store when a
    /// passphrase is set).
    Configure {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Overwrite an existing configuration file.
        #[arg(long)]
        force: bool,
    },
    /// Seed the identity directory with a bootstrap script.
    Bootstrap,
}

fn config_path(explicit: Option<PathBuf>, dirs: &DataDirs) -> PathBuf {
    explicit.unwrap_or_else(|| dirs.root.join("config.yaml"))
}

fn load_config(explicit: Option<PathBuf>, dirs: &DataDirs) -> anyhow::Result<Config> {
    let path = config_path(explicit, dirs);
    Config::load(&path).with_context(|| format!("loading {}", path.display()))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let command = cli.command.unwrap_or(Commands::Serve {
        daemon: false,
        socket: None,
        config: None,
        verbose: false,
    });

    let verbose = matches!(&command, Commands::Serve { verbose: true, .. });
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(if verbose { "debug" } else { "info" })
            }),
        )
        .init();

    if let Commands::Serve { daemon: true, .. } = &command {
        // Detach before the runtime starts; forking after would strand the
        // worker threads.
        if unsafe { libc::daemon(1, 0) } != 0 {
            anyhow::bail!("failed to daemonize: {}", std::io::Error::last_os_error());
        }
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(command))
}

async fn run(command: Commands) -> anyhow::Result<()> {
    let dirs = DataDirs::resolve()?;

    match command {
        Commands::Serve { socket, config, .. } => {
            let config = load_config(config, &dirs)?;
            let mut dirs = dirs;
            if let Some(socket) = socket {
                // The flag names the IPC socket; its parent becomes the
                // socket directory for both sockets.
                if let Some(parent) = socket.parent() {
                    dirs.socket_dir = parent.to_path_buf();
                }
            }

            let supervisor = Arc::new(Supervisor::start(config, dirs).await?);
            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown requested");
                let _ = shutdown_tx.send(true);
            });

            supervisor.run(Vec::new(), shutdown_rx).await?;
            Ok(())
        }
        Commands::Chat { config } => {
            let config = load_config(config, &dirs)?;
            chat::run_chat(config, dirs).await
        }
        Commands::Send { message, config } => {
            let config = load_config(config, &dirs)?;
            let response = chat::run_once(config, dirs, &message).await?;
            println!("{response}");
            Ok(())
        }
        Commands::Configure { config, force } => {
            dirs.prepare()?;
            let path = config_path(config, &dirs);
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            std::fs::write(&path, serde_yaml::to_string(&starter_config())?)?;
            println!("wrote {}", path.display());

            write_credential_store(&dirs)?;
            Ok(())
        }
        Commands::Bootstrap => {
            dirs.prepare()?;
            let soul = dirs.identity_dir.join("soul.md");
            if soul.exists() {
                anyhow::bail!("identity already established ({} exists)", soul.display());
            }
            let bootstrap = dirs.identity_dir.join("bootstrap.md");
            std::fs::write(&bootstrap, BOOTSTRAP_TEMPLATE)?;
            println!("wrote {}", bootstrap.display());
            println!("run `ax chat` to let the agent work through its bootstrap");
            Ok(())
        }
    }
}

/// Seed text for a brand-new agent. Everything else waits until the agent
/// writes its soul file through the audited identity actions.
const BOOTSTRAP_TEMPLATE: &str = "\
# Bootstrap

You are waking up for the first time. You have no identity yet.

Talk with your user about who you should be: your name, your voice, what
you are for. When you both know, write the result with the identity_write
action as your soul file. Until then, identity discovery is your only
task.
";

/// When the operator provided a passphrase and credentials in the
/// environment, seal them into the encrypted store.
fn write_credential_store(dirs: &DataDirs) -> anyhow::Result<()> {
    use ax_store::credentials::{write_store, ENV_API_KEY, ENV_OAUTH_TOKEN, ENV_PASSPHRASE};

    let Ok(passphrase) = std::env::var(ENV_PASSPHRASE) else {
        return Ok(());
    };

    let mut map = std::collections::HashMap::new();
    if let Ok(key) = std::env::var(ENV_API_KEY) {
        map.insert("api_key".to_string(), key);
    }
    if let Ok(token) = std::env::var(ENV_OAUTH_TOKEN) {
        map.insert("oauth_token".to_string(), token);
    }
    if map.is_empty() {
        return Ok(());
    }

    write_store(&dirs.root, &map, passphrase.as_bytes())?;
    println!("wrote encrypted credential store");
    Ok(())
}
