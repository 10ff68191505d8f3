//! Interactive chat and one-shot send.
//!
//! Both run the real pipeline: inbound scan, canary, queue, dispatch,
//! outbound scan. The worker seat is filled by a runner that calls the
//! model through the provider router directly, which keeps `ax chat`
//! usable on hosts that have no worker image installed.

use std::io::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use ax_core::supervisor::load_identity;
use ax_core::{Config, DataDirs, Supervisor};
use ax_ipc::handlers::llm::LlmHandler;
use ax_ipc::handlers::{HttpProviderClient, ProviderClient};
use ax_router::prompt::{PromptAssembler, PromptContext};
use ax_router::{
    Dispatcher, InboundMessage, RouterError, SessionAddress, WorkerRunner,
};
use ax_store::QueuedMessage;

/// Runner that answers a message with one model call through the provider
/// router, using the assembled system prompt.
struct DirectLlmRunner {
    supervisor: Arc<Supervisor>,
    client: Arc<dyn ProviderClient>,
}

#[async_trait]
impl WorkerRunner for DirectLlmRunner {
    async fn run(&self, message: &QueuedMessage) -> ax_router::Result<String> {
        let config = &self.supervisor.config;
        let snapshot = self.supervisor.taint.snapshot(&message.session_id);
        let identity = load_identity(&self.supervisor.dirs.identity_dir);

        let ctx = PromptContext {
            agent_type: config.agent.as_str().to_string(),
            sandbox_type: "direct".to_string(),
            profile: config.profile,
            workspace_path: self.supervisor.dirs.workspaces_dir.display().to_string(),
            skills: Vec::new(),
            identity,
            taint_ratio: snapshot.ratio,
            taint_threshold: config.profile.taint_threshold(),
            context_window: 200_000,
            history_tokens: 0,
            reply_optional: false,
        };
        let system_prompt = PromptAssembler::standard().assemble(&ctx);

        let mut history = self
            .supervisor
            .sessions
            .history(&message.session_id, 40)
            .await
            .map_err(RouterError::Store)?;
        // The inbound pipeline already recorded the current user turn; the
        // queued content (wrapped, canary-marked) stands in for it here.
        if history.last().map(|t| t.role == ax_store::TurnRole::User).unwrap_or(false) {
            history.pop();
        }

        let mut messages = vec![json!({"role": "system", "content": system_prompt})];
        for turn in &history {
            messages.push(json!({
                "role": turn.role.as_str(),
                "content": turn.content,
            }));
        }
        messages.push(json!({"role": "user", "content": message.content}));

        let handler = LlmHandler::new(
            format!("{}/default", config.providers.llm),
            config.providers.llm_fallbacks.clone(),
            config.default_max_tokens(),
            Arc::clone(&self.client),
        );

        let params = serde_json::from_value(json!({
            "messages": messages,
        }))
        .map_err(|e| RouterError::Internal(e.to_string()))?;

        let result = handler
            .call(params)
            .await
            .map_err(|e| RouterError::Worker(e.to_string()))?;

        let mut text = String::new();
        if let Some(chunks) = result["chunks"].as_array() {
            for chunk in chunks {
                if chunk["type"] == "text" {
                    text.push_str(chunk["text"].as_str().unwrap_or_default());
                }
            }
        }
        Ok(text)
    }
}

fn dispatcher_for(supervisor: &Arc<Supervisor>) -> Dispatcher {
    let runner: Arc<dyn WorkerRunner> = Arc::new(DirectLlmRunner {
        supervisor: Arc::clone(supervisor),
        client: Arc::new(HttpProviderClient::new(
            Arc::clone(&supervisor.credentials),
            None,
        )),
    });
    Dispatcher::new(
        supervisor.queue.clone(),
        Arc::clone(&supervisor.router),
        runner,
    )
}

async fn exchange(
    supervisor: &Arc<Supervisor>,
    dispatcher: &Dispatcher,
    content: &str,
) -> anyhow::Result<Option<String>> {
    let address = SessionAddress::dm("cli", "local");
    let inbound = supervisor
        .router
        .handle_inbound(
            &address,
            InboundMessage {
                channel: "cli".to_string(),
                sender: "local".to_string(),
                content: content.to_string(),
            },
        )
        .await?;

    if !inbound.queued {
        return Ok(inbound.notice.map(str::to_string));
    }

    let outcome = dispatcher.tick().await?;
    Ok(outcome.and_then(|o| o.response))
}

/// `ax send`: one message through the pipeline.
pub async fn run_once(config: Config, dirs: DataDirs, message: &str) -> anyhow::Result<String> {
    let supervisor = Arc::new(Supervisor::start(config, dirs).await?);
    let dispatcher = dispatcher_for(&supervisor);
    let response = exchange(&supervisor, &dispatcher, message).await?;
    Ok(response.unwrap_or_else(|| "(no response)".to_string()))
}

/// `ax chat`: a line-oriented conversation loop.
pub async fn run_chat(config: Config, dirs: DataDirs) -> anyhow::Result<()> {
    let supervisor = Arc::new(Supervisor::start(config, dirs).await?);
    let dispatcher = dispatcher_for(&supervisor);

    println!("ax chat (ctrl-d to exit)");
    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            println!();
            return Ok(());
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match exchange(&supervisor, &dispatcher, line).await? {
            Some(response) => println!("{response}"),
            None => println!("(no response)"),
        }
    }
}
