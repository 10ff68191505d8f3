//! The IPC server: accept loop, per-connection tasks, and the
//! validate-gate-dispatch-audit lifecycle.
//!
//! A connection introduces itself with one `hello` frame carrying its
//! session and agent ids, then issues any number of action frames. The
//! server never blocks one connection on another's handler: each
//! connection runs in its own task and every shared resource behind the
//! handlers is internally synchronized.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use ax_store::{AuditEntry, AuditLog, AuditResult};
use ax_taint::TaintEngine;

use crate::context::ConnContext;
use crate::frame::{write_json, FrameDecoder};
use crate::handlers::HandlerRegistry;
use crate::schema::{Action, ActionRequest};
use crate::{IpcError, Result};

/// First frame on every connection.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Hello {
    hello: HelloBody,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HelloBody {
    session_id: String,
    agent_id: String,
}

/// The IPC server. One instance per supervisor.
pub struct IpcServer {
    registry: HandlerRegistry,
    taint: Arc<TaintEngine>,
    audit: Arc<AuditLog>,
}

impl IpcServer {
    pub fn new(registry: HandlerRegistry, taint: Arc<TaintEngine>, audit: Arc<AuditLog>) -> Self {
        Self {
            registry,
            taint,
            audit,
        }
    }

    /// Bind the socket and accept connections forever.
    pub async fn serve(self: Arc<Self>, socket_path: impl AsRef<std::path::Path>) -> Result<()> {
        let path = socket_path.as_ref();
        if path.exists() {
            tokio::fs::remove_file(path).await?;
        }
        let listener = UnixListener::bind(path)?;
        info!(path = %path.display(), "ipc server listening");

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle_connection(stream).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                }
            }
        }
    }

    /// Run one connection to completion.
    pub async fn handle_connection(&self, stream: UnixStream) {
        let (mut reader, mut writer) = stream.into_split();
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 16 * 1024];
        let mut ctx: Option<ConnContext> = None;

        loop {
            let frame = loop {
                match decoder.next_frame() {
                    Ok(Some(frame)) => break Some(frame),
                    Ok(None) => {}
                    Err(e) => {
                        // Oversized announcement: the stream is no longer
                        // frame-aligned, tell the peer and hang up.
                        let _ = write_json(&mut writer, &json!({"ok": false, "error": e.to_string()}))
                            .await;
                        return;
                    }
                }

                match reader.read(&mut buf).await {
                    Ok(0) => break None,
                    Ok(n) => decoder.extend(&buf[..n]),
                    Err(e) => {
                        debug!(error = %e, "connection read failed");
                        break None;
                    }
                }
            };

            let Some(frame) = frame else {
                debug!("connection closed");
                return;
            };

            let response = match ctx.as_ref().cloned() {
                None => match serde_json::from_slice::<Hello>(&frame) {
                    Ok(hello) => {
                        ctx = Some(ConnContext::new(
                            hello.hello.session_id,
                            hello.hello.agent_id,
                        ));
                        json!({ "ok": true })
                    }
                    Err(_) => {
                        json!({ "ok": false, "error": "expected hello frame" })
                    }
                },
                Some(established) => self.process_request(&established, &frame).await,
            };

            if write_json(&mut writer, &response).await.is_err() {
                return;
            }
        }
    }

    /// The full request lifecycle for one frame. Always returns a response
    /// and always leaves an audit entry.
    pub async fn process_request(&self, ctx: &ConnContext, frame: &[u8]) -> Value {
        // Stage 1: JSON parse.
        let Ok(raw) = serde_json::from_slice::<Value>(frame) else {
            self.audit_entry(ctx, "invalid", frame, AuditResult::Error, Vec::new())
                .await;
            return json!({ "ok": false, "error": "Invalid JSON" });
        };

        // Stage 2: envelope.
        let (action_name, params) = match (
            raw.get("action").and_then(|a| a.as_str()),
            raw.as_object().map(|o| o.keys().all(|k| k == "action" || k == "params")),
        ) {
            (Some(name), Some(true)) => (
                name.to_string(),
                raw.get("params").cloned().unwrap_or(Value::Null),
            ),
            _ => {
                self.audit_entry(ctx, "invalid", frame, AuditResult::Blocked, Vec::new())
                    .await;
                return json!({ "ok": false, "error": "Unknown action" });
            }
        };

        let Some(action) = Action::from_name(&action_name) else {
            self.audit_entry(ctx, &action_name, frame, AuditResult::Blocked, Vec::new())
                .await;
            return json!({ "ok": false, "error": "Unknown action" });
        };

        // Stage 3: per-action schema.
        let request = match ActionRequest::parse(action, params) {
            Ok(request) => request,
            Err(detail) => {
                self.audit_entry(ctx, action.as_str(), frame, AuditResult::Blocked, Vec::new())
                    .await;
                return json!({ "ok": false, "error": format!("Validation failed: {detail}") });
            }
        };

        // Stage 4: taint gate.
        let decision = self.taint.check(&ctx.session_id, action.as_str());
        if let Some(reason) = decision.reason() {
            warn!(session = %ctx.session_id, action = action.as_str(), "taint gate denied action");
            self.audit_entry(
                ctx,
                action.as_str(),
                frame,
                AuditResult::Blocked,
                vec!["taint_threshold".to_string()],
            )
            .await;
            return json!({ "ok": false, "error": reason });
        }

        // Stage 5: handler.
        let (response, result) = match self.registry.dispatch(ctx, request).await {
            Ok(value) => {
                let mut response = json!({ "ok": true });
                if let (Some(out), Some(extra)) = (response.as_object_mut(), value.as_object()) {
                    for (key, item) in extra {
                        out.insert(key.clone(), item.clone());
                    }
                }
                (response, AuditResult::Success)
            }
            Err(e) => {
                let result = match &e {
                    IpcError::Policy(_) => AuditResult::Blocked,
                    _ => AuditResult::Error,
                };
                let message = match &e {
                    // Internal detail stays in the log.
                    IpcError::Internal(detail) => {
                        error!(action = action.as_str(), %detail, "handler internal error");
                        "internal error".to_string()
                    }
                    other => other.to_string(),
                };
                (json!({ "ok": false, "error": message }), result)
            }
        };

        // Stage 6: audit, every action, regardless of outcome.
        self.audit_entry(ctx, action.as_str(), frame, result, Vec::new())
            .await;
        response
    }

    async fn audit_entry(
        &self,
        ctx: &ConnContext,
        action: &str,
        frame: &[u8],
        result: AuditResult,
        patterns: Vec<String>,
    ) {
        let args = serde_json::from_slice::<Value>(frame)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(frame).into_owned()));
        let entry = AuditEntry::new(action, &ctx.session_id, &ctx.agent_id, &args, result)
            .with_patterns(patterns);
        if let Err(e) = self.audit.append(&entry).await {
            error!(error = %e, "audit append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{read_frame, write_json as send_json};
    use crate::handlers::{
        HandlerDeps, NullBrowserDriver, NullDelegateSpawner, ProviderClient, ProviderError,
    };
    use async_trait::async_trait;
    use ax_store::{AuditFilter, Database};
    use ax_taint::{SecurityProfile, TrustLevel};
    use tempfile::TempDir;

    struct NoProvider;

    #[async_trait]
    impl ProviderClient for NoProvider {
        async fn call(
            &self,
            _provider_model: &str,
            _request: &crate::handlers::llm::LlmRequest,
        ) -> std::result::Result<Vec<crate::handlers::LlmChunk>, ProviderError> {
            Err(ProviderError::Permanent("no provider in tests".to_string()))
        }
    }

    async fn server(profile: SecurityProfile) -> (Arc<IpcServer>, Arc<AuditLog>, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = Database::open_in_memory().await.unwrap();
        let audit = Arc::new(AuditLog::new(dir.path().join("audit.jsonl")));
        let taint = Arc::new(TaintEngine::new(profile));

        let registry = HandlerRegistry::new(HandlerDeps {
            db,
            audit_log: Arc::clone(&audit),
            taint: Arc::clone(&taint),
            skills_root: dir.path().join("skills"),
            identity_root: dir.path().to_path_buf(),
            browser_driver: Arc::new(NullBrowserDriver),
            browser_allowlist: Vec::new(),
            delegate_spawner: Arc::new(NullDelegateSpawner),
            max_delegation_depth: 2,
            max_concurrent_delegations: 4,
            llm_primary: "anthropic/main".to_string(),
            llm_fallbacks: Vec::new(),
            llm_default_max_tokens: 4096,
            llm_client: Arc::new(NoProvider),
            search_api_key: None,
        });

        (
            Arc::new(IpcServer::new(registry, taint, Arc::clone(&audit))),
            audit,
            dir,
        )
    }

    fn ctx() -> ConnContext {
        ConnContext::new("sess-1", "main")
    }

    #[tokio::test]
    async fn invalid_json_is_rejected_and_audited() {
        let (server, audit, _dir) = server(SecurityProfile::Balanced).await;
        let response = server.process_request(&ctx(), b"{not json").await;
        assert_eq!(response["ok"], false);
        assert_eq!(response["error"], "Invalid JSON");

        let entries = audit.query(&AuditFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].result, AuditResult::Error);
    }

    #[tokio::test]
    async fn unknown_action_never_reaches_a_handler() {
        let (server, audit, _dir) = server(SecurityProfile::Balanced).await;
        let response = server
            .process_request(&ctx(), br#"{"action": "shell_exec", "params": {}}"#)
            .await;
        assert_eq!(response["error"], "Unknown action");

        let entries = audit.query(&AuditFilter::default()).await.unwrap();
        assert_eq!(entries[0].result, AuditResult::Blocked);
        assert_eq!(entries[0].action, "shell_exec");
    }

    #[tokio::test]
    async fn envelope_with_extra_fields_is_rejected() {
        let (server, _audit, _dir) = server(SecurityProfile::Balanced).await;
        let response = server
            .process_request(
                &ctx(),
                br#"{"action": "memory_list", "params": {}, "extra": 1}"#,
            )
            .await;
        assert_eq!(response["error"], "Unknown action");
    }

    #[tokio::test]
    async fn validation_failure_carries_detail() {
        let (server, _audit, _dir) = server(SecurityProfile::Balanced).await;
        let response = server
            .process_request(&ctx(), br#"{"action": "memory_read", "params": {}}"#)
            .await;
        assert_eq!(response["ok"], false);
        let error = response["error"].as_str().unwrap();
        assert!(error.starts_with("Validation failed:"), "{error}");
    }

    #[tokio::test]
    async fn memory_round_trip_through_lifecycle() {
        let (server, audit, _dir) = server(SecurityProfile::Balanced).await;
        let write = server
            .process_request(
                &ctx(),
                br#"{"action": "memory_write", "params": {"key": "k", "content": "v"}}"#,
            )
            .await;
        assert_eq!(write["ok"], true);

        let read = server
            .process_request(&ctx(), br#"{"action": "memory_read", "params": {"key": "k"}}"#)
            .await;
        assert_eq!(read["ok"], true);
        assert_eq!(read["entry"]["content"], "v");

        let entries = audit.query(&AuditFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.result == AuditResult::Success));
    }

    #[tokio::test]
    async fn taint_gate_blocks_sensitive_action() {
        let (server, audit, _dir) = server(SecurityProfile::Paranoid).await;
        server
            .taint
            .record_tokens("sess-1", 100, TrustLevel::External);

        let response = server
            .process_request(
                &ctx(),
                br#"{"action": "scheduler_add", "params": {"prompt": "p", "interval_min": 5}}"#,
            )
            .await;
        assert_eq!(response["ok"], false);
        assert!(response["error"]
            .as_str()
            .unwrap()
            .starts_with("Blocked by taint policy"));

        let entries = audit
            .query(&AuditFilter {
                result: Some(AuditResult::Blocked),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].patterns, vec!["taint_threshold"]);
    }

    #[tokio::test]
    async fn taint_gate_ignores_non_sensitive_actions() {
        let (server, _audit, _dir) = server(SecurityProfile::Paranoid).await;
        server
            .taint
            .record_tokens("sess-1", 100, TrustLevel::External);

        let response = server
            .process_request(&ctx(), br#"{"action": "memory_list"}"#)
            .await;
        assert_eq!(response["ok"], true);
    }

    #[tokio::test]
    async fn handler_failure_keeps_connection_usable() {
        let (server, _audit, _dir) = server(SecurityProfile::Balanced).await;
        // LLM provider always fails in tests.
        let response = server
            .process_request(
                &ctx(),
                br#"{"action": "llm_call", "params": {"messages": [{"role": "user", "content": "hi"}]}}"#,
            )
            .await;
        assert_eq!(response["ok"], false);

        // The same context keeps working afterwards.
        let next = server
            .process_request(&ctx(), br#"{"action": "memory_list"}"#)
            .await;
        assert_eq!(next["ok"], true);
    }

    #[tokio::test]
    async fn connection_handshake_and_request_over_socket() {
        let (server, _audit, _dir) = server(SecurityProfile::Balanced).await;
        let (client, served) = UnixStream::pair().unwrap();

        let server_task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.handle_connection(served).await })
        };

        let (mut read_half, mut write_half) = client.into_split();

        send_json(
            &mut write_half,
            &json!({"hello": {"session_id": "s", "agent_id": "main"}}),
        )
        .await
        .unwrap();
        let hello_ack: Value =
            serde_json::from_slice(&read_frame(&mut read_half).await.unwrap().unwrap()).unwrap();
        assert_eq!(hello_ack["ok"], true);

        send_json(&mut write_half, &json!({"action": "memory_list"})).await.unwrap();
        let response: Value =
            serde_json::from_slice(&read_frame(&mut read_half).await.unwrap().unwrap()).unwrap();
        assert_eq!(response["ok"], true);
        assert!(response["keys"].as_array().unwrap().is_empty());

        drop(write_half);
        drop(read_half);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn first_frame_must_be_hello() {
        let (server, _audit, _dir) = server(SecurityProfile::Balanced).await;
        let (client, served) = UnixStream::pair().unwrap();

        let server_task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.handle_connection(served).await })
        };

        let (mut read_half, mut write_half) = client.into_split();
        send_json(&mut write_half, &json!({"action": "memory_list"})).await.unwrap();
        let response: Value =
            serde_json::from_slice(&read_frame(&mut read_half).await.unwrap().unwrap()).unwrap();
        assert_eq!(response["ok"], false);
        assert_eq!(response["error"], "expected hello frame");

        drop(write_half);
        drop(read_half);
        server_task.await.unwrap();
    }
}
