//! LLM call handler and the provider fallback router.
//!
//! A call names a primary `provider/model` candidate plus an ordered
//! fallback list from configuration. Candidates in cooldown are skipped;
//! retryable failures (rate limit, 5xx, timeout, unknown) put a candidate
//! on an exponential backoff starting at 30 s and capped at 5 min;
//! permanent failures (auth, malformed, not-found) skip the candidate
//! without cooling it; success clears its cooldown. Exhausting every
//! candidate surfaces the last concrete error.
//!
//! Model calls legitimately run for minutes, so this handler gets its own
//! long timeout instead of the default IPC one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use ax_store::Credentials;

use crate::schema::{LlmCallParams, LlmMessage, LlmRole};
use crate::{IpcError, Result};

/// Default upstream call timeout. Overridable through `AX_LLM_TIMEOUT_SECS`,
/// clamped to one hour.
pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 600;
const MAX_LLM_TIMEOUT_SECS: u64 = 3600;

/// Environment variable overriding the LLM call timeout.
pub const ENV_LLM_TIMEOUT: &str = "AX_LLM_TIMEOUT_SECS";

const BACKOFF_BASE: Duration = Duration::from_secs(30);
const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Resolve the configured LLM timeout.
pub fn llm_timeout() -> Duration {
    let secs = std::env::var(ENV_LLM_TIMEOUT)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(DEFAULT_LLM_TIMEOUT_SECS)
        .clamp(1, MAX_LLM_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// A normalized request handed to a provider client.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub messages: Vec<LlmMessage>,
    pub max_tokens: u32,
}

/// One element of the batched chunk stream returned to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LlmChunk {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    Done {
        input_tokens: u64,
        output_tokens: u64,
    },
}

/// How a provider attempt failed, which decides cooldown behavior.
#[derive(Debug, Clone)]
pub enum ProviderError {
    /// Rate limit, 5xx, timeout, or anything unclassifiable.
    Retryable(String),
    /// Auth, malformed request, unknown model. Retrying cannot help.
    Permanent(String),
}

impl ProviderError {
    fn message(&self) -> &str {
        match self {
            ProviderError::Retryable(m) | ProviderError::Permanent(m) => m,
        }
    }
}

/// Abstraction over the upstream call, so the router is testable without a
/// network and swappable per provider kind.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn call(
        &self,
        provider_model: &str,
        request: &LlmRequest,
    ) -> std::result::Result<Vec<LlmChunk>, ProviderError>;
}

#[derive(Debug, Clone, Copy)]
struct CooldownEntry {
    until: Instant,
    consecutive_failures: u32,
}

/// Per-provider cooldown slots. Lock hold times are a map lookup.
#[derive(Default)]
pub struct CooldownMap {
    slots: Mutex<HashMap<String, CooldownEntry>>,
}

impl CooldownMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn in_cooldown_at(&self, candidate: &str, now: Instant) -> bool {
        self.slots
            .lock()
            .get(candidate)
            .map(|entry| entry.until > now)
            .unwrap_or(false)
    }

    pub fn in_cooldown(&self, candidate: &str) -> bool {
        self.in_cooldown_at(candidate, Instant::now())
    }

    /// Record a retryable failure; returns the backoff applied.
    fn record_failure_at(&self, candidate: &str, now: Instant) -> Duration {
        let mut slots = self.slots.lock();
        let failures = slots
            .get(candidate)
            .map(|entry| entry.consecutive_failures)
            .unwrap_or(0)
            + 1;
        let backoff = backoff_for(failures);
        slots.insert(
            candidate.to_string(),
            CooldownEntry {
                until: now + backoff,
                consecutive_failures: failures,
            },
        );
        backoff
    }

    pub fn record_failure(&self, candidate: &str) -> Duration {
        self.record_failure_at(candidate, Instant::now())
    }

    pub fn clear(&self, candidate: &str) {
        self.slots.lock().remove(candidate);
    }
}

/// 30 s, 60 s, 120 s, 240 s, then capped at 300 s.
fn backoff_for(consecutive_failures: u32) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(16);
    let backoff = BACKOFF_BASE.saturating_mul(1u32 << exponent);
    backoff.min(BACKOFF_CAP)
}

/// The `llm_call` handler: candidate routing around a provider client.
pub struct LlmHandler {
    primary: String,
    fallbacks: Vec<String>,
    default_max_tokens: u32,
    cooldowns: CooldownMap,
    client: Arc<dyn ProviderClient>,
}

impl LlmHandler {
    pub fn new(
        primary: String,
        fallbacks: Vec<String>,
        default_max_tokens: u32,
        client: Arc<dyn ProviderClient>,
    ) -> Self {
        Self {
            primary,
            fallbacks,
            default_max_tokens,
            cooldowns: CooldownMap::new(),
            client,
        }
    }

    /// Handle a validated `llm_call`, returning the chunk batch.
    pub async fn call(&self, params: LlmCallParams) -> Result<Value> {
        let request = LlmRequest {
            messages: params.messages,
            // Config value is the default; the worker may override per call
            // within schema bounds.
            max_tokens: params.max_tokens.unwrap_or(self.default_max_tokens),
        };

        // A per-call model override replaces the primary candidate only;
        // the configured fallback chain stays intact.
        let primary = params.model.unwrap_or_else(|| self.primary.clone());
        let chunks = self.route(&primary, &request).await?;
        Ok(json!({ "chunks": chunks }))
    }

    async fn route(&self, primary: &str, request: &LlmRequest) -> Result<Vec<LlmChunk>> {
        let mut last_error: Option<String> = None;

        for candidate in std::iter::once(primary).chain(self.fallbacks.iter().map(|s| s.as_str()))
        {
            if self.cooldowns.in_cooldown(candidate) {
                debug!(candidate, "skipping candidate in cooldown");
                continue;
            }

            match self.client.call(candidate, request).await {
                Ok(chunks) => {
                    self.cooldowns.clear(candidate);
                    return Ok(chunks);
                }
                Err(ProviderError::Retryable(message)) => {
                    let backoff = self.cooldowns.record_failure(candidate);
                    warn!(candidate, backoff_secs = backoff.as_secs(), %message,
                        "provider failed, cooling down");
                    last_error = Some(message);
                }
                Err(ProviderError::Permanent(message)) => {
                    warn!(candidate, %message, "provider failed permanently, skipping");
                    last_error = Some(message);
                }
            }
        }

        Err(IpcError::Upstream(last_error.unwrap_or_else(|| {
            "no provider candidate was available".to_string()
        })))
    }
}

// ============================================================================
// HTTP provider client
// ============================================================================

/// Messages-protocol client for `anthropic/<model>` candidates.
pub struct HttpProviderClient {
    client: reqwest::Client,
    credentials: Arc<Credentials>,
    base_url: String,
}

impl HttpProviderClient {
    pub fn new(credentials: Arc<Credentials>, base_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(llm_timeout())
                .build()
                .unwrap_or_default(),
            credentials,
            base_url: base_url.unwrap_or_else(|| "https://api.anthropic.com".to_string()),
        }
    }

    fn payload(model: &str, request: &LlmRequest) -> Value {
        let mut system_parts = Vec::new();
        let mut messages = Vec::new();
        for message in &request.messages {
            match message.role {
                LlmRole::System => system_parts.push(message.content.clone()),
                LlmRole::User => messages.push(json!({
                    "role": "user",
                    "content": message.content,
                })),
                LlmRole::Assistant => messages.push(json!({
                    "role": "assistant",
                    "content": message.content,
                })),
            }
        }

        let mut payload = json!({
            "model": model,
            "max_tokens": request.max_tokens,
            "messages": messages,
        });
        if !system_parts.is_empty() {
            payload["system"] = json!(system_parts.join("\n\n"));
        }
        payload
    }

    fn chunks_from_response(payload: &Value) -> Vec<LlmChunk> {
        let mut chunks = Vec::new();
        if let Some(blocks) = payload["content"].as_array() {
            for block in blocks {
                match block["type"].as_str() {
                    Some("text") => chunks.push(LlmChunk::Text {
                        text: block["text"].as_str().unwrap_or_default().to_string(),
                    }),
                    Some("tool_use") => chunks.push(LlmChunk::ToolUse {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        input: block["input"].clone(),
                    }),
                    _ => {}
                }
            }
        }
        chunks.push(LlmChunk::Done {
            input_tokens: payload["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: payload["usage"]["output_tokens"].as_u64().unwrap_or(0),
        });
        chunks
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn call(
        &self,
        provider_model: &str,
        request: &LlmRequest,
    ) -> std::result::Result<Vec<LlmChunk>, ProviderError> {
        let model = match provider_model.split_once('/') {
            Some(("anthropic", model)) if !model.is_empty() => model,
            Some((provider, _)) => {
                return Err(ProviderError::Permanent(format!(
                    "unknown provider '{provider}'"
                )));
            }
            // Bare names default to the messages provider.
            None => provider_model,
        };

        let mut builder = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("anthropic-version", "2023-06-01")
            .json(&Self::payload(model, request));

        builder = match self.credentials.mode() {
            Some(ax_store::CredentialMode::ApiKey(key)) => builder.header("x-api-key", key),
            Some(ax_store::CredentialMode::Bearer(token)) => {
                builder.header("authorization", format!("Bearer {token}"))
            }
            None => {
                return Err(ProviderError::Permanent(
                    "no upstream credential configured".to_string(),
                ));
            }
        };

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Retryable(format!("timeout: {e}"))
            } else {
                ProviderError::Retryable(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        if status == 429 || status >= 500 {
            return Err(ProviderError::Retryable(format!(
                "{provider_model} returned {status}"
            )));
        }
        if status >= 400 {
            return Err(ProviderError::Permanent(format!(
                "{provider_model} returned {status}"
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Retryable(format!("malformed response: {e}")))?;
        Ok(Self::chunks_from_response(&payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    /// Scripted client: each call pops the next outcome for the candidate.
    struct ScriptedClient {
        script: SyncMutex<Vec<(String, std::result::Result<Vec<LlmChunk>, ProviderError>)>>,
        calls: SyncMutex<Vec<String>>,
    }

    impl ScriptedClient {
        fn new(
            script: Vec<(&str, std::result::Result<Vec<LlmChunk>, ProviderError>)>,
        ) -> Arc<Self> {
            Arc::new(Self {
                script: SyncMutex::new(
                    script
                        .into_iter()
                        .map(|(name, outcome)| (name.to_string(), outcome))
                        .collect(),
                ),
                calls: SyncMutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl ProviderClient for ScriptedClient {
        async fn call(
            &self,
            provider_model: &str,
            _request: &LlmRequest,
        ) -> std::result::Result<Vec<LlmChunk>, ProviderError> {
            self.calls.lock().push(provider_model.to_string());
            let mut script = self.script.lock();
            let index = script
                .iter()
                .position(|(name, _)| name == provider_model)
                .expect("unscripted candidate called");
            script.remove(index).1
        }
    }

    fn done() -> Vec<LlmChunk> {
        vec![LlmChunk::Done {
            input_tokens: 1,
            output_tokens: 1,
        }]
    }

    fn params() -> LlmCallParams {
        serde_json::from_value(serde_json::json!({
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .unwrap()
    }

    fn handler(client: Arc<ScriptedClient>, fallbacks: &[&str]) -> LlmHandler {
        LlmHandler::new(
            "anthropic/primary".to_string(),
            fallbacks.iter().map(|s| s.to_string()).collect(),
            4096,
            client,
        )
    }

    #[tokio::test]
    async fn primary_success_returns_chunks() {
        let client = ScriptedClient::new(vec![("anthropic/primary", Ok(done()))]);
        let h = handler(Arc::clone(&client), &["anthropic/backup"]);

        let result = h.call(params()).await.unwrap();
        assert_eq!(result["chunks"][0]["type"], "done");
        assert_eq!(client.calls(), vec!["anthropic/primary"]);
    }

    #[tokio::test]
    async fn retryable_failure_falls_back_and_cools_primary() {
        let client = ScriptedClient::new(vec![
            (
                "anthropic/primary",
                Err(ProviderError::Retryable("429".to_string())),
            ),
            ("anthropic/backup", Ok(done())),
        ]);
        let h = handler(Arc::clone(&client), &["anthropic/backup"]);

        h.call(params()).await.unwrap();
        assert_eq!(client.calls(), vec!["anthropic/primary", "anthropic/backup"]);
        assert!(h.cooldowns.in_cooldown("anthropic/primary"));
        assert!(!h.cooldowns.in_cooldown("anthropic/backup"));
    }

    #[tokio::test]
    async fn cooled_candidate_is_skipped() {
        let client = ScriptedClient::new(vec![("anthropic/backup", Ok(done()))]);
        let h = handler(Arc::clone(&client), &["anthropic/backup"]);

        h.cooldowns.record_failure("anthropic/primary");
        h.call(params()).await.unwrap();
        assert_eq!(client.calls(), vec!["anthropic/backup"]);
    }

    #[tokio::test]
    async fn permanent_failure_skips_without_cooldown() {
        let client = ScriptedClient::new(vec![
            (
                "anthropic/primary",
                Err(ProviderError::Permanent("401".to_string())),
            ),
            ("anthropic/backup", Ok(done())),
        ]);
        let h = handler(Arc::clone(&client), &["anthropic/backup"]);

        h.call(params()).await.unwrap();
        assert!(
            !h.cooldowns.in_cooldown("anthropic/primary"),
            "permanent failures must not cool the candidate"
        );
    }

    #[tokio::test]
    async fn exhaustion_surfaces_last_error() {
        let client = ScriptedClient::new(vec![
            (
                "anthropic/primary",
                Err(ProviderError::Retryable("first".to_string())),
            ),
            (
                "anthropic/backup",
                Err(ProviderError::Permanent("last concrete error".to_string())),
            ),
        ]);
        let h = handler(client, &["anthropic/backup"]);

        let err = h.call(params()).await.unwrap_err();
        assert!(err.to_string().contains("last concrete error"));
    }

    #[tokio::test]
    async fn success_clears_cooldown() {
        let client = ScriptedClient::new(vec![("anthropic/primary", Ok(done()))]);
        let h = handler(client, &[]);

        // Simulate an expired cooldown from an earlier failure.
        h.cooldowns.slots.lock().insert(
            "anthropic/primary".to_string(),
            CooldownEntry {
                until: Instant::now() - Duration::from_secs(1),
                consecutive_failures: 3,
            },
        );

        h.call(params()).await.unwrap();
        assert!(h.cooldowns.slots.lock().get("anthropic/primary").is_none());
    }

    #[tokio::test]
    async fn per_call_model_override_replaces_primary_only() {
        let client = ScriptedClient::new(vec![("anthropic/override", Ok(done()))]);
        let h = handler(Arc::clone(&client), &["anthropic/backup"]);

        let mut p = params();
        p.model = Some("anthropic/override".to_string());
        h.call(p).await.unwrap();
        assert_eq!(client.calls(), vec!["anthropic/override"]);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_for(1), Duration::from_secs(30));
        assert_eq!(backoff_for(2), Duration::from_secs(60));
        assert_eq!(backoff_for(3), Duration::from_secs(120));
        assert_eq!(backoff_for(4), Duration::from_secs(240));
        assert_eq!(backoff_for(5), Duration::from_secs(300));
        assert_eq!(backoff_for(12), Duration::from_secs(300));
    }

    #[test]
    fn cooldown_expires() {
        let map = CooldownMap::new();
        let now = Instant::now();
        map.record_failure_at("p", now);

        assert!(map.in_cooldown_at("p", now + Duration::from_secs(29)));
        assert!(!map.in_cooldown_at("p", now + Duration::from_secs(31)));
    }

    #[test]
    fn repeated_failures_extend_backoff() {
        let map = CooldownMap::new();
        let now = Instant::now();
        assert_eq!(map.record_failure_at("p", now), Duration::from_secs(30));
        assert_eq!(map.record_failure_at("p", now), Duration::from_secs(60));
        assert_eq!(map.record_failure_at("p", now), Duration::from_secs(120));
    }

    #[test]
    fn payload_lifts_system_messages() {
        let request = LlmRequest {
            messages: vec![
                LlmMessage {
                    role: LlmRole::System,
                    content: "be brief".to_string(),
                },
                LlmMessage {
                    role: LlmRole::User,
                    content: "hi".to_string(),
                },
            ],
            max_tokens: 100,
        };
        let payload = HttpProviderClient::payload("m", &request);
        assert_eq!(payload["system"], "be brief");
        assert_eq!(payload["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn response_blocks_become_chunks() {
        let payload = serde_json::json!({
            "content": [
                {"type": "text", "text": "hello"},
                {"type": "tool_use", "id": "t1", "name": "web_fetch", "input": {"url": "u"}},
            ],
            "usage": {"input_tokens": 10, "output_tokens": 4},
        });
        let chunks = HttpProviderClient::chunks_from_response(&payload);
        assert_eq!(chunks.len(), 3);
        assert_eq!(
            chunks[2],
            LlmChunk::Done {
                input_tokens: 10,
                output_tokens: 4
            }
        );
    }
}
