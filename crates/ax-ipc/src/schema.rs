//! The closed IPC action surface.
//!
//! Every action the worker may request is named here, and each one owns a
//! typed parameter struct. Deserialization is strict (`deny_unknown_fields`
//! everywhere), string and collection bounds are checked explicitly, and no
//! string anywhere in a request may contain a NUL byte. There is no
//! free-form "extra" field on any action; the only way the surface grows is
//! a new variant with a new schema.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use ax_store::AuditResult;

/// Upper bound for message/content payloads carried in a single action.
const MAX_CONTENT: usize = 256 * 1024;
/// Upper bound for short identifier-like strings.
const MAX_NAME: usize = 128;

/// The closed set of IPC actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    LlmCall,
    MemoryWrite,
    MemoryRead,
    MemoryQuery,
    MemoryDelete,
    MemoryList,
    WebFetch,
    WebSearch,
    BrowserLaunch,
    BrowserNavigate,
    BrowserSnapshot,
    BrowserClick,
    BrowserType,
    BrowserScreenshot,
    BrowserClose,
    SkillRead,
    SkillList,
    SkillPropose,
    AuditQuery,
    AgentDelegate,
    IdentityWrite,
    UserWrite,
    SchedulerAdd,
    SchedulerRemove,
    SchedulerList,
    SchedulerRunAt,
}

impl Action {
    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::LlmCall => "llm_call",
            Action::MemoryWrite => "memory_write",
            Action::MemoryRead => "memory_read",
            Action::MemoryQuery => "memory_query",
            Action::MemoryDelete => "memory_delete",
            Action::MemoryList => "memory_list",
            Action::WebFetch => "web_fetch",
            Action::WebSearch => "web_search",
            Action::BrowserLaunch => "browser_launch",
            Action::BrowserNavigate => "browser_navigate",
            Action::BrowserSnapshot => "browser_snapshot",
            Action::BrowserClick => "browser_click",
            Action::BrowserType => "browser_type",
            Action::BrowserScreenshot => "browser_screenshot",
            Action::BrowserClose => "browser_close",
            Action::SkillRead => "skill_read",
            Action::SkillList => "skill_list",
            Action::SkillPropose => "skill_propose",
            Action::AuditQuery => "audit_query",
            Action::AgentDelegate => "agent_delegate",
            Action::IdentityWrite => "identity_write",
            Action::UserWrite => "user_write",
            Action::SchedulerAdd => "scheduler_add",
            Action::SchedulerRemove => "scheduler_remove",
            Action::SchedulerList => "scheduler_list",
            Action::SchedulerRunAt => "scheduler_run_at",
        }
    }

    /// Resolve a wire name; `None` for anything outside the allowlist.
    pub fn from_name(name: &str) -> Option<Self> {
        ALL_ACTIONS.iter().copied().find(|a| a.as_str() == name)
    }
}

/// Every action, for allowlist iteration.
pub const ALL_ACTIONS: &[Action] = &[
    Action::LlmCall,
    Action::MemoryWrite,
    Action::MemoryRead,
    Action::MemoryQuery,
    Action::MemoryDelete,
    Action::MemoryList,
    Action::WebFetch,
    Action::WebSearch,
    Action::BrowserLaunch,
    Action::BrowserNavigate,
    Action::BrowserSnapshot,
    Action::BrowserClick,
    Action::BrowserType,
    Action::BrowserScreenshot,
    Action::BrowserClose,
    Action::SkillRead,
    Action::SkillList,
    Action::SkillPropose,
    Action::AuditQuery,
    Action::AgentDelegate,
    Action::IdentityWrite,
    Action::UserWrite,
    Action::SchedulerAdd,
    Action::SchedulerRemove,
    Action::SchedulerList,
    Action::SchedulerRunAt,
];

/// Wire envelope: `action` must resolve before `params` is even looked at.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope {
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

// ============================================================================
// Per-action parameter schemas
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmMessage {
    pub role: LlmRole,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmCallParams {
    pub messages: Vec<LlmMessage>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryWriteParams {
    pub key: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tainted: bool,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryKeyParams {
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryQueryParams {
    pub text: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmptyParams {}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebFetchParams {
    pub url: String,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WebSearchParams {
    pub query: String,
    pub count: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrowserNavigateParams {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrowserRefParams {
    pub element_ref: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BrowserTypeParams {
    pub element_ref: String,
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkillNameParams {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkillProposeParams {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditQueryParams {
    pub action: Option<String>,
    pub session_id: Option<String>,
    pub result: Option<AuditResult>,
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentDelegateParams {
    pub task: String,
    pub agent_type: Option<String>,
}

/// Identity files evolvable through audited writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentityFile {
    Bootstrap,
    Soul,
    Identity,
    Agents,
    Heartbeat,
}

impl IdentityFile {
    pub fn file_name(&self) -> &'static str {
        match self {
            IdentityFile::Bootstrap => "bootstrap.md",
            IdentityFile::Soul => "soul.md",
            IdentityFile::Identity => "identity.md",
            IdentityFile::Agents => "agents.md",
            IdentityFile::Heartbeat => "heartbeat.md",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentityWriteParams {
    pub file: IdentityFile,
    pub content: String,
}

/// User-owned files, writable through `user_write` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UserFile {
    User,
    UserBootstrap,
}

impl UserFile {
    pub fn file_name(&self) -> &'static str {
        match self {
            UserFile::User => "user.md",
            UserFile::UserBootstrap => "user-bootstrap.md",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserWriteParams {
    pub file: UserFile,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerAddParams {
    pub prompt: String,
    pub interval_min: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerRemoveParams {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerRunAtParams {
    pub prompt: String,
    pub run_at: String,
}

// ============================================================================
// Validation
// ============================================================================

fn check_len(field: &str, value: &str, max: usize) -> Result<(), String> {
    if value.len() > max {
        return Err(format!("{field} exceeds {max} bytes"));
    }
    Ok(())
}

fn check_nonempty(field: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{field} must not be empty"));
    }
    Ok(())
}

/// Reject NUL bytes anywhere in the raw params tree, before typed parsing.
fn check_no_nul(value: &Value) -> Result<(), String> {
    match value {
        Value::String(s) if s.contains('\0') => {
            Err("strings must not contain NUL bytes".to_string())
        }
        Value::Array(items) => items.iter().try_for_each(check_no_nul),
        Value::Object(map) => {
            for (key, item) in map {
                if key.contains('\0') {
                    return Err("strings must not contain NUL bytes".to_string());
                }
                check_no_nul(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// A fully validated request: action plus typed, bounds-checked parameters.
#[derive(Debug, Clone)]
pub enum ActionRequest {
    LlmCall(LlmCallParams),
    MemoryWrite(MemoryWriteParams),
    MemoryRead(MemoryKeyParams),
    MemoryQuery(MemoryQueryParams),
    MemoryDelete(MemoryKeyParams),
    MemoryList,
    WebFetch(WebFetchParams),
    WebSearch(WebSearchParams),
    BrowserLaunch,
    BrowserNavigate(BrowserNavigateParams),
    BrowserSnapshot,
    BrowserClick(BrowserRefParams),
    BrowserType(BrowserTypeParams),
    BrowserScreenshot,
    BrowserClose,
    SkillRead(SkillNameParams),
    SkillList,
    SkillPropose(SkillProposeParams),
    AuditQuery(AuditQueryParams),
    AgentDelegate(AgentDelegateParams),
    IdentityWrite(IdentityWriteParams),
    UserWrite(UserWriteParams),
    SchedulerAdd(SchedulerAddParams),
    SchedulerRemove(SchedulerRemoveParams),
    SchedulerList,
    SchedulerRunAt(SchedulerRunAtParams),
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, String> {
    serde_json::from_value(params).map_err(|e| e.to_string())
}

/// Actions with no parameters still reject unknown fields.
fn parse_empty(params: Value) -> Result<(), String> {
    if params.is_null() {
        return Ok(());
    }
    parse::<EmptyParams>(params).map(|_| ())
}

impl ActionRequest {
    /// Validate `params` against the schema for `action`.
    ///
    /// The error string is the detail surfaced to the worker after the
    /// `Validation failed: ` prefix.
    pub fn parse(action: Action, params: Value) -> Result<Self, String> {
        check_no_nul(&params)?;

        let request = match action {
            Action::LlmCall => {
                let p: LlmCallParams = parse(params)?;
                if p.messages.is_empty() {
                    return Err("messages must not be empty".to_string());
                }
                if p.messages.len() > 200 {
                    return Err("messages exceeds 200 entries".to_string());
                }
                for m in &p.messages {
                    check_len("message content", &m.content, MAX_CONTENT)?;
                }
                if let Some(model) = &p.model {
                    check_nonempty("model", model)?;
                    check_len("model", model, MAX_NAME)?;
                }
                if let Some(max_tokens) = p.max_tokens {
                    if !(256..=200_000).contains(&max_tokens) {
                        return Err("max_tokens out of range 256..=200000".to_string());
                    }
                }
                ActionRequest::LlmCall(p)
            }
            Action::MemoryWrite => {
                let p: MemoryWriteParams = parse(params)?;
                check_nonempty("key", &p.key)?;
                check_len("key", &p.key, 256)?;
                check_len("content", &p.content, MAX_CONTENT)?;
                if p.tags.len() > 16 {
                    return Err("tags exceeds 16 entries".to_string());
                }
                for tag in &p.tags {
                    check_nonempty("tag", tag)?;
                    check_len("tag", tag, 64)?;
                }
                if let Some(source) = &p.source {
                    check_len("source", source, 256)?;
                }
                ActionRequest::MemoryWrite(p)
            }
            Action::MemoryRead => {
                let p: MemoryKeyParams = parse(params)?;
                check_nonempty("key", &p.key)?;
                check_len("key", &p.key, 256)?;
                ActionRequest::MemoryRead(p)
            }
            Action::MemoryQuery => {
                let p: MemoryQueryParams = parse(params)?;
                if let Some(text) = &p.text {
                    check_len("text", text, 1024)?;
                }
                if p.tags.len() > 16 {
                    return Err("tags exceeds 16 entries".to_string());
                }
                if let Some(limit) = p.limit {
                    if !(1..=200).contains(&limit) {
                        return Err("limit out of range 1..=200".to_string());
                    }
                }
                ActionRequest::MemoryQuery(p)
            }
            Action::MemoryDelete => {
                let p: MemoryKeyParams = parse(params)?;
                check_nonempty("key", &p.key)?;
                check_len("key", &p.key, 256)?;
                ActionRequest::MemoryDelete(p)
            }
            Action::MemoryList => {
                parse_empty(params)?;
                ActionRequest::MemoryList
            }
            Action::WebFetch => {
                let p: WebFetchParams = parse(params)?;
                check_nonempty("url", &p.url)?;
                check_len("url", &p.url, 2048)?;
                if let Some(timeout) = p.timeout_secs {
                    if !(1..=30).contains(&timeout) {
                        return Err("timeout_secs out of range 1..=30".to_string());
                    }
                }
                ActionRequest::WebFetch(p)
            }
            Action::WebSearch => {
                let p: WebSearchParams = parse(params)?;
                check_nonempty("query", &p.query)?;
                check_len("query", &p.query, 1024)?;
                if let Some(count) = p.count {
                    if !(1..=20).contains(&count) {
                        return Err("count out of range 1..=20".to_string());
                    }
                }
                ActionRequest::WebSearch(p)
            }
            Action::BrowserLaunch => {
                parse_empty(params)?;
                ActionRequest::BrowserLaunch
            }
            Action::BrowserNavigate => {
                let p: BrowserNavigateParams = parse(params)?;
                check_nonempty("url", &p.url)?;
                check_len("url", &p.url, 2048)?;
                ActionRequest::BrowserNavigate(p)
            }
            Action::BrowserSnapshot => {
                parse_empty(params)?;
                ActionRequest::BrowserSnapshot
            }
            Action::BrowserClick => {
                let p: BrowserRefParams = parse(params)?;
                check_nonempty("element_ref", &p.element_ref)?;
                check_len("element_ref", &p.element_ref, 64)?;
                ActionRequest::BrowserClick(p)
            }
            Action::BrowserType => {
                let p: BrowserTypeParams = parse(params)?;
                check_nonempty("element_ref", &p.element_ref)?;
                check_len("element_ref", &p.element_ref, 64)?;
                check_len("text", &p.text, 8192)?;
                ActionRequest::BrowserType(p)
            }
            Action::BrowserScreenshot => {
                parse_empty(params)?;
                ActionRequest::BrowserScreenshot
            }
            Action::BrowserClose => {
                parse_empty(params)?;
                ActionRequest::BrowserClose
            }
            Action::SkillRead => {
                let p: SkillNameParams = parse(params)?;
                check_nonempty("name", &p.name)?;
                check_len("name", &p.name, MAX_NAME)?;
                ActionRequest::SkillRead(p)
            }
            Action::SkillList => {
                parse_empty(params)?;
                ActionRequest::SkillList
            }
            Action::SkillPropose => {
                let p: SkillProposeParams = parse(params)?;
                check_nonempty("name", &p.name)?;
                check_len("name", &p.name, MAX_NAME)?;
                check_nonempty("content", &p.content)?;
                check_len("content", &p.content, 128 * 1024)?;
                ActionRequest::SkillPropose(p)
            }
            Action::AuditQuery => {
                let p: AuditQueryParams = parse(params)?;
                if let Some(action) = &p.action {
                    check_len("action", action, MAX_NAME)?;
                }
                if let Some(session) = &p.session_id {
                    check_len("session_id", session, 256)?;
                }
                if let Some(limit) = p.limit {
                    if !(1..=1000).contains(&limit) {
                        return Err("limit out of range 1..=1000".to_string());
                    }
                }
                ActionRequest::AuditQuery(p)
            }
            Action::AgentDelegate => {
                let p: AgentDelegateParams = parse(params)?;
                check_nonempty("task", &p.task)?;
                check_len("task", &p.task, 32 * 1024)?;
                if let Some(agent_type) = &p.agent_type {
                    check_len("agent_type", agent_type, 64)?;
                }
                ActionRequest::AgentDelegate(p)
            }
            Action::IdentityWrite => {
                let p: IdentityWriteParams = parse(params)?;
                check_len("content", &p.content, MAX_CONTENT)?;
                ActionRequest::IdentityWrite(p)
            }
            Action::UserWrite => {
                let p: UserWriteParams = parse(params)?;
                check_len("content", &p.content, MAX_CONTENT)?;
                ActionRequest::UserWrite(p)
            }
            Action::SchedulerAdd => {
                let p: SchedulerAddParams = parse(params)?;
                check_nonempty("prompt", &p.prompt)?;
                check_len("prompt", &p.prompt, 8192)?;
                if p.interval_min < 1 {
                    return Err("interval_min must be at least 1".to_string());
                }
                ActionRequest::SchedulerAdd(p)
            }
            Action::SchedulerRemove => {
                let p: SchedulerRemoveParams = parse(params)?;
                check_nonempty("id", &p.id)?;
                check_len("id", &p.id, 64)?;
                ActionRequest::SchedulerRemove(p)
            }
            Action::SchedulerList => {
                parse_empty(params)?;
                ActionRequest::SchedulerList
            }
            Action::SchedulerRunAt => {
                let p: SchedulerRunAtParams = parse(params)?;
                check_nonempty("prompt", &p.prompt)?;
                check_len("prompt", &p.prompt, 8192)?;
                if chrono::DateTime::parse_from_rfc3339(&p.run_at).is_err() {
                    return Err("run_at must be an RFC 3339 timestamp".to_string());
                }
                ActionRequest::SchedulerRunAt(p)
            }
        };

        Ok(request)
    }

    /// The action this request resolves to.
    pub fn action(&self) -> Action {
        match self {
            ActionRequest::LlmCall(_) => Action::LlmCall,
            ActionRequest::MemoryWrite(_) => Action::MemoryWrite,
            ActionRequest::MemoryRead(_) => Action::MemoryRead,
            ActionRequest::MemoryQuery(_) => Action::MemoryQuery,
            ActionRequest::MemoryDelete(_) => Action::MemoryDelete,
            ActionRequest::MemoryList => Action::MemoryList,
            ActionRequest::WebFetch(_) => Action::WebFetch,
            ActionRequest::WebSearch(_) => Action::WebSearch,
            ActionRequest::BrowserLaunch => Action::BrowserLaunch,
            ActionRequest::BrowserNavigate(_) => Action::BrowserNavigate,
            ActionRequest::BrowserSnapshot => Action::BrowserSnapshot,
            ActionRequest::BrowserClick(_) => Action::BrowserClick,
            ActionRequest::BrowserType(_) => Action::BrowserType,
            ActionRequest::BrowserScreenshot => Action::BrowserScreenshot,
            ActionRequest::BrowserClose => Action::BrowserClose,
            ActionRequest::SkillRead(_) => Action::SkillRead,
            ActionRequest::SkillList => Action::SkillList,
            ActionRequest::SkillPropose(_) => Action::SkillPropose,
            ActionRequest::AuditQuery(_) => Action::AuditQuery,
            ActionRequest::AgentDelegate(_) => Action::AgentDelegate,
            ActionRequest::IdentityWrite(_) => Action::IdentityWrite,
            ActionRequest::UserWrite(_) => Action::UserWrite,
            ActionRequest::SchedulerAdd(_) => Action::SchedulerAdd,
            ActionRequest::SchedulerRemove(_) => Action::SchedulerRemove,
            ActionRequest::SchedulerList => Action::SchedulerList,
            ActionRequest::SchedulerRunAt(_) => Action::SchedulerRunAt,
        }
    }
}
