//! Handler registry: one sub-handler per action group, one dispatch point.

pub mod audit;
pub mod browser;
pub mod delegate;
pub mod identity;
pub mod llm;
pub mod memory;
pub mod scheduler;
pub mod skills;
pub mod web;

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use ax_store::{AuditLog, Database, MemoryStore, ScheduleStore};
use ax_taint::TaintEngine;

pub use browser::{BrowserDriver, NullBrowserDriver};
pub use delegate::{DelegateSpawner, NullDelegateSpawner};
pub use llm::{HttpProviderClient, LlmChunk, ProviderClient, ProviderError};

use crate::context::ConnContext;
use crate::schema::ActionRequest;
use crate::Result;

/// Everything the registry needs from the supervisor.
pub struct HandlerDeps {
    pub db: Database,
    pub audit_log: Arc<AuditLog>,
    pub taint: Arc<TaintEngine>,
    pub skills_root: PathBuf,
    pub identity_root: PathBuf,
    pub browser_driver: Arc<dyn BrowserDriver>,
    pub browser_allowlist: Vec<String>,
    pub delegate_spawner: Arc<dyn DelegateSpawner>,
    pub max_delegation_depth: u32,
    pub max_concurrent_delegations: usize,
    pub llm_primary: String,
    pub llm_fallbacks: Vec<String>,
    pub llm_default_max_tokens: u32,
    pub llm_client: Arc<dyn ProviderClient>,
    pub search_api_key: Option<String>,
}

/// The full handler set behind the IPC server.
pub struct HandlerRegistry {
    llm: llm::LlmHandler,
    memory: memory::MemoryHandler,
    web: web::WebHandler,
    browser: browser::BrowserHandler,
    skills: skills::SkillsHandler,
    audit: audit::AuditQueryHandler,
    delegate: delegate::DelegateHandler,
    identity: identity::IdentityHandler,
    scheduler: scheduler::SchedulerHandler,
}

impl HandlerRegistry {
    pub fn new(deps: HandlerDeps) -> Self {
        Self {
            llm: llm::LlmHandler::new(
                deps.llm_primary,
                deps.llm_fallbacks,
                deps.llm_default_max_tokens,
                deps.llm_client,
            ),
            memory: memory::MemoryHandler::new(
                MemoryStore::new(deps.db.clone()),
                Arc::clone(&deps.taint),
            ),
            web: web::WebHandler::new(Arc::clone(&deps.taint), deps.search_api_key),
            browser: browser::BrowserHandler::new(
                deps.browser_driver,
                deps.browser_allowlist,
                Arc::clone(&deps.taint),
            ),
            skills: skills::SkillsHandler::new(deps.skills_root),
            audit: audit::AuditQueryHandler::new(deps.audit_log),
            delegate: delegate::DelegateHandler::new(
                deps.delegate_spawner,
                deps.max_delegation_depth,
                deps.max_concurrent_delegations,
            ),
            identity: identity::IdentityHandler::new(deps.identity_root, deps.taint),
            scheduler: scheduler::SchedulerHandler::new(ScheduleStore::new(deps.db)),
        }
    }

    /// Route a validated request to its handler.
    pub async fn dispatch(&self, ctx: &ConnContext, request: ActionRequest) -> Result<Value> {
        match request {
            ActionRequest::LlmCall(p) => self.llm.call(p).await,
            ActionRequest::MemoryWrite(p) => self.memory.write(ctx, p).await,
            ActionRequest::MemoryRead(p) => self.memory.read(ctx, p).await,
            ActionRequest::MemoryQuery(p) => self.memory.query(ctx, p).await,
            ActionRequest::MemoryDelete(p) => self.memory.delete(ctx, p).await,
            ActionRequest::MemoryList => self.memory.list(ctx).await,
            ActionRequest::WebFetch(p) => self.web.fetch(ctx, p).await,
            ActionRequest::WebSearch(p) => self.web.search(ctx, p).await,
            ActionRequest::BrowserLaunch => self.browser.launch().await,
            ActionRequest::BrowserNavigate(p) => self.browser.navigate(p).await,
            ActionRequest::BrowserSnapshot => self.browser.snapshot(ctx).await,
            ActionRequest::BrowserClick(p) => self.browser.click(p).await,
            ActionRequest::BrowserType(p) => self.browser.type_text(p).await,
            ActionRequest::BrowserScreenshot => self.browser.screenshot(ctx).await,
            ActionRequest::BrowserClose => self.browser.close().await,
            ActionRequest::SkillRead(p) => self.skills.read(p).await,
            ActionRequest::SkillList => self.skills.list().await,
            ActionRequest::SkillPropose(p) => self.skills.propose(p).await,
            ActionRequest::AuditQuery(p) => self.audit.query(p).await,
            ActionRequest::AgentDelegate(p) => self.delegate.delegate(ctx, p).await,
            ActionRequest::IdentityWrite(p) => self.identity.write_identity(p).await,
            ActionRequest::UserWrite(p) => self.identity.write_user(p).await,
            ActionRequest::SchedulerAdd(p) => self.scheduler.add(ctx, p).await,
            ActionRequest::SchedulerRemove(p) => self.scheduler.remove(ctx, p).await,
            ActionRequest::SchedulerList => self.scheduler.list(ctx).await,
            ActionRequest::SchedulerRunAt(p) => self.scheduler.run_at(ctx, p).await,
        }
    }
}
