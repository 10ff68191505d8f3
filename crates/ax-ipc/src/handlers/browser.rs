//! Browser action handlers.
//!
//! The worker never gets a script-execution surface: the seven structured
//! commands here are the whole browser API. Navigation goes through the
//! optional domain allowlist first, and everything that comes back (page
//! text, element lists, screenshots) is tagged external before the worker
//! sees it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

use ax_taint::{TaintEngine, TaintTag, TrustLevel};

use crate::context::ConnContext;
use crate::schema::{BrowserNavigateParams, BrowserRefParams, BrowserTypeParams};
use crate::{IpcError, Result};

/// Environment variable with a comma-separated domain allowlist.
pub const ENV_BROWSER_ALLOWLIST: &str = "AX_BROWSER_ALLOWED_DOMAINS";

/// Bound on the page text a snapshot returns.
const SNAPSHOT_TEXT_MAX: usize = 16 * 1024;
/// Bound on the interactive element list a snapshot returns.
const SNAPSHOT_ELEMENTS_MAX: usize = 100;

/// One interactive element with a stable ref the worker can click or type
/// into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementRef {
    pub element_ref: String,
    pub role: String,
    pub label: String,
}

/// What the driver reports for the current page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub title: String,
    pub url: String,
    pub text: String,
    pub elements: Vec<ElementRef>,
}

/// Contract the supervisor's browser integration implements. Kept behind a
/// trait so the core carries no engine-specific code.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self) -> Result<()>;
    async fn navigate(&self, url: &str) -> Result<()>;
    async fn snapshot(&self) -> Result<PageSnapshot>;
    async fn click(&self, element_ref: &str) -> Result<()>;
    async fn type_text(&self, element_ref: &str, text: &str) -> Result<()>;
    async fn screenshot(&self) -> Result<Vec<u8>>;
    async fn close(&self) -> Result<()>;
}

/// Driver used when no browser integration is configured.
pub struct NullBrowserDriver;

#[async_trait]
impl BrowserDriver for NullBrowserDriver {
    async fn launch(&self) -> Result<()> {
        Err(IpcError::Resource("no browser driver configured".to_string()))
    }
    async fn navigate(&self, _url: &str) -> Result<()> {
        Err(IpcError::Resource("no browser driver configured".to_string()))
    }
    async fn snapshot(&self) -> Result<PageSnapshot> {
        Err(IpcError::Resource("no browser driver configured".to_string()))
    }
    async fn click(&self, _element_ref: &str) -> Result<()> {
        Err(IpcError::Resource("no browser driver configured".to_string()))
    }
    async fn type_text(&self, _element_ref: &str, _text: &str) -> Result<()> {
        Err(IpcError::Resource("no browser driver configured".to_string()))
    }
    async fn screenshot(&self) -> Result<Vec<u8>> {
        Err(IpcError::Resource("no browser driver configured".to_string()))
    }
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Allowlist matcher: a bare domain admits itself and its subdomains.
pub fn domain_allowed(allowlist: &[String], host: &str) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    allowlist.iter().any(|allowed| {
        let allowed = allowed.trim().to_ascii_lowercase();
        let host = host.to_ascii_lowercase();
        host == allowed || host.ends_with(&format!(".{allowed}"))
    })
}

/// Read the allowlist from the environment.
pub fn allowlist_from_env() -> Vec<String> {
    std::env::var(ENV_BROWSER_ALLOWLIST)
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

pub struct BrowserHandler {
    driver: Arc<dyn BrowserDriver>,
    allowlist: Vec<String>,
    taint: Arc<TaintEngine>,
}

impl BrowserHandler {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        allowlist: Vec<String>,
        taint: Arc<TaintEngine>,
    ) -> Self {
        Self {
            driver,
            allowlist,
            taint,
        }
    }

    pub async fn launch(&self) -> Result<Value> {
        self.driver.launch().await?;
        Ok(json!({ "launched": true }))
    }

    pub async fn navigate(&self, params: BrowserNavigateParams) -> Result<Value> {
        let url = Url::parse(&params.url)
            .map_err(|e| IpcError::Validation(format!("url: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| IpcError::Validation("url has no host".to_string()))?;

        if !domain_allowed(&self.allowlist, host) {
            return Err(IpcError::Policy(format!(
                "Blocked: domain '{host}' is not in the browser allowlist"
            )));
        }

        self.driver.navigate(url.as_str()).await?;
        Ok(json!({ "url": url.as_str() }))
    }

    pub async fn snapshot(&self, ctx: &ConnContext) -> Result<Value> {
        let mut snapshot = self.driver.snapshot().await?;

        snapshot.text = truncate_on_boundary(snapshot.text, SNAPSHOT_TEXT_MAX);
        snapshot.elements.truncate(SNAPSHOT_ELEMENTS_MAX);

        self.taint
            .record(&ctx.session_id, &snapshot.text, TrustLevel::External);

        Ok(json!({
            "snapshot": snapshot,
            "taint": TaintTag::external("browser"),
        }))
    }

    pub async fn click(&self, params: BrowserRefParams) -> Result<Value> {
        self.driver.click(&params.element_ref).await?;
        Ok(json!({ "clicked": params.element_ref }))
    }

    pub async fn type_text(&self, params: BrowserTypeParams) -> Result<Value> {
        self.driver
            .type_text(&params.element_ref, &params.text)
            .await?;
        Ok(json!({ "typed": params.element_ref }))
    }

    pub async fn screenshot(&self, ctx: &ConnContext) -> Result<Value> {
        let png = self.driver.screenshot().await?;
        self.taint
            .record_tokens(&ctx.session_id, (png.len() as u64).div_ceil(4), TrustLevel::External);
        Ok(json!({
            "size": png.len(),
            "taint": TaintTag::external("browser"),
        }))
    }

    pub async fn close(&self) -> Result<Value> {
        self.driver.close().await?;
        Ok(json!({ "closed": true }))
    }
}

fn truncate_on_boundary(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}
