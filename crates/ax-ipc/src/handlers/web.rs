//! Web fetch and search handlers.
//!
//! Fetch is the SSRF choke point. The hostname is resolved exactly once,
//! every resolved address is classified against the blocked ranges, and the
//! request is then pinned to the vetted address while keeping the original
//! Host header. Redirects are not followed: a redirect is a fresh URL and
//! must come back through this handler to be re-vetted.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use ax_taint::{TaintEngine, TaintTag, TrustLevel};

use crate::context::ConnContext;
use crate::schema::{WebFetchParams, WebSearchParams};
use crate::{IpcError, Result};

/// Response body ceiling; larger bodies are truncated at this boundary.
pub const MAX_FETCH_BODY: usize = 1024 * 1024;

/// Default fetch timeout when the worker does not pick one.
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// Search upstream; queried only when an API key is configured.
const SEARCH_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";

/// One search hit, normalized from the upstream shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Fetch/search over the host's network, tagging results as external.
pub struct WebHandler {
    taint: Arc<TaintEngine>,
    search_api_key: Option<String>,
}

impl WebHandler {
    pub fn new(taint: Arc<TaintEngine>, search_api_key: Option<String>) -> Self {
        Self {
            taint,
            search_api_key,
        }
    }

    /// `web_fetch`: resolve, vet, pin, fetch, bound, tag.
    pub async fn fetch(&self, ctx: &ConnContext, params: WebFetchParams) -> Result<Value> {
        let url = Url::parse(&params.url)
            .map_err(|e| IpcError::Validation(format!("url: {e}")))?;

        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(IpcError::Policy(format!(
                    "Blocked: scheme '{other}' is not allowed"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| IpcError::Validation("url has no host".to_string()))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| IpcError::Validation("url has no port".to_string()))?;

        let pinned = resolve_and_vet(&host, port).await?;
        debug!(%host, %pinned, "pinned fetch target");

        let timeout = Duration::from_secs(
            params.timeout_secs.unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS),
        );

        // The resolver override sends the request to the vetted address
        // while the URL (and therefore the Host header and SNI) keeps the
        // original name.
        let client = reqwest::Client::builder()
            .resolve(&host, pinned)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|e| IpcError::Internal(e.to_string()))?;

        let mut response = client
            .get(url.clone())
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        let status = response.status().as_u16();
        let mut body = Vec::new();
        let mut truncated = false;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(classify_reqwest_error)?
        {
            let remaining = MAX_FETCH_BODY - body.len();
            if chunk.len() >= remaining {
                body.extend_from_slice(&chunk[..remaining]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }

        let content = String::from_utf8_lossy(&body).into_owned();
        let tag = TaintTag::external(format!("web_fetch:{host}"));
        self.taint
            .record(&ctx.session_id, &content, TrustLevel::External);

        Ok(json!({
            "status": status,
            "url": url.as_str(),
            "content": content,
            "truncated": truncated,
            "taint": tag,
        }))
    }

    /// `web_search`: parameterized query against the allowed upstream.
    pub async fn search(&self, ctx: &ConnContext, params: WebSearchParams) -> Result<Value> {
        let Some(api_key) = &self.search_api_key else {
            return Err(IpcError::UpstreamPermanent(
                "no search provider configured".to_string(),
            ));
        };

        let count = params.count.unwrap_or(5);
        let count_param = count.to_string();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS))
            .build()
            .map_err(|e| IpcError::Internal(e.to_string()))?;

        let response = client
            .get(SEARCH_ENDPOINT)
            .query(&[("q", params.query.as_str()), ("count", count_param.as_str())])
            .header("x-subscription-token", api_key)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let err = format!("search upstream returned {status}");
            return Err(if status == 429 || status >= 500 {
                IpcError::Upstream(err)
            } else {
                IpcError::UpstreamPermanent(err)
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(classify_reqwest_error)?;
        let results = parse_search_results(&payload, count as usize);

        for result in &results {
            self.taint
                .record(&ctx.session_id, &result.snippet, TrustLevel::External);
        }

        Ok(json!({
            "results": results,
            "taint": TaintTag::external("web_search"),
        }))
    }
}

/// Resolve a hostname and reject the lookup if any answer lands in a
/// blocked range. Returns the address the request must be pinned to.
///
/// Checking every answer (not just the first) closes the rebinding trick of
/// mixing one public and one internal address in a response.
pub async fn resolve_and_vet(host: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| IpcError::Upstream(format!("dns lookup failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(IpcError::Upstream(format!("dns lookup for {host} returned no addresses")));
    }

    for addr in &addrs {
        if is_blocked_addr(&addr.ip()) {
            return Err(IpcError::Policy(format!(
                "Blocked: {host} resolves to restricted address {}",
                addr.ip()
            )));
        }
    }

    Ok(addrs[0])
}

/// Address ranges the worker must never reach: loopback, RFC 1918 private,
/// link-local (the cloud metadata range lives here), CGNAT, and their IPv6
/// counterparts including v4-mapped forms.
pub fn is_blocked_addr(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                // CGNAT 100.64.0.0/10
                || (octets[0] == 100 && (64..128).contains(&octets[1]))
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_blocked_addr(&IpAddr::V4(mapped));
            }
            let segments = v6.segments();
            v6.is_unspecified()
                || v6.is_loopback()
                // unique-local fc00::/7
                || (segments[0] & 0xfe00) == 0xfc00
                // link-local fe80::/10
                || (segments[0] & 0xffc0) == 0xfe80
        }
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> IpcError {
    if e.is_timeout() {
        IpcError::Upstream(format!("request timed out: {e}"))
    } else {
        IpcError::Upstream(e.to_string())
    }
}

/// Pull `{title, url, snippet}` triples out of the upstream payload.
fn parse_search_results(payload: &Value, limit: usize) -> Vec<SearchResult> {
    payload["web"]["results"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .take(limit)
                .map(|item| SearchResult {
                    title: item["title"].as_str().unwrap_or_default().to_string(),
                    url: item["url"].as_str().unwrap_or_default().to_string(),
                    snippet: item["description"].as_str().unwrap_or_default().to_string(),
                })
                .collect()
        })
        .unwrap_or_default()
}
