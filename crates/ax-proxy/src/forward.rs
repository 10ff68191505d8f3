//! Request forwarding: credential swap, body rules, response streaming.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::Response;
use serde_json::{json, Value};
use tracing::{debug, warn};

use ax_store::{CredentialMode, Credentials};

/// Upstream base URL when none is configured.
pub const DEFAULT_UPSTREAM: &str = "https://api.anthropic.com";

/// Hard ceiling on request bodies read from the worker.
pub const MAX_REQUEST_BODY: usize = 4 * 1024 * 1024;

/// Protocol version header required by the upstream.
const UPSTREAM_VERSION: &str = "2023-06-01";

/// Beta flags the upstream mandates for bearer-token access.
const BEARER_BETA_FLAGS: &str = "oauth-2025-04-20";

/// Identity block prepended to the system prompt in bearer mode.
const IDENTITY_BLOCK: &str = "You are a personal agent operating inside the AX host.";

/// Headers that must not be forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "transfer-encoding",
    "content-encoding",
    "content-length",
    "keep-alive",
    "upgrade",
];

/// Shared proxy state. Cheap to clone; one per listener.
#[derive(Clone)]
pub struct ProxyState {
    credentials: Arc<Credentials>,
    client: reqwest::Client,
    upstream_base: Arc<String>,
}

impl ProxyState {
    pub fn new(credentials: Arc<Credentials>, upstream_base: Option<String>) -> Self {
        Self {
            credentials,
            client: reqwest::Client::new(),
            upstream_base: Arc::new(
                upstream_base.unwrap_or_else(|| DEFAULT_UPSTREAM.to_string()),
            ),
        }
    }
}

/// Single entry point for every request on the proxy socket.
pub async fn handle(State(state): State<ProxyState>, req: Request) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if method == Method::OPTIONS {
        return preflight();
    }
    if method != Method::POST || !path.starts_with("/v1/") {
        return error_response(StatusCode::NOT_FOUND, "not_found", "unknown route");
    }

    let headers = req.headers().clone();
    let body = match axum::body::to_bytes(req.into_body(), MAX_REQUEST_BODY).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(
                StatusCode::BAD_GATEWAY,
                "proxy_error",
                "request body exceeds the 4 MiB ceiling",
            );
        }
    };

    forward(&state, &path, headers, body).await
}

async fn forward(state: &ProxyState, path: &str, headers: HeaderMap, body: Bytes) -> Response {
    // Fail closed: a proxy without a real credential must not forward the
    // worker's placeholder upstream.
    let Some(mode) = state.credentials.mode() else {
        return error_response(
            StatusCode::UNAUTHORIZED,
            "authentication_error",
            "no upstream credential configured",
        );
    };
    let auth_mode = mode.label();

    let mut out_headers = strip_headers(&headers);
    let body = apply_credentials(&mut out_headers, &mode, path, body);

    let url = format!("{}{}", state.upstream_base, path);
    debug!(%url, auth_mode, "forwarding");

    let upstream = match state
        .client
        .post(&url)
        .headers(out_headers)
        .body(body)
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            warn!(error = %e, auth_mode, "upstream unreachable");
            return error_response(
                StatusCode::BAD_GATEWAY,
                "proxy_error",
                &format!("upstream request failed: {e}"),
            );
        }
    };

    let status = upstream.status();
    if status.is_client_error() || status.is_server_error() {
        warn!(status = status.as_u16(), auth_mode, "upstream returned an error status");
    }

    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY));
    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            builder = builder.header(name, value);
        }
    }

    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| {
            error_response(StatusCode::BAD_GATEWAY, "proxy_error", "response assembly failed")
        })
}

/// Copy request headers, dropping hop-by-hop fields, the Host header, and
/// whatever placeholder credential the worker presented.
fn strip_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.as_str();
        if is_hop_by_hop(lower)
            || lower == "host"
            || lower == "x-api-key"
            || lower == "authorization"
        {
            continue;
        }
        out.insert(name.clone(), value.clone());
    }
    out
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Inject the real credential and, in bearer mode, the identity the
/// upstream mandates. Returns the (possibly rewritten) body.
fn apply_credentials(
    headers: &mut HeaderMap,
    mode: &CredentialMode<'_>,
    path: &str,
    body: Bytes,
) -> Bytes {
    match mode {
        CredentialMode::ApiKey(key) => {
            if let Ok(value) = HeaderValue::from_str(key) {
                headers.insert(HeaderName::from_static("x-api-key"), value);
            }
            headers.insert(
                HeaderName::from_static("anthropic-version"),
                HeaderValue::from_static(UPSTREAM_VERSION),
            );
            body
        }
        CredentialMode::Bearer(token) => {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(HeaderName::from_static("authorization"), value);
            }
            headers.insert(
                HeaderName::from_static("anthropic-version"),
                HeaderValue::from_static(UPSTREAM_VERSION),
            );

            let merged = merge_beta_flags(
                headers
                    .get("anthropic-beta")
                    .and_then(|v| v.to_str().ok()),
            );
            if let Ok(value) = HeaderValue::from_str(&merged) {
                headers.insert(HeaderName::from_static("anthropic-beta"), value);
            }

            if path.ends_with("/messages") {
                ensure_identity_block(body)
            } else {
                body
            }
        }
    }
}

/// Merge the mandated bearer beta flags into an existing header value.
fn merge_beta_flags(existing: Option<&str>) -> String {
    match existing {
        Some(current) if current.split(',').any(|f| f.trim() == BEARER_BETA_FLAGS) => {
            current.to_string()
        }
        Some(current) if !current.trim().is_empty() => {
            format!("{current},{BEARER_BETA_FLAGS}")
        }
        _ => BEARER_BETA_FLAGS.to_string(),
    }
}

/// Prepend the identity system block to a messages-endpoint body when it is
/// not already the leading system entry. Non-JSON bodies pass through
/// untouched; the upstream will reject them with a better error than we
/// could synthesize.
fn ensure_identity_block(body: Bytes) -> Bytes {
    let Ok(mut payload) = serde_json::from_slice::<Value>(&body) else {
        return body;
    };
    let Some(obj) = payload.as_object_mut() else {
        return body;
    };

    let block = json!({ "type": "text", "text": IDENTITY_BLOCK });
    match obj.get_mut("system") {
        None => {
            obj.insert("system".to_string(), json!([block]));
        }
        Some(Value::Array(entries)) => {
            let already = entries
                .first()
                .and_then(|e| e.get("text"))
                .and_then(|t| t.as_str())
                .map(|t| t == IDENTITY_BLOCK)
                .unwrap_or(false);
            if !already {
                entries.insert(0, block);
            }
        }
        Some(Value::String(existing)) => {
            let tail = json!({ "type": "text", "text": existing.clone() });
            obj.insert("system".to_string(), json!([block, tail]));
        }
        Some(_) => {}
    }

    match serde_json::to_vec(&payload) {
        Ok(rewritten) => Bytes::from(rewritten),
        Err(_) => body,
    }
}

fn preflight() -> Response {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header("access-control-allow-origin", "*")
        .header("access-control-allow-methods", "POST, OPTIONS")
        .header("access-control-allow-headers", "*")
        .body(Body::empty())
        .expect("static response")
}

fn error_response(status: StatusCode, kind: &str, message: &str) -> Response {
    let body = json!({
        "type": "error",
        "error": { "type": kind, "message": message },
    });
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("static response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn state_with(creds: Credentials) -> ProxyState {
        ProxyState::new(Arc::new(creds), None)
    }

    async fn send(state: ProxyState, req: HttpRequest<Body>) -> Response {
        router(state).oneshot(req).await.unwrap()
    }

    #[tokio::test]
    async fn non_post_is_404() {
        let resp = send(
            state_with(Credentials::from_parts(Some("k".into()), None)),
            HttpRequest::builder()
                .method("GET")
                .uri("/v1/messages")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn non_v1_path_is_404() {
        let resp = send(
            state_with(Credentials::from_parts(Some("k".into()), None)),
            HttpRequest::builder()
                .method("POST")
                .uri("/admin/messages")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn options_preflight_is_permissive() {
        let resp = send(
            state_with(Credentials::from_parts(None, None)),
            HttpRequest::builder()
                .method("OPTIONS")
                .uri("/v1/messages")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            resp.headers().get("access-control-allow-origin").unwrap(),
            "*"
        );
    }

    #[tokio::test]
    async fn missing_credentials_fail_closed() {
        let resp = send(
            state_with(Credentials::from_parts(None, None)),
            HttpRequest::builder()
                .method("POST")
                .uri("/v1/messages")
                .header("x-api-key", "placeholder-from-worker")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["error"]["type"], "authentication_error");
    }

    #[tokio::test]
    async fn oversized_body_is_502() {
        let huge = vec![b'x'; MAX_REQUEST_BODY + 1];
        let resp = send(
            state_with(Credentials::from_parts(None, None)),
            HttpRequest::builder()
                .method("POST")
                .uri("/v1/messages")
                .body(Body::from(huge))
                .unwrap(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn placeholder_credentials_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("placeholder"));
        headers.insert("authorization", HeaderValue::from_static("Bearer fake"));
        headers.insert("host", HeaderValue::from_static("localhost"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let out = strip_headers(&headers);
        assert!(out.get("x-api-key").is_none());
        assert!(out.get("authorization").is_none());
        assert!(out.get("host").is_none());
        assert_eq!(out.get("content-type").unwrap(), "application/json");
    }

    #[test]
    fn api_key_mode_sets_key_header() {
        let mut headers = HeaderMap::new();
        let body = apply_credentials(
            &mut headers,
            &CredentialMode::ApiKey("sk-real"),
            "/v1/messages",
            Bytes::from_static(b"{}"),
        );
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-real");
        assert!(headers.get("authorization").is_none());
        // API-key mode leaves the body alone.
        assert_eq!(&body[..], b"{}");
    }

    #[test]
    fn bearer_mode_sets_token_and_betas() {
        let mut headers = HeaderMap::new();
        apply_credentials(
            &mut headers,
            &CredentialMode::Bearer("tok"),
            "/v1/complete",
            Bytes::from_static(b"{}"),
        );
        assert_eq!(headers.get("authorization").unwrap(), "Bearer tok");
        assert_eq!(headers.get("anthropic-beta").unwrap(), BEARER_BETA_FLAGS);
        assert!(headers.get("anthropic-version").is_some());
    }

    #[test]
    fn beta_flags_merge_without_duplication() {
        assert_eq!(merge_beta_flags(None), BEARER_BETA_FLAGS);
        assert_eq!(
            merge_beta_flags(Some("tools-2024")),
            format!("tools-2024,{BEARER_BETA_FLAGS}")
        );
        assert_eq!(
            merge_beta_flags(Some(BEARER_BETA_FLAGS)),
            BEARER_BETA_FLAGS
        );
    }

    #[test]
    fn identity_block_added_when_absent() {
        let body = Bytes::from_static(br#"{"model":"m","messages":[]}"#);
        let out = ensure_identity_block(body);
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["system"][0]["text"], IDENTITY_BLOCK);
    }

    #[test]
    fn identity_block_not_duplicated() {
        let body = serde_json::to_vec(&json!({
            "system": [{ "type": "text", "text": IDENTITY_BLOCK }],
            "messages": [],
        }))
        .unwrap();
        let out = ensure_identity_block(Bytes::from(body));
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["system"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn string_system_prompt_is_preserved_after_block() {
        let body = serde_json::to_vec(&json!({
            "system": "existing prompt",
            "messages": [],
        }))
        .unwrap();
        let out = ensure_identity_block(Bytes::from(body));
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        let system = parsed["system"].as_array().unwrap();
        assert_eq!(system[0]["text"], IDENTITY_BLOCK);
        assert_eq!(system[1]["text"], "existing prompt");
    }

    #[test]
    fn non_json_body_passes_through() {
        let body = Bytes::from_static(b"not json");
        let out = ensure_identity_block(body.clone());
        assert_eq!(out, body);
    }

    #[test]
    fn hop_by_hop_detection() {
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("content-encoding"));
        assert!(is_hop_by_hop("content-length"));
        assert!(!is_hop_by_hop("content-type"));
    }
}
