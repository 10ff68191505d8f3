//! # Credential-Injecting Forward Proxy
//!
//! The worker speaks the standard LLM wire protocol at a Unix socket and
//! presents a placeholder credential. This proxy owns the socket, swaps the
//! placeholder for the real credential held by the supervisor, and forwards
//! to the fixed upstream. The worker never sees a real secret, and because
//! its sandbox has no network, this socket is its only route to a model.
//!
//! ## Contract
//!
//! - Only `POST /v1/...` is forwarded. `OPTIONS` gets a permissive
//!   pre-flight answer; every other method or path is a 404.
//! - Request bodies are read with a hard 4 MiB ceiling; overflow is a 502.
//! - API-key mode wins when a key exists; bearer mode otherwise. Bearer
//!   mode adds the upstream identity headers, merges the mandated beta
//!   flags, and on the messages endpoint prepends the identity system block
//!   to the JSON body when absent.
//! - No credential at all fails closed with a structured 401.
//! - Upstream responses stream back chunk-by-chunk with hop-by-hop headers
//!   stripped, so the worker sees the decompressed body.
//!
//! The proxy holds no per-request state; concurrent forwards are
//! independent.

mod forward;

pub use forward::{ProxyState, DEFAULT_UPSTREAM, MAX_REQUEST_BODY};

use std::path::Path;
use std::sync::Arc;

use axum::routing::any;
use axum::Router;
use thiserror::Error;
use tokio::net::UnixListener;
use tracing::info;

use ax_store::Credentials;

/// Errors starting the proxy listener.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy socket error: {0}")]
    Socket(#[from] std::io::Error),
}

/// Result alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Build the proxy router around shared credential state.
pub fn router(state: ProxyState) -> Router {
    // A single catch-all keeps the 404 semantics exact: non-POST methods
    // on /v1 paths must 404, not 405.
    Router::new()
        .route("/{*path}", any(forward::handle))
        .with_state(state)
}

/// Bind the Unix socket and serve forever. Replaces a stale socket file
/// from a previous run.
pub async fn serve(
    socket_path: impl AsRef<Path>,
    credentials: Arc<Credentials>,
    upstream_base: Option<String>,
) -> Result<()> {
    let path = socket_path.as_ref();
    if path.exists() {
        tokio::fs::remove_file(path).await?;
    }

    let listener = UnixListener::bind(path)?;
    info!(path = %path.display(), "proxy listening");

    let state = ProxyState::new(credentials, upstream_base);
    axum::serve(listener, router(state))
        .await
        .map_err(ProxyError::Socket)
}
