//! Memory action handlers.
//!
//! Scope is always the connection's session id, so a worker can only reach
//! its own partition. Taint is recorded when content re-enters the
//! conversation on read; the original external recording happened when the
//! content first crossed the boundary.

use std::sync::Arc;

use serde_json::{json, Value};

use ax_store::{MemoryQuery, MemoryStore};
use ax_taint::{TaintEngine, TaintTag, TrustLevel};

use crate::context::ConnContext;
use crate::schema::{MemoryKeyParams, MemoryQueryParams, MemoryWriteParams};
use crate::Result;

pub struct MemoryHandler {
    store: MemoryStore,
    taint: Arc<TaintEngine>,
}

impl MemoryHandler {
    pub fn new(store: MemoryStore, taint: Arc<TaintEngine>) -> Self {
        Self { store, taint }
    }

    pub async fn write(&self, ctx: &ConnContext, params: MemoryWriteParams) -> Result<Value> {
        let tag = params.tainted.then(|| {
            TaintTag::external(
                params
                    .source
                    .clone()
                    .unwrap_or_else(|| format!("memory:{}", params.key)),
            )
        });

        let entry = self
            .store
            .write(
                &ctx.session_id,
                &params.key,
                &params.content,
                &params.tags,
                tag.as_ref(),
            )
            .await?;
        Ok(json!({ "entry": entry }))
    }

    pub async fn read(&self, ctx: &ConnContext, params: MemoryKeyParams) -> Result<Value> {
        let entry = self.store.read(&ctx.session_id, &params.key).await?;
        if let Some(entry) = &entry {
            let trust = if entry.taint.is_some() {
                TrustLevel::External
            } else {
                TrustLevel::Internal
            };
            self.taint.record(&ctx.session_id, &entry.content, trust);
        }
        Ok(json!({ "entry": entry }))
    }

    pub async fn query(&self, ctx: &ConnContext, params: MemoryQueryParams) -> Result<Value> {
        let entries = self
            .store
            .query(
                &ctx.session_id,
                &MemoryQuery {
                    text: params.text,
                    tags: params.tags,
                    limit: params.limit,
                },
            )
            .await?;

        for entry in &entries {
            if entry.taint.is_some() {
                self.taint
                    .record(&ctx.session_id, &entry.content, TrustLevel::External);
            }
        }
        Ok(json!({ "entries": entries }))
    }

    pub async fn delete(&self, ctx: &ConnContext, params: MemoryKeyParams) -> Result<Value> {
        let deleted = self.store.delete(&ctx.session_id, &params.key).await?;
        Ok(json!({ "deleted": deleted }))
    }

    pub async fn list(&self, ctx: &ConnContext) -> Result<Value> {
        let keys = self.store.list(&ctx.session_id).await?;
        Ok(json!({ "keys": keys }))
    }
}
