//! Scheduler actions over the persisted schedule table.
//!
//! Entries are session-scoped: a worker can list and remove only what its
//! own session created. The runner that executes due entries lives in the
//! supervisor.

use serde_json::{json, Value};

use ax_store::ScheduleStore;

use crate::context::ConnContext;
use crate::schema::{SchedulerAddParams, SchedulerRemoveParams, SchedulerRunAtParams};
use crate::{IpcError, Result};

pub struct SchedulerHandler {
    store: ScheduleStore,
}

impl SchedulerHandler {
    pub fn new(store: ScheduleStore) -> Self {
        Self { store }
    }

    pub async fn add(&self, ctx: &ConnContext, params: SchedulerAddParams) -> Result<Value> {
        let entry = self
            .store
            .add(&ctx.session_id, &params.prompt, params.interval_min)
            .await?;
        Ok(json!({ "entry": entry }))
    }

    pub async fn run_at(&self, ctx: &ConnContext, params: SchedulerRunAtParams) -> Result<Value> {
        let entry = self
            .store
            .add_run_at(&ctx.session_id, &params.prompt, &params.run_at)
            .await?;
        Ok(json!({ "entry": entry }))
    }

    pub async fn remove(&self, ctx: &ConnContext, params: SchedulerRemoveParams) -> Result<Value> {
        // Scope check before the delete: removing another session's entry is
        // a policy violation, not a no-op.
        let owned = self
            .store
            .list(&ctx.session_id)
            .await?
            .iter()
            .any(|entry| entry.id == params.id);
        if !owned {
            return Err(IpcError::Policy(format!(
                "Blocked: schedule entry '{}' does not belong to this session",
                params.id
            )));
        }

        let removed = self.store.remove(&params.id).await?;
        Ok(json!({ "removed": removed }))
    }

    pub async fn list(&self, ctx: &ConnContext) -> Result<Value> {
        let entries = self.store.list(&ctx.session_id).await?;
        Ok(json!({ "entries": entries }))
    }
}
