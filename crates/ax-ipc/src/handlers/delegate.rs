//! Sub-agent delegation.
//!
//! Two ceilings apply: maximum nesting depth (parsed from the caller's
//! agent id) and maximum concurrent delegations across the process. The
//! concurrency slot is taken with an atomic increment before the first
//! await and released by a drop guard, so neither a race between two
//! delegating workers nor a cancelled handler can leak a slot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::ConnContext;
use crate::schema::AgentDelegateParams;
use crate::{IpcError, Result};

/// Seam to the dispatcher: actually running a child session lives with the
/// supervisor, not the IPC layer.
#[async_trait]
pub trait DelegateSpawner: Send + Sync {
    async fn spawn_child(
        &self,
        parent_session: &str,
        child_agent_id: &str,
        task: &str,
        agent_type: Option<&str>,
    ) -> Result<Value>;
}

/// Spawner used when delegation is not wired up.
pub struct NullDelegateSpawner;

#[async_trait]
impl DelegateSpawner for NullDelegateSpawner {
    async fn spawn_child(
        &self,
        _parent_session: &str,
        _child_agent_id: &str,
        _task: &str,
        _agent_type: Option<&str>,
    ) -> Result<Value> {
        Err(IpcError::Resource("delegation is not configured".to_string()))
    }
}

struct SlotGuard(Arc<AtomicUsize>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct DelegateHandler {
    spawner: Arc<dyn DelegateSpawner>,
    max_depth: u32,
    max_concurrent: usize,
    active: Arc<AtomicUsize>,
}

impl DelegateHandler {
    pub fn new(spawner: Arc<dyn DelegateSpawner>, max_depth: u32, max_concurrent: usize) -> Self {
        Self {
            spawner,
            max_depth,
            max_concurrent,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn active_delegations(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn delegate(&self, ctx: &ConnContext, params: AgentDelegateParams) -> Result<Value> {
        // Depth check first: a rejected caller must leave the concurrency
        // counter untouched.
        if ctx.delegation_depth() >= self.max_depth {
            return Err(IpcError::Policy(format!(
                "Max delegation depth reached ({})",
                self.max_depth
            )));
        }

        // Claim the slot before any await.
        let previously_active = self.active.fetch_add(1, Ordering::SeqCst);
        let _slot = SlotGuard(Arc::clone(&self.active));
        if previously_active >= self.max_concurrent {
            return Err(IpcError::Policy(format!(
                "Max concurrent delegations reached ({})",
                self.max_concurrent
            )));
        }

        self.spawner
            .spawn_child(
                &ctx.session_id,
                &ctx.child_agent_id(),
                &params.task,
                params.agent_type.as_deref(),
            )
            .await
    }
}
