//! Read-only audit log queries.

use std::sync::Arc;

use serde_json::{json, Value};

use ax_store::{AuditFilter, AuditLog};

use crate::schema::AuditQueryParams;
use crate::Result;

pub struct AuditQueryHandler {
    log: Arc<AuditLog>,
}

impl AuditQueryHandler {
    pub fn new(log: Arc<AuditLog>) -> Self {
        Self { log }
    }

    pub async fn query(&self, params: AuditQueryParams) -> Result<Value> {
        let filter = AuditFilter {
            action: params.action,
            session_id: params.session_id,
            result: params.result,
            limit: params.limit.map(|l| l as usize),
        };
        let entries = self.log.query(&filter).await?;
        Ok(json!({ "entries": entries }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ax_store::{AuditEntry, AuditResult};
    use serde_json::from_value;
    use tempfile::TempDir;

    #[tokio::test]
    async fn query_filters_by_result() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(AuditLog::new(dir.path().join("audit.jsonl")));
        log.append(&AuditEntry::new(
            "web_fetch",
            "s",
            "main",
            &json!({}),
            AuditResult::Success,
        ))
        .await
        .unwrap();
        log.append(&AuditEntry::new(
            "web_fetch",
            "s",
            "main",
            &json!({}),
            AuditResult::Blocked,
        ))
        .await
        .unwrap();

        let handler = AuditQueryHandler::new(log);
        let result = handler
            .query(from_value(json!({"result": "blocked"})).unwrap())
            .await
            .unwrap();
        assert_eq!(result["entries"].as_array().unwrap().len(), 1);
    }
}
