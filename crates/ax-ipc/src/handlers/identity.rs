//! Identity and user file writes.
//!
//! The identity file set is immutable by schema (the file names are a
//! closed enum) but evolvable through these audited writes. Under the
//! paranoid profile, writes to the defining files (`bootstrap`, `soul`) are
//! parked for review instead of landing directly.

use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

use ax_taint::{SecurityProfile, TaintEngine};

use crate::schema::{IdentityFile, IdentityWriteParams, UserWriteParams};
use crate::Result;

const REVIEW_DIR: &str = "review";

pub struct IdentityHandler {
    root: PathBuf,
    taint: Arc<TaintEngine>,
}

impl IdentityHandler {
    pub fn new(root: PathBuf, taint: Arc<TaintEngine>) -> Self {
        Self { root, taint }
    }

    pub async fn write_identity(&self, params: IdentityWriteParams) -> Result<Value> {
        let review_gated = self.taint.profile() == SecurityProfile::Paranoid
            && matches!(params.file, IdentityFile::Bootstrap | IdentityFile::Soul);

        if review_gated {
            let review = self.root.join(REVIEW_DIR);
            tokio::fs::create_dir_all(&review).await?;
            let path = ax_pathsafe::constrain(&review, &[params.file.file_name()])?;
            tokio::fs::write(&path, &params.content).await?;
            return Ok(json!({
                "file": params.file,
                "status": "review",
            }));
        }

        let path = ax_pathsafe::constrain(&self.root, &[params.file.file_name()])?;
        tokio::fs::write(&path, &params.content).await?;
        Ok(json!({
            "file": params.file,
            "status": "written",
            "bytes": params.content.len(),
        }))
    }

    pub async fn write_user(&self, params: UserWriteParams) -> Result<Value> {
        let path = ax_pathsafe::constrain(&self.root, &[params.file.file_name()])?;
        tokio::fs::write(&path, &params.content).await?;
        Ok(json!({
            "file": params.file,
            "status": "written",
            "bytes": params.content.len(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::from_value;
    use tempfile::TempDir;

    fn handler(profile: SecurityProfile) -> (IdentityHandler, TempDir) {
        let dir = TempDir::new().unwrap();
        (
            IdentityHandler::new(
                dir.path().to_path_buf(),
                Arc::new(TaintEngine::new(profile)),
            ),
            dir,
        )
    }

    #[tokio::test]
    async fn identity_write_lands_in_identity_dir() {
        let (h, dir) = handler(SecurityProfile::Balanced);
        let result = h
            .write_identity(from_value(json!({
                "file": "soul",
                "content": "# Who I am",
            }))
            .unwrap())
            .await
            .unwrap();

        assert_eq!(result["status"], "written");
        let stored = std::fs::read_to_string(dir.path().join("soul.md")).unwrap();
        assert_eq!(stored, "# Who I am");
    }

    #[tokio::test]
    async fn paranoid_profile_gates_soul_writes() {
        let (h, dir) = handler(SecurityProfile::Paranoid);
        let result = h
            .write_identity(from_value(json!({
                "file": "soul",
                "content": "rewritten identity",
            }))
            .unwrap())
            .await
            .unwrap();

        assert_eq!(result["status"], "review");
        assert!(dir.path().join("review/soul.md").exists());
        assert!(!dir.path().join("soul.md").exists());
    }

    #[tokio::test]
    async fn paranoid_profile_still_writes_heartbeat_directly() {
        let (h, dir) = handler(SecurityProfile::Paranoid);
        let result = h
            .write_identity(from_value(json!({
                "file": "heartbeat",
                "content": "check email",
            }))
            .unwrap())
            .await
            .unwrap();

        assert_eq!(result["status"], "written");
        assert!(dir.path().join("heartbeat.md").exists());
    }

    #[tokio::test]
    async fn user_write_uses_user_file_names() {
        let (h, dir) = handler(SecurityProfile::Balanced);
        h.write_user(from_value(json!({
            "file": "user-bootstrap",
            "content": "prefs",
        }))
        .unwrap())
        .await
        .unwrap();
        assert!(dir.path().join("user-bootstrap.md").exists());
    }
}
