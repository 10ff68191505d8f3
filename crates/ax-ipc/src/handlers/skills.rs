//! Skill actions: read, list, propose.
//!
//! Skills are markdown files under the skills root; all file access goes
//! through the path kernel. A proposed skill is screened for capability
//! markers: plain instructions auto-approve into the live directory,
//! anything that asks for shell, network, or credential capabilities is
//! parked in `pending/` for human review.

use serde_json::{json, Value};
use std::path::PathBuf;

use crate::schema::{SkillNameParams, SkillProposeParams};
use crate::{IpcError, Result};

/// Subdirectory where review-gated proposals wait.
const PENDING_DIR: &str = "pending";

/// Capability markers that force human review. Matching is intentionally
/// coarse: a false positive costs one review, a false negative grants a
/// capability.
const CAPABILITY_MARKERS: &[(&str, &str)] = &[
    ("shell", "exec("),
    ("shell", "subprocess"),
    ("shell", "os.system"),
    ("shell", "#!/"),
    ("shell", "bash -c"),
    ("network", "http://"),
    ("network", "https://"),
    ("network", "curl "),
    ("network", "fetch("),
    ("credentials", "api_key"),
    ("credentials", "api key"),
    ("credentials", "password"),
    ("credentials", "secret"),
    ("credentials", "token"),
];

pub struct SkillsHandler {
    root: PathBuf,
}

impl SkillsHandler {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn read(&self, params: SkillNameParams) -> Result<Value> {
        let path = ax_pathsafe::constrain(&self.root, &[format!("{}.md", params.name)])?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| IpcError::Validation(format!("unknown skill '{}'", params.name)))?;
        Ok(json!({ "name": params.name, "content": content }))
    }

    pub async fn list(&self) -> Result<Value> {
        let mut names = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(json!({ "skills": [] }));
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("md") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(json!({ "skills": names }))
    }

    pub async fn propose(&self, params: SkillProposeParams) -> Result<Value> {
        let markers = screen_content(&params.content);
        let file_name = format!("{}.md", params.name);

        if markers.is_empty() {
            let path = ax_pathsafe::constrain(&self.root, &[file_name])?;
            tokio::fs::write(&path, &params.content).await?;
            Ok(json!({ "name": params.name, "status": "approved" }))
        } else {
            let pending = self.root.join(PENDING_DIR);
            tokio::fs::create_dir_all(&pending).await?;
            let path = ax_pathsafe::constrain(&pending, &[file_name])?;
            tokio::fs::write(&path, &params.content).await?;
            Ok(json!({
                "name": params.name,
                "status": "review",
                "capabilities": markers,
            }))
        }
    }
}

/// Capability categories present in skill content, deduplicated.
pub fn screen_content(content: &str) -> Vec<&'static str> {
    let lower = content.to_lowercase();
    let mut found = Vec::new();
    for (category, marker) in CAPABILITY_MARKERS {
        if lower.contains(marker) && !found.contains(category) {
            found.push(*category);
        }
    }
    found
}
