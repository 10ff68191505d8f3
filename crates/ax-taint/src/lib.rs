//! # Trust/Taint Engine
//!
//! Classifies every byte that crosses the host boundary as internal or
//! external, keeps a per-session tainted-token ratio, and gates sensitive
//! actions on that ratio.
//!
//! ## Threat Model
//!
//! An agent that has read a poisoned web page is more likely to be executing
//! attacker instructions than one that has only seen its own identity files.
//! The taint ratio is a cheap proxy for that risk: the fraction of the
//! session's context that originated outside the host. When the ratio rises
//! past the profile threshold, actions that could exfiltrate data or persist
//! decisions are denied until the user explicitly overrides.
//!
//! ## Accounting
//!
//! Tokens are estimated as `ceil(bytes / 4)`. This is deliberately crude: it
//! is monotonic in content size, identical for every model, and costs nothing
//! at the boundary. Swapping in a real tokenizer would silently move the
//! thresholds per model.
//!
//! ## Check Algorithm
//!
//! For a sensitive action in a session:
//!
//! 1. Action not in the sensitive set: allow.
//! 2. Session has no recorded tokens: allow.
//! 3. Session has a user override for the action: allow.
//! 4. `tainted / total > threshold`: deny with ratio and threshold.
//! 5. Otherwise allow. A ratio exactly at the threshold allows.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Where a datum came from, relative to the host boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    /// Produced by the host or its operator.
    Internal,
    /// Crossed the boundary from outside: channel payloads, web content,
    /// browser snapshots, search results, memory written as tainted.
    External,
}

/// Provenance label attached to data of external origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaintTag {
    /// Origin description, e.g. `web_fetch:example.com` or `channel:cli`.
    pub source: String,
    pub trust: TrustLevel,
    pub timestamp: DateTime<Utc>,
}

impl TaintTag {
    /// Tag for externally sourced content.
    pub fn external(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            trust: TrustLevel::External,
            timestamp: Utc::now(),
        }
    }
}

/// Named security posture binding a taint threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityProfile {
    /// Deny sensitive actions once 10% of session tokens are tainted.
    Paranoid,
    /// Default posture, 30%.
    Balanced,
    /// Power-user posture, 60%.
    Yolo,
}

impl SecurityProfile {
    /// The tainted-token ratio above which sensitive actions are denied.
    pub fn taint_threshold(&self) -> f64 {
        match self {
            SecurityProfile::Paranoid => 0.10,
            SecurityProfile::Balanced => 0.30,
            SecurityProfile::Yolo => 0.60,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProfile::Paranoid => "paranoid",
            SecurityProfile::Balanced => "balanced",
            SecurityProfile::Yolo => "yolo",
        }
    }
}

/// Actions gated by the taint ratio when no override exists.
///
/// The set is closed: extending it is a deployment decision made at engine
/// construction, never at runtime.
pub const DEFAULT_SENSITIVE_ACTIONS: &[&str] = &[
    "oauth_credential_use",
    "skill_propose",
    "browser_navigate",
    "scheduler_add",
];

/// Estimate the token count of a piece of content as `ceil(bytes / 4)`.
pub fn estimate_tokens(content: &str) -> u64 {
    (content.len() as u64).div_ceil(4)
}

/// Outcome of a sensitive-action check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaintDecision {
    Allowed,
    Denied {
        action: String,
        ratio: f64,
        threshold: f64,
    },
}

impl TaintDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, TaintDecision::Allowed)
    }

    /// Structured reason string surfaced to the caller on denial.
    pub fn reason(&self) -> Option<String> {
        match self {
            TaintDecision::Allowed => None,
            TaintDecision::Denied {
                action,
                ratio,
                threshold,
            } => Some(format!(
                "Blocked by taint policy: '{}' denied at {:.1}% session taint (threshold {:.0}%)",
                action,
                ratio * 100.0,
                threshold * 100.0
            )),
        }
    }
}

/// Point-in-time view of a session's taint counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaintSnapshot {
    pub total_tokens: u64,
    pub tainted_tokens: u64,
    pub ratio: f64,
}

#[derive(Debug, Default)]
struct SessionState {
    total_tokens: u64,
    tainted_tokens: u64,
    overrides: HashSet<String>,
}

impl SessionState {
    fn ratio(&self) -> f64 {
        if self.total_tokens == 0 {
            0.0
        } else {
            self.tainted_tokens as f64 / self.total_tokens as f64
        }
    }
}

/// Per-session taint accounting and the sensitive-action gate.
///
/// Sessions are sharded behind their own mutexes so updates are linearizable
/// per session and cheap: every operation is O(1).
pub struct TaintEngine {
    profile: SecurityProfile,
    sensitive: HashSet<String>,
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionState>>>>,
}

impl TaintEngine {
    /// Engine with the default sensitive-action set.
    pub fn new(profile: SecurityProfile) -> Self {
        Self::with_sensitive_actions(
            profile,
            DEFAULT_SENSITIVE_ACTIONS.iter().map(|s| s.to_string()),
        )
    }

    /// Engine with a deployment-supplied sensitive-action set. The set is
    /// fixed for the engine's lifetime.
    pub fn with_sensitive_actions(
        profile: SecurityProfile,
        actions: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            profile,
            sensitive: actions.into_iter().collect(),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn profile(&self) -> SecurityProfile {
        self.profile
    }

    pub fn is_sensitive(&self, action: &str) -> bool {
        self.sensitive.contains(action)
    }

    fn session(&self, session_id: &str) -> Arc<Mutex<SessionState>> {
        if let Some(state) = self.sessions.read().get(session_id) {
            return Arc::clone(state);
        }
        let mut map = self.sessions.write();
        Arc::clone(map.entry(session_id.to_string()).or_default())
    }

    /// Record content flowing into a session, classified by trust level.
    pub fn record(&self, session_id: &str, content: &str, trust: TrustLevel) {
        self.record_tokens(session_id, estimate_tokens(content), trust);
    }

    /// Record a pre-computed token count.
    pub fn record_tokens(&self, session_id: &str, tokens: u64, trust: TrustLevel) {
        let state = self.session(session_id);
        let mut state = state.lock();
        state.total_tokens += tokens;
        if trust == TrustLevel::External {
            state.tainted_tokens += tokens;
        }
        debug!(
            session = session_id,
            tokens,
            trust = ?trust,
            ratio = state.ratio(),
            "taint recorded"
        );
    }

    /// Current tainted/total ratio for a session, 0.0 when nothing recorded.
    pub fn ratio(&self, session_id: &str) -> f64 {
        self.session(session_id).lock().ratio()
    }

    /// Counter snapshot for prompt assembly and diagnostics.
    pub fn snapshot(&self, session_id: &str) -> TaintSnapshot {
        let state = self.session(session_id);
        let state = state.lock();
        TaintSnapshot {
            total_tokens: state.total_tokens,
            tainted_tokens: state.tainted_tokens,
            ratio: state.ratio(),
        }
    }

    /// Grant a session-scoped override for one action.
    pub fn grant_override(&self, session_id: &str, action: &str) {
        let state = self.session(session_id);
        state.lock().overrides.insert(action.to_string());
    }

    /// Gate a candidate action for a session. See the module docs for the
    /// exact algorithm; a ratio exactly at the threshold allows.
    pub fn check(&self, session_id: &str, action: &str) -> TaintDecision {
        if !self.sensitive.contains(action) {
            return TaintDecision::Allowed;
        }

        let state = self.session(session_id);
        let state = state.lock();

        if state.total_tokens == 0 {
            return TaintDecision::Allowed;
        }
        if state.overrides.contains(action) {
            return TaintDecision::Allowed;
        }

        let ratio = state.ratio();
        let threshold = self.profile.taint_threshold();
        if ratio > threshold {
            TaintDecision::Denied {
                action: action.to_string(),
                ratio,
                threshold,
            }
        } else {
            TaintDecision::Allowed
        }
    }
}
