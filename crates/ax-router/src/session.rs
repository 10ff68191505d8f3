//! Session addresses.
//!
//! A session is named by where the conversation happens: a provider, a
//! scope, and the identifiers that pin it down (user id, channel id,
//! thread ts). Canonicalization sorts the identifiers so the same
//! conversation always maps to the same session row regardless of the
//! order a channel adapter supplies them.

use serde::{Deserialize, Serialize};

/// Conversation scope within a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Dm,
    Channel,
    Thread,
    Group,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Dm => "dm",
            Scope::Channel => "channel",
            Scope::Thread => "thread",
            Scope::Group => "group",
        }
    }
}

/// The canonical name of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAddress {
    pub provider: String,
    pub scope: Scope,
    pub identifiers: Vec<String>,
}

impl SessionAddress {
    pub fn new(
        provider: impl Into<String>,
        scope: Scope,
        identifiers: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            scope,
            identifiers: identifiers.into_iter().collect(),
        }
    }

    /// Address for a direct conversation with one counterpart.
    pub fn dm(provider: impl Into<String>, counterpart: impl Into<String>) -> Self {
        Self::new(provider, Scope::Dm, [counterpart.into()])
    }

    /// Stable string form: `provider:scope:id1:id2:...` with identifiers
    /// sorted.
    pub fn canonical(&self) -> String {
        let mut ids = self.identifiers.clone();
        ids.sort();
        let mut out = format!("{}:{}", self.provider, self.scope.as_str());
        for id in ids {
            out.push(':');
            out.push_str(&id);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_is_stable_under_id_order() {
        let a = SessionAddress::new("slack", Scope::Thread, ["C42".to_string(), "171.5".to_string()]);
        let b = SessionAddress::new("slack", Scope::Thread, ["171.5".to_string(), "C42".to_string()]);
        assert_eq!(a.canonical(), b.canonical());
    }

    #[test]
    fn different_scopes_differ() {
        let dm = SessionAddress::new("slack", Scope::Dm, ["U1".to_string()]);
        let group = SessionAddress::new("slack", Scope::Group, ["U1".to_string()]);
        assert_ne!(dm.canonical(), group.canonical());
    }

    #[test]
    fn dm_shorthand() {
        let address = SessionAddress::dm("cli", "local");
        assert_eq!(address.canonical(), "cli:dm:local");
    }
}
