//! The static provider registry.
//!
//! Configuration may reference only names listed here, and nothing else
//! influences provider loading: no paths, no dynamic lookup, no plugin
//! discovery. Adding a provider is a code change that adds a variant and
//! its constructor arm.

use crate::config::ConfigError;

/// LLM providers the router can drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProvider {
    Anthropic,
}

impl LlmProvider {
    pub fn from_name(name: &str) -> Option<Self> {
        // Candidate ids may carry a model suffix: `anthropic/model-name`.
        let provider = name.split_once('/').map(|(p, _)| p).unwrap_or(name);
        match provider {
            "anthropic" => Some(LlmProvider::Anthropic),
            _ => None,
        }
    }
}

/// Channel providers the supervisor can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelProvider {
    Cli,
}

impl ChannelProvider {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "cli" => Some(ChannelProvider::Cli),
            _ => None,
        }
    }
}

/// Search providers the web handler can query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchProvider {
    Brave,
}

impl SearchProvider {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "brave" => Some(SearchProvider::Brave),
            _ => None,
        }
    }
}

/// Browser drivers the browser handler can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserProvider {
    Headless,
}

impl BrowserProvider {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "headless" => Some(BrowserProvider::Headless),
            _ => None,
        }
    }
}

pub fn check_llm(name: &str) -> Result<(), ConfigError> {
    LlmProvider::from_name(name)
        .map(|_| ())
        .ok_or_else(|| ConfigError::UnknownProvider {
            kind: "llm",
            name: name.to_string(),
        })
}

pub fn check_channel(name: &str) -> Result<(), ConfigError> {
    ChannelProvider::from_name(name)
        .map(|_| ())
        .ok_or_else(|| ConfigError::UnknownProvider {
            kind: "channel",
            name: name.to_string(),
        })
}

pub fn check_search(name: &str) -> Result<(), ConfigError> {
    SearchProvider::from_name(name)
        .map(|_| ())
        .ok_or_else(|| ConfigError::UnknownProvider {
            kind: "search",
            name: name.to_string(),
        })
}

pub fn check_browser(name: &str) -> Result<(), ConfigError> {
    BrowserProvider::from_name(name)
        .map(|_| ())
        .ok_or_else(|| ConfigError::UnknownProvider {
            kind: "browser",
            name: name.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_names_resolve() {
        assert_eq!(LlmProvider::from_name("anthropic"), Some(LlmProvider::Anthropic));
        assert_eq!(
            LlmProvider::from_name("anthropic/some-model"),
            Some(LlmProvider::Anthropic)
        );
        assert_eq!(ChannelProvider::from_name("cli"), Some(ChannelProvider::Cli));
    }

    #[test]
    fn unknown_names_do_not_resolve() {
        assert!(LlmProvider::from_name("../../evil").is_none());
        assert!(ChannelProvider::from_name("").is_none());
        assert!(SearchProvider::from_name("google").is_none());
    }

    #[test]
    fn checks_produce_named_errors() {
        let err = check_llm("mystery").unwrap_err();
        assert!(err.to_string().contains("mystery"));
        assert!(err.to_string().contains("llm"));
    }
}
