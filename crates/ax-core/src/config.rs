//! Configuration: a strict YAML schema.
//!
//! Unknown fields reject everywhere, every numeric field has a declared
//! range, and provider names must exist in the static registry. A config
//! that deserializes but fails [`Config::validate`] names the offending
//! field; nothing is silently clamped.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use ax_taint::SecurityProfile;

use crate::providers;

/// Configuration errors, surfaced verbatim at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("config field {field} out of range: {detail}")]
    Range {
        field: &'static str,
        detail: String,
    },

    #[error("unknown {kind} provider '{name}'")]
    UnknownProvider { kind: &'static str, name: String },
}

/// Built-in agent personalities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Assistant,
    Researcher,
    Operator,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Assistant => "assistant",
            AgentKind::Researcher => "researcher",
            AgentKind::Operator => "operator",
        }
    }
}

/// Provider selection per kind. Names are constrained to the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvidersConfig {
    pub llm: String,
    /// Ordered fallback candidates for the LLM router.
    #[serde(default)]
    pub llm_fallbacks: Vec<String>,
    pub channel: String,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub browser: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxConfig {
    pub timeout_sec: u64,
    pub memory_mb: u64,
    /// Image for the container back-end; enables it when present.
    #[serde(default)]
    pub container_image: Option<String>,
    /// Explicit opt-in to the unsandboxed subprocess fallback.
    #[serde(default)]
    pub allow_unsandboxed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActiveHours {
    /// `HH:MM`, inclusive start of the active window.
    pub start: String,
    /// `HH:MM`, exclusive end of the active window.
    pub end: String,
    /// `utc`, `local`, or a fixed offset like `+02:00`.
    pub timezone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    pub active_hours: ActiveHours,
    pub max_token_budget: u64,
    pub heartbeat_interval_min: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HistoryConfig {
    pub max_turns: u32,
    #[serde(default)]
    pub thread_context_turns: Option<u32>,
}

/// The root configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub agent: AgentKind,
    pub profile: SecurityProfile,
    pub providers: ProvidersConfig,
    /// Provider-specific channel settings, opaque to the core.
    #[serde(default)]
    pub channel_config: Option<BTreeMap<String, serde_yaml::Value>>,
    pub sandbox: SandboxConfig,
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub history: Option<HistoryConfig>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl Config {
    /// Read and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    /// Parse and validate a YAML document.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Range and registry checks beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=3600).contains(&self.sandbox.timeout_sec) {
            return Err(range("sandbox.timeout_sec", "must be 1..=3600", self.sandbox.timeout_sec));
        }
        if !(64..=8192).contains(&self.sandbox.memory_mb) {
            return Err(range("sandbox.memory_mb", "must be 64..=8192", self.sandbox.memory_mb));
        }
        if self.scheduler.max_token_budget < 1 {
            return Err(range(
                "scheduler.max_token_budget",
                "must be at least 1",
                self.scheduler.max_token_budget,
            ));
        }
        if self.scheduler.heartbeat_interval_min < 1 {
            return Err(range(
                "scheduler.heartbeat_interval_min",
                "must be at least 1",
                self.scheduler.heartbeat_interval_min,
            ));
        }

        check_hhmm("scheduler.active_hours.start", &self.scheduler.active_hours.start)?;
        check_hhmm("scheduler.active_hours.end", &self.scheduler.active_hours.end)?;
        check_timezone(&self.scheduler.active_hours.timezone)?;

        if let Some(history) = &self.history {
            if history.max_turns > 10_000 {
                return Err(range("history.max_turns", "must be 0..=10000", history.max_turns));
            }
            if let Some(turns) = history.thread_context_turns {
                if turns > 50 {
                    return Err(range(
                        "history.thread_context_turns",
                        "must be 0..=50",
                        turns,
                    ));
                }
            }
        }

        if let Some(max_tokens) = self.max_tokens {
            if !(256..=200_000).contains(&max_tokens) {
                return Err(range("max_tokens", "must be 256..=200000", max_tokens));
            }
        }

        providers::check_llm(&self.providers.llm)?;
        for fallback in &self.providers.llm_fallbacks {
            providers::check_llm(fallback)?;
        }
        providers::check_channel(&self.providers.channel)?;
        if let Some(search) = &self.providers.search {
            providers::check_search(search)?;
        }
        if let Some(browser) = &self.providers.browser {
            providers::check_browser(browser)?;
        }

        Ok(())
    }

    /// Default `max_tokens` for LLM calls; per-call overrides win.
    pub fn default_max_tokens(&self) -> u32 {
        self.max_tokens.unwrap_or(8192)
    }
}

fn range(
    field: &'static str,
    requirement: &str,
    value: impl std::fmt::Display,
) -> ConfigError {
    ConfigError::Range {
        field,
        detail: format!("{requirement} (got {value})"),
    }
}

/// `HH:MM` with real clock bounds, not just shape.
fn check_hhmm(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let valid = value
        .split_once(':')
        .and_then(|(h, m)| {
            if h.len() != 2 || m.len() != 2 {
                return None;
            }
            Some((h.parse::<u8>().ok()?, m.parse::<u8>().ok()?))
        })
        .map(|(h, m)| h < 24 && m < 60)
        .unwrap_or(false);

    if valid {
        Ok(())
    } else {
        Err(ConfigError::Range {
            field,
            detail: format!("must match HH:MM (got '{value}')"),
        })
    }
}

fn check_timezone(value: &str) -> Result<(), ConfigError> {
    if value == "utc" || value == "local" {
        return Ok(());
    }
    // Fixed offsets: +HH:MM or -HH:MM.
    let offset_ok = (value.starts_with('+') || value.starts_with('-'))
        && check_hhmm("scheduler.active_hours.timezone", &value[1..]).is_ok();
    if offset_ok {
        Ok(())
    } else {
        Err(ConfigError::Range {
            field: "scheduler.active_hours.timezone",
            detail: format!("must be 'utc', 'local', or a fixed offset (got '{value}')"),
        })
    }
}

/// A starter config for `ax configure`.
pub fn starter_config() -> Config {
    Config {
        agent: AgentKind::Assistant,
        profile: SecurityProfile::Balanced,
        providers: ProvidersConfig {
            llm: "anthropic".to_string(),
            llm_fallbacks: Vec::new(),
            channel: "cli".to_string(),
            search: None,
            browser: None,
        },
        channel_config: None,
        sandbox: SandboxConfig {
            timeout_sec: 300,
            memory_mb: 1024,
            container_image: None,
            allow_unsandboxed: false,
        },
        scheduler: SchedulerConfig {
            active_hours: ActiveHours {
                start: "08:00".to_string(),
                end: "22:00".to_string(),
                timezone: "utc".to_string(),
            },
            max_token_budget: 1_000_000,
            heartbeat_interval_min: 30,
        },
        history: None,
        max_tokens: None,
    }
}
