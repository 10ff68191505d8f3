//! Prompt assembly.
//!
//! The system prompt is built from registered modules, ordered by priority
//! ascending, under a token budget of
//! `context_window - history_tokens - output_reserve`. Required modules
//! are always emitted. Optional modules are added in priority order while
//! their full estimate fits; a module whose full rendering does not fit
//! may offer a minimal rendering instead; otherwise it is dropped.
//!
//! Assembly is a pure function of the context snapshot: identical context
//! produces identical bytes, which keeps prompts diffable across runs.

pub mod modules;

use ax_taint::SecurityProfile;

/// Tokens held back for the model's own output.
const OUTPUT_RESERVE: u32 = 4096;

/// Per-agent identity file contents, loaded by the supervisor.
#[derive(Debug, Clone, Default)]
pub struct IdentityFiles {
    pub bootstrap: Option<String>,
    pub soul: Option<String>,
    pub identity: Option<String>,
    pub user: Option<String>,
    pub user_bootstrap: Option<String>,
    pub agents: Option<String>,
    pub heartbeat: Option<String>,
}

/// Snapshot handed to every module.
#[derive(Debug, Clone)]
pub struct PromptContext {
    pub agent_type: String,
    pub sandbox_type: String,
    pub profile: SecurityProfile,
    /// Workspace path as the host knows it; the runtime module sanitizes
    /// it before rendering.
    pub workspace_path: String,
    pub skills: Vec<String>,
    pub identity: IdentityFiles,
    pub taint_ratio: f64,
    pub taint_threshold: f64,
    pub context_window: u32,
    pub history_tokens: u32,
    /// Set when the host marks replying optional for this exchange.
    pub reply_optional: bool,
}

impl PromptContext {
    /// Bootstrap mode: a bootstrap script exists but no soul does. The
    /// agent's only job is identity discovery.
    pub fn bootstrap_mode(&self) -> bool {
        self.identity.soul.is_none() && self.identity.bootstrap.is_some()
    }

    /// Elevated injection defense: the session is past its taint
    /// threshold.
    pub fn taint_elevated(&self) -> bool {
        self.taint_ratio > self.taint_threshold
    }
}

/// One prompt module.
pub trait PromptModule: Send + Sync {
    fn name(&self) -> &'static str;

    /// Ordering key, 0..=100 ascending.
    fn priority(&self) -> u8;

    /// Optional modules compete for the budget; required ones are always
    /// emitted.
    fn optional(&self) -> bool;

    fn should_include(&self, ctx: &PromptContext) -> bool;

    fn render(&self, ctx: &PromptContext) -> Vec<String>;

    /// Token cost of the full rendering. The default estimates from the
    /// rendered bytes.
    fn estimate_tokens(&self, ctx: &PromptContext) -> u32 {
        let bytes: usize = self.render(ctx).iter().map(|l| l.len() + 1).sum();
        (bytes as u32).div_ceil(4)
    }

    /// Reduced rendering used when the full one does not fit. `None`
    /// means the module is dropped instead.
    fn render_minimal(&self, _ctx: &PromptContext) -> Option<Vec<String>> {
        None
    }
}

/// Assembles the prompt from its registered modules.
pub struct PromptAssembler {
    modules: Vec<Box<dyn PromptModule>>,
}

impl PromptAssembler {
    /// Assembler with the standard module set.
    pub fn standard() -> Self {
        Self::with_modules(modules::standard_set())
    }

    pub fn with_modules(mut modules: Vec<Box<dyn PromptModule>>) -> Self {
        // Stable sort: equal priorities keep registration order.
        modules.sort_by_key(|m| m.priority());
        Self { modules }
    }

    /// Build the prompt for one context snapshot.
    pub fn assemble(&self, ctx: &PromptContext) -> String {
        let mut budget = ctx
            .context_window
            .saturating_sub(ctx.history_tokens)
            .saturating_sub(OUTPUT_RESERVE);

        let mut sections: Vec<Vec<String>> = Vec::new();

        for module in &self.modules {
            if !module.should_include(ctx) {
                continue;
            }

            if !module.optional() {
                // Required modules are emitted regardless; their cost still
                // draws down the budget the optional ones compete for.
                let lines = module.render(ctx);
                budget = budget.saturating_sub(module.estimate_tokens(ctx));
                sections.push(lines);
                continue;
            }

            let full_cost = module.estimate_tokens(ctx);
            if full_cost <= budget {
                sections.push(module.render(ctx));
                budget -= full_cost;
                continue;
            }

            if let Some(minimal) = module.render_minimal(ctx) {
                let minimal_cost = estimate_lines(&minimal);
                if minimal_cost <= budget {
                    budget -= minimal_cost;
                    sections.push(minimal);
                }
            }
            // Otherwise dropped.
        }

        let mut lines: Vec<String> = Vec::new();
        for (index, section) in sections.iter().enumerate() {
            if index > 0 {
                lines.push(String::new());
            }
            lines.extend(section.iter().cloned());
        }
        lines.join("\n")
    }
}

pub(crate) fn estimate_lines(lines: &[String]) -> u32 {
    let bytes: usize = lines.iter().map(|l| l.len() + 1).sum();
    (bytes as u32).div_ceil(4)
}
