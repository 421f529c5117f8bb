pub mod claude;
pub mod crush;
pub mod droid;
pub mod gemini;
pub mod kilocode;
pub mod kimi;
pub mod opencode;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::GaleError;
use crate::models::ModelDescriptor;

/// Closed set of supported coding-assistant CLIs. Adding a CLI means
/// adding a variant here and registering a strategy for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CliKind {
    Claude,
    Opencode,
    Gemini,
    Droid,
    Crush,
    Kimi,
    Kilocode,
}

impl CliKind {
    pub const ALL: [CliKind; 7] = [
        CliKind::Claude,
        CliKind::Opencode,
        CliKind::Gemini,
        CliKind::Droid,
        CliKind::Crush,
        CliKind::Kimi,
        CliKind::Kilocode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CliKind::Claude => "claude",
            CliKind::Opencode => "opencode",
            CliKind::Gemini => "gemini",
            CliKind::Droid => "droid",
            CliKind::Crush => "crush",
            CliKind::Kimi => "kimi",
            CliKind::Kilocode => "kilocode",
        }
    }
}

impl fmt::Display for CliKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CliKind {
    type Err = GaleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "claude" => Ok(CliKind::Claude),
            "opencode" => Ok(CliKind::Opencode),
            "gemini" => Ok(CliKind::Gemini),
            "droid" => Ok(CliKind::Droid),
            "crush" => Ok(CliKind::Crush),
            "kimi" => Ok(CliKind::Kimi),
            "kilocode" => Ok(CliKind::Kilocode),
            other => Err(GaleError::Config {
                message: format!("unknown CLI kind: {other}"),
            }),
        }
    }
}

/// How the child process is allowed to act on the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Let the CLI use its own prompting/approval defaults.
    #[default]
    Prompt,
    /// Ask the CLI to skip interactive approvals (unattended runs).
    BypassApprovals,
}

/// Everything a strategy needs to shape one invocation.
pub struct InvocationSpec<'a> {
    pub descriptor: &'a ModelDescriptor,
    pub prompt: &'a str,
    /// Caller-supplied environment the invocation may read (e.g. to pass
    /// entries through). The runner separately merges the full process
    /// environment at spawn time.
    pub base_env: &'a HashMap<String, String>,
    pub permissions: PermissionMode,
}

/// Concrete recipe for one child-process invocation. `env` holds only
/// the overrides layered over the process environment; `args` and `env`
/// are opaque to the engine.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Prompt payload when this CLI reads it from stdin.
    pub stdin: Option<String>,
    pub display_name: String,
}

/// Per-CLI recipe: argument/env/stdin construction plus the output
/// signatures the classifier matches against. Strategies are stateless;
/// one instance serves every invocation.
pub trait CliStrategy: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> CliKind;

    /// Build the argument vector, env overrides, and stdin payload for
    /// one prompt. The single real decision per CLI is where the prompt
    /// goes: stdin, a final positional argument, or a `-p` flag.
    fn build(&self, spec: &InvocationSpec<'_>) -> Invocation;

    /// Compiled signatures of provider rate limiting in CLI output.
    fn rate_limit_patterns(&self) -> &[Regex] {
        &[]
    }

    /// Compiled signatures of exhausted quota/credits in CLI output.
    fn quota_patterns(&self) -> &[Regex] {
        &[]
    }

    /// Whether the combined output indicates a corrupt local cache that
    /// `clear_cache` can repair.
    fn detect_cache_corruption(&self, _output: &str) -> bool {
        false
    }

    /// Attempt to clear this CLI's local cache. Returns true when the
    /// cache was removed (or was already absent).
    fn clear_cache(&self) -> bool {
        false
    }
}

/// Registry of strategies keyed by [`CliKind`]. Tests may override a
/// kind with a stub strategy after construction.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: HashMap<CliKind, Arc<dyn CliStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All seven built-in strategies.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register(Arc::new(claude::ClaudeStrategy::new()));
        reg.register(Arc::new(opencode::OpencodeStrategy::new()));
        reg.register(Arc::new(gemini::GeminiStrategy::new()));
        reg.register(Arc::new(droid::DroidStrategy::new()));
        reg.register(Arc::new(crush::CrushStrategy::new()));
        reg.register(Arc::new(kimi::KimiStrategy::new()));
        reg.register(Arc::new(kilocode::KilocodeStrategy::new()));
        reg
    }

    pub fn register(&mut self, strategy: Arc<dyn CliStrategy>) {
        self.strategies.insert(strategy.kind(), strategy);
    }

    pub fn get(&self, kind: CliKind) -> Result<Arc<dyn CliStrategy>, GaleError> {
        self.strategies
            .get(&kind)
            .cloned()
            .ok_or_else(|| GaleError::NoStrategy {
                cli: kind.to_string(),
            })
    }

    pub fn has(&self, kind: CliKind) -> bool {
        self.strategies.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<CliKind> {
        let mut kinds: Vec<_> = self.strategies.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }
}

/// Shared display-name shape: `kind/model`.
pub(crate) fn display_name(kind: CliKind, descriptor: &ModelDescriptor) -> String {
    format!("{kind}/{}", descriptor.model)
}

/// Append the descriptor's extra args and merge its env overrides on top
/// of whatever the strategy produced. Descriptor entries win.
pub(crate) fn apply_descriptor_overrides(inv: &mut Invocation, descriptor: &ModelDescriptor) {
    inv.args.extend(descriptor.args.iter().cloned());
    for (k, v) in &descriptor.env {
        inv.env.insert(k.clone(), v.clone());
    }
}
