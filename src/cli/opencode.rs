use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

use crate::cli::{
    apply_descriptor_overrides, display_name, CliKind, CliStrategy, Invocation, InvocationSpec,
    PermissionMode,
};

/// Environment key opencode reads for its permission policy. Passed
/// through from the parent environment when present.
pub const OPENCODE_PERMISSION_ENV: &str = "OPENCODE_PERMISSION";

static RATE_LIMIT: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)rate[ _-]?limit").expect("static regex"),
        Regex::new(r"\b429\b").expect("static regex"),
    ]
});

static QUOTA: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)quota.{0,40}(exceeded|exhausted)").expect("static regex"),
        Regex::new(r"(?i)insufficient[ _-]?(credits|quota)").expect("static regex"),
        Regex::new(r"(?i)payment required").expect("static regex"),
    ]
});

/// opencode bundles node modules under its cache directory; a partial
/// upgrade leaves dangling requires that surface as ENOENT or
/// MODULE_NOT_FOUND against that path.
static CACHE_CORRUPTION: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"ENOENT.{0,200}\.cache/opencode").expect("static regex"),
        Regex::new(r"MODULE_NOT_FOUND.{0,200}opencode").expect("static regex"),
        Regex::new(r"Cannot find module.{0,200}\.cache/opencode").expect("static regex"),
    ]
});

/// Prompt as the final positional argument of `opencode run`.
#[derive(Debug)]
pub struct OpencodeStrategy {
    cache_dir: PathBuf,
}

#[allow(clippy::new_without_default)]
impl OpencodeStrategy {
    pub fn new() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self {
            cache_dir: PathBuf::from(home).join(".cache/opencode/node_modules"),
        }
    }

    /// Test affordance: point cache clearing at a scratch directory.
    pub fn with_cache_dir(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }
}

impl CliStrategy for OpencodeStrategy {
    fn kind(&self) -> CliKind {
        CliKind::Opencode
    }

    fn build(&self, spec: &InvocationSpec<'_>) -> Invocation {
        let args = vec![
            "run".to_string(),
            "--model".to_string(),
            spec.descriptor.model.clone(),
            spec.prompt.to_string(),
        ];

        let mut env = std::collections::HashMap::new();
        // Explicit passthrough: opencode honors OPENCODE_PERMISSION and
        // the engine treats env as opaque otherwise.
        if let Some(value) = spec.base_env.get(OPENCODE_PERMISSION_ENV) {
            env.insert(OPENCODE_PERMISSION_ENV.to_string(), value.clone());
        } else if spec.permissions == PermissionMode::BypassApprovals {
            env.insert(
                OPENCODE_PERMISSION_ENV.to_string(),
                r#"{"bash":"allow","edit":"allow","webfetch":"allow"}"#.to_string(),
            );
        }

        let mut inv = Invocation {
            args,
            env,
            stdin: None,
            display_name: display_name(CliKind::Opencode, spec.descriptor),
        };
        apply_descriptor_overrides(&mut inv, spec.descriptor);
        inv
    }

    fn rate_limit_patterns(&self) -> &[Regex] {
        &RATE_LIMIT
    }

    fn quota_patterns(&self) -> &[Regex] {
        &QUOTA
    }

    fn detect_cache_corruption(&self, output: &str) -> bool {
        CACHE_CORRUPTION.iter().any(|r| r.is_match(output))
    }

    fn clear_cache(&self) -> bool {
        match std::fs::remove_dir_all(&self.cache_dir) {
            Ok(()) => {
                tracing::info!(dir = %self.cache_dir.display(), "cleared opencode cache");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                tracing::warn!(dir = %self.cache_dir.display(), "cache clear failed: {e}");
                false
            }
        }
    }
}
