use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

use crate::cli::{
    apply_descriptor_overrides, display_name, CliKind, CliStrategy, Invocation, InvocationSpec,
    PermissionMode,
};

static RATE_LIMIT: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"\b429\b").expect("static regex"),
        Regex::new(r"(?i)rate[ _-]?limit").expect("static regex"),
        Regex::new(r"RESOURCE_EXHAUSTED").expect("static regex"),
    ]
});

static QUOTA: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)quota exceeded").expect("static regex"),
        Regex::new(r"(?i)daily limit").expect("static regex"),
    ]
});

static CACHE_CORRUPTION: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"ENOENT.{0,200}\.gemini").expect("static regex"),
        Regex::new(r"Cannot find module.{0,200}gemini").expect("static regex"),
    ]
});

/// Prompt on stdin; model via `-m`.
#[derive(Debug)]
pub struct GeminiStrategy {
    cache_dir: PathBuf,
}

#[allow(clippy::new_without_default)]
impl GeminiStrategy {
    pub fn new() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self {
            cache_dir: PathBuf::from(home).join(".gemini/tmp"),
        }
    }

    pub fn with_cache_dir(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }
}

impl CliStrategy for GeminiStrategy {
    fn kind(&self) -> CliKind {
        CliKind::Gemini
    }

    fn build(&self, spec: &InvocationSpec<'_>) -> Invocation {
        let mut args = vec!["-m".to_string(), spec.descriptor.model.clone()];
        if spec.permissions == PermissionMode::BypassApprovals {
            args.push("--yolo".to_string());
        }

        let mut inv = Invocation {
            args,
            env: Default::default(),
            stdin: Some(spec.prompt.to_string()),
            display_name: display_name(CliKind::Gemini, spec.descriptor),
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
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                tracing::warn!(dir = %self.cache_dir.display(), "cache clear failed: {e}");
                false
            }
        }
    }
}
