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
        Regex::new(r"(?i)engine overloaded").expect("static regex"),
    ]
});

static QUOTA: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![Regex::new(r"(?i)(quota|balance).{0,40}(exceeded|exhausted|insufficient)")
        .expect("static regex")]
});

/// Prompt on stdin; model via `--model`.
#[derive(Debug)]
pub struct KimiStrategy;

#[allow(clippy::new_without_default)]
impl KimiStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl CliStrategy for KimiStrategy {
    fn kind(&self) -> CliKind {
        CliKind::Kimi
    }

    fn build(&self, spec: &InvocationSpec<'_>) -> Invocation {
        let mut args = vec!["--model".to_string(), spec.descriptor.model.clone()];
        if spec.permissions == PermissionMode::BypassApprovals {
            args.push("--no-confirm".to_string());
        }

        let mut inv = Invocation {
            args,
            env: Default::default(),
            stdin: Some(spec.prompt.to_string()),
            display_name: display_name(CliKind::Kimi, spec.descriptor),
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
}
