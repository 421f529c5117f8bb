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
    ]
});

static QUOTA: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![Regex::new(r"(?i)(quota|credits?).{0,40}(exceeded|exhausted|depleted)")
        .expect("static regex")]
});

/// Prompt via `-p`; model via `--model`.
#[derive(Debug)]
pub struct KilocodeStrategy;

#[allow(clippy::new_without_default)]
impl KilocodeStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl CliStrategy for KilocodeStrategy {
    fn kind(&self) -> CliKind {
        CliKind::Kilocode
    }

    fn build(&self, spec: &InvocationSpec<'_>) -> Invocation {
        let mut args = vec![
            "--model".to_string(),
            spec.descriptor.model.clone(),
            "-p".to_string(),
            spec.prompt.to_string(),
        ];
        if spec.permissions == PermissionMode::BypassApprovals {
            args.push("--auto-approve".to_string());
        }

        let mut inv = Invocation {
            args,
            env: Default::default(),
            stdin: None,
            display_name: display_name(CliKind::Kilocode, spec.descriptor),
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
