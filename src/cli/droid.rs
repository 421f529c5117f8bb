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
    vec![Regex::new(r"(?i)(quota|usage) (limit|exceeded|exhausted)").expect("static regex")]
});

/// Prompt as the final positional argument of `droid exec`.
#[derive(Debug)]
pub struct DroidStrategy;

#[allow(clippy::new_without_default)]
impl DroidStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl CliStrategy for DroidStrategy {
    fn kind(&self) -> CliKind {
        CliKind::Droid
    }

    fn build(&self, spec: &InvocationSpec<'_>) -> Invocation {
        let mut args = vec![
            "exec".to_string(),
            "--model".to_string(),
            spec.descriptor.model.clone(),
        ];
        if spec.permissions == PermissionMode::BypassApprovals {
            args.push("--auto".to_string());
        }
        args.push(spec.prompt.to_string());

        let mut inv = Invocation {
            args,
            env: Default::default(),
            stdin: None,
            display_name: display_name(CliKind::Droid, spec.descriptor),
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
