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
    vec![Regex::new(r"(?i)(quota|credit).{0,40}(exceeded|exhausted|too low)").expect("static regex")]
});

/// Prompt as the final positional argument of `crush run -q`.
#[derive(Debug)]
pub struct CrushStrategy;

#[allow(clippy::new_without_default)]
impl CrushStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl CliStrategy for CrushStrategy {
    fn kind(&self) -> CliKind {
        CliKind::Crush
    }

    fn build(&self, spec: &InvocationSpec<'_>) -> Invocation {
        let mut args = vec!["run".to_string(), "-q".to_string()];
        if spec.permissions == PermissionMode::BypassApprovals {
            args.push("--yolo".to_string());
        }
        args.push(spec.prompt.to_string());

        let mut inv = Invocation {
            args,
            // crush picks its model from config; the descriptor's model
            // string rides in as an env hint its config can reference.
            env: [("CRUSH_MODEL".to_string(), spec.descriptor.model.clone())]
                .into_iter()
                .collect(),
            stdin: None,
            display_name: display_name(CliKind::Crush, spec.descriptor),
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
