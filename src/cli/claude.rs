use std::sync::LazyLock;

use regex::Regex;

use crate::cli::{
    apply_descriptor_overrides, display_name, CliKind, CliStrategy, Invocation, InvocationSpec,
    PermissionMode,
};

/// Rate-limit signatures seen in Claude CLI output. Claude surfaces both
/// bare HTTP 429s and the API's structured overloaded error.
static RATE_LIMIT: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)rate[ _-]?limit").expect("static regex"),
        Regex::new(r"\b429\b").expect("static regex"),
        Regex::new(r"(?i)overloaded_error").expect("static regex"),
        Regex::new(r"(?i)too many requests").expect("static regex"),
    ]
});

static QUOTA: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)usage limit reached").expect("static regex"),
        Regex::new(r"(?i)credit balance is too low").expect("static regex"),
        Regex::new(r"(?i)quota.{0,40}exceeded").expect("static regex"),
    ]
});

/// Prompt via `-p`; model via `--model`.
#[derive(Debug)]
pub struct ClaudeStrategy;

#[allow(clippy::new_without_default)]
impl ClaudeStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl CliStrategy for ClaudeStrategy {
    fn kind(&self) -> CliKind {
        CliKind::Claude
    }

    fn build(&self, spec: &InvocationSpec<'_>) -> Invocation {
        let mut args = vec![
            "-p".to_string(),
            spec.prompt.to_string(),
            "--model".to_string(),
            spec.descriptor.model.clone(),
            "--output-format".to_string(),
            "text".to_string(),
        ];
        if spec.permissions == PermissionMode::BypassApprovals {
            args.push("--dangerously-skip-permissions".to_string());
        }

        let mut inv = Invocation {
            args,
            env: Default::default(),
            stdin: None,
            display_name: display_name(CliKind::Claude, spec.descriptor),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ModelDescriptor;
    use std::collections::HashMap;

    #[test]
    fn prompt_travels_via_p_flag() {
        let desc = ModelDescriptor::new("claude-sonnet", CliKind::Claude, "sonnet");
        let env = HashMap::new();
        let inv = ClaudeStrategy::new().build(&InvocationSpec {
            descriptor: &desc,
            prompt: "do the thing",
            base_env: &env,
            permissions: PermissionMode::Prompt,
        });

        assert_eq!(inv.args[0], "-p");
        assert_eq!(inv.args[1], "do the thing");
        assert!(inv.stdin.is_none());
        assert!(!inv.args.contains(&"--dangerously-skip-permissions".to_string()));
        assert_eq!(inv.display_name, "claude/sonnet");
    }

    #[test]
    fn bypass_mode_skips_permission_prompts() {
        let desc = ModelDescriptor::new("claude-sonnet", CliKind::Claude, "sonnet");
        let env = HashMap::new();
        let inv = ClaudeStrategy::new().build(&InvocationSpec {
            descriptor: &desc,
            prompt: "x",
            base_env: &env,
            permissions: PermissionMode::BypassApprovals,
        });
        assert!(inv.args.contains(&"--dangerously-skip-permissions".to_string()));
    }

    #[test]
    fn recognizes_rate_limit_output() {
        let s = ClaudeStrategy::new();
        assert!(s.rate_limit_patterns().iter().any(|r| r.is_match("HTTP 429")));
        assert!(s
            .quota_patterns()
            .iter()
            .any(|r| r.is_match("Your credit balance is too low")));
    }
}
