use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cli::CliStrategy;
use crate::runner::RunOutcome;

/// Label for one finished CLI run. First matching rule wins; ambiguous
/// output is `Failure`; classification never errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Success,
    RateLimited,
    QuotaExhausted,
    CacheCorrupt,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::RateLimited => "rate-limited",
            Outcome::QuotaExhausted => "quota-exhausted",
            Outcome::CacheCorrupt => "cache-corrupt",
            Outcome::Failure => "failure",
        }
    }
}

/// Best-effort token accounting parsed from free-form CLI output.
/// Extraction never changes the outcome label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
    pub tool_calls: Option<u64>,
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub outcome: Outcome,
    pub metrics: RunMetrics,
}

static TOKENS_IN: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)input tokens?:\s*(\d+)").expect("static regex"),
        Regex::new(r"(?i)prompt tokens?:\s*(\d+)").expect("static regex"),
        Regex::new(r"(?i)Tokens:\s*(\d+)\s*input").expect("static regex"),
    ]
});

static TOKENS_OUT: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)output tokens?:\s*(\d+)").expect("static regex"),
        Regex::new(r"(?i)completion tokens?:\s*(\d+)").expect("static regex"),
        Regex::new(r"(?i)Tokens:\s*(\d+)\s*output").expect("static regex"),
    ]
});

static TOOL_CALLS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)tool calls?:\s*(\d+)").expect("static regex"));

static TOTAL_TOKENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)tokens?(?: used)?:\s*(\d+)").expect("static regex"));

/// Label one finished run against its strategy's output signatures.
///
/// Order: cache corruption, rate limit, quota, then plain success
/// (`exit == 0` with non-whitespace stdout), else failure.
pub fn classify(outcome: &RunOutcome, strategy: &dyn CliStrategy) -> Classification {
    let combined = outcome.combined_output();
    let metrics = extract_metrics(&combined);

    let label = if strategy.detect_cache_corruption(&combined) {
        Outcome::CacheCorrupt
    } else if strategy.rate_limit_patterns().iter().any(|r| r.is_match(&combined)) {
        Outcome::RateLimited
    } else if strategy.quota_patterns().iter().any(|r| r.is_match(&combined)) {
        Outcome::QuotaExhausted
    } else if outcome.exit_code == 0 && !outcome.stdout.trim().is_empty() {
        Outcome::Success
    } else {
        Outcome::Failure
    };

    Classification {
        outcome: label,
        metrics,
    }
}

/// Pull token counts out of the combined output. First match per family
/// wins; `total_tokens` prefers the in+out sum over a reported total.
pub fn extract_metrics(combined: &str) -> RunMetrics {
    let tokens_in = first_capture(&TOKENS_IN, combined);
    let tokens_out = first_capture(&TOKENS_OUT, combined);
    let tool_calls = capture_u64(&TOOL_CALLS, combined);

    let total_tokens = match (tokens_in, tokens_out) {
        (Some(i), Some(o)) => Some(i + o),
        _ => capture_u64(&TOTAL_TOKENS, combined),
    };

    RunMetrics {
        tokens_in,
        tokens_out,
        tool_calls,
        total_tokens,
    }
}

fn first_capture(patterns: &[Regex], text: &str) -> Option<u64> {
    patterns.iter().find_map(|r| capture_u64(r, text))
}

fn capture_u64(pattern: &Regex, text: &str) -> Option<u64> {
    pattern
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
