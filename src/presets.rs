//! Canned model descriptors. Each preset is a pure function returning a
//! fresh descriptor; pass [`Overrides`] to adjust the common knobs
//! without rebuilding the record by hand.

use crate::cli::CliKind;
use crate::models::ModelDescriptor;

/// Shallow overrides merged onto a preset descriptor. Only set fields
/// replace the preset's values.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub timeout_ms: Option<u64>,
    pub cost_weight: Option<f64>,
    pub enabled: Option<bool>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

fn merge(mut desc: ModelDescriptor, overrides: Option<Overrides>) -> ModelDescriptor {
    let Some(o) = overrides else {
        return desc;
    };
    if o.timeout_ms.is_some() {
        desc.timeout_ms = o.timeout_ms;
    }
    if o.cost_weight.is_some() {
        desc.cost_weight = o.cost_weight;
    }
    if let Some(enabled) = o.enabled {
        desc.enabled = enabled;
    }
    if o.temperature.is_some() {
        desc.temperature = o.temperature;
    }
    if o.max_tokens.is_some() {
        desc.max_tokens = o.max_tokens;
    }
    desc
}

pub fn claude_sonnet(overrides: Option<Overrides>) -> ModelDescriptor {
    merge(
        ModelDescriptor::new("claude-sonnet", CliKind::Claude, "sonnet").with_cost_weight(3.0),
        overrides,
    )
}

pub fn claude_haiku(overrides: Option<Overrides>) -> ModelDescriptor {
    merge(
        ModelDescriptor::new("claude-haiku", CliKind::Claude, "haiku").with_cost_weight(1.0),
        overrides,
    )
}

pub fn claude_opus(overrides: Option<Overrides>) -> ModelDescriptor {
    merge(
        ModelDescriptor::new("claude-opus", CliKind::Claude, "opus").with_cost_weight(15.0),
        overrides,
    )
}

pub fn gemini_flash(overrides: Option<Overrides>) -> ModelDescriptor {
    merge(
        ModelDescriptor::new("gemini-flash", CliKind::Gemini, "gemini-2.5-flash")
            .with_cost_weight(0.5),
        overrides,
    )
}

pub fn gemini_pro(overrides: Option<Overrides>) -> ModelDescriptor {
    merge(
        ModelDescriptor::new("gemini-pro", CliKind::Gemini, "gemini-2.5-pro").with_cost_weight(4.0),
        overrides,
    )
}

pub fn gpt_4o(overrides: Option<Overrides>) -> ModelDescriptor {
    merge(
        ModelDescriptor::new("gpt-4o", CliKind::Opencode, "openai/gpt-4o").with_cost_weight(5.0),
        overrides,
    )
}

pub fn opencode_grok(overrides: Option<Overrides>) -> ModelDescriptor {
    merge(
        ModelDescriptor::new("opencode-grok", CliKind::Opencode, "opencode/grok-code")
            .with_cost_weight(0.0),
        overrides,
    )
}

pub fn droid_default(overrides: Option<Overrides>) -> ModelDescriptor {
    merge(
        ModelDescriptor::new("droid", CliKind::Droid, "claude-sonnet-4-5").with_cost_weight(3.0),
        overrides,
    )
}

pub fn kimi_k2(overrides: Option<Overrides>) -> ModelDescriptor {
    merge(
        ModelDescriptor::new("kimi-k2", CliKind::Kimi, "kimi-k2-instruct").with_cost_weight(1.0),
        overrides,
    )
}

/// Every preset, for "register them all" call sites.
pub fn all(overrides: Option<Overrides>) -> Vec<ModelDescriptor> {
    vec![
        claude_sonnet(overrides.clone()),
        claude_haiku(overrides.clone()),
        claude_opus(overrides.clone()),
        gemini_flash(overrides.clone()),
        gemini_pro(overrides.clone()),
        gpt_4o(overrides.clone()),
        opencode_grok(overrides.clone()),
        droid_default(overrides.clone()),
        kimi_k2(overrides),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_pure() {
        let a = claude_sonnet(None);
        let b = claude_sonnet(None);
        assert_eq!(a, b);
        assert_eq!(a.cli, CliKind::Claude);
        assert_eq!(a.model, "sonnet");
    }

    #[test]
    fn overrides_merge_shallowly() {
        let d = gemini_flash(Some(Overrides {
            timeout_ms: Some(60_000),
            enabled: Some(false),
            ..Default::default()
        }));
        assert_eq!(d.timeout_ms, Some(60_000));
        assert!(!d.enabled);
        // Untouched fields keep preset values.
        assert_eq!(d.cost_weight, Some(0.5));
        assert_eq!(d.model, "gemini-2.5-flash");
    }

    #[test]
    fn all_presets_have_unique_names() {
        let names: Vec<_> = all(None).into_iter().map(|d| d.name).collect();
        let unique: std::collections::HashSet<_> = names.iter().collect();
        assert_eq!(unique.len(), names.len());
    }
}
