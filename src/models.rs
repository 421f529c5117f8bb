use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::cli::CliKind;

/// One callable (CLI, canonical model, parameters) triple. Immutable once
/// registered; re-registering a name replaces the whole record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Unique identifier within a registry.
    pub name: String,
    /// Which CLI executes this model.
    pub cli: CliKind,
    /// The model string handed to the CLI.
    pub model: String,
    /// Per-model attempt timeout in milliseconds; wins over the global
    /// runner timeout when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Relative cost weight used by the cost-aware selector strategy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_weight: Option<f64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Extra CLI arguments appended after the strategy's own.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Extra environment entries merged over the strategy's.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>, cli: CliKind, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cli,
            model: model.into(),
            timeout_ms: None,
            cost_weight: None,
            enabled: true,
            args: Vec::new(),
            env: HashMap::new(),
            temperature: None,
            max_tokens: None,
            top_p: None,
            top_k: None,
            stop_sequences: Vec::new(),
        }
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn with_cost_weight(mut self, weight: f64) -> Self {
        self.cost_weight = Some(weight);
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Dedupe key used by the health checker.
    pub fn pair_key(&self) -> (CliKind, String) {
        (self.cli, self.model.clone())
    }
}

/// Stores descriptors keyed by canonical name. Case-insensitive on the
/// key, case-preserving on the stored value; `list()` returns insertion
/// order.
#[derive(Debug, Default, Clone)]
pub struct ModelRegistry {
    by_key: HashMap<String, ModelDescriptor>,
    insertion: Vec<String>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or atomically replace a descriptor under its name.
    pub fn register(&mut self, descriptor: ModelDescriptor) {
        let key = descriptor.name.to_lowercase();
        if self.by_key.insert(key.clone(), descriptor).is_none() {
            self.insertion.push(key);
        }
    }

    pub fn register_all<I>(&mut self, descriptors: I)
    where
        I: IntoIterator<Item = ModelDescriptor>,
    {
        for d in descriptors {
            self.register(d);
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelDescriptor> {
        self.by_key.get(&name.to_lowercase())
    }

    pub fn has(&self, name: &str) -> bool {
        self.by_key.contains_key(&name.to_lowercase())
    }

    /// Descriptors in insertion order.
    pub fn list(&self) -> Vec<&ModelDescriptor> {
        self.insertion
            .iter()
            .filter_map(|k| self.by_key.get(k))
            .collect()
    }

    /// Enabled descriptors in insertion order.
    pub fn list_enabled(&self) -> Vec<&ModelDescriptor> {
        self.list().into_iter().filter(|d| d.enabled).collect()
    }

    pub fn get_model_string(&self, name: &str) -> Option<&str> {
        self.get(name).map(|d| d.model.as_str())
    }

    pub fn get_cli(&self, name: &str) -> Option<CliKind> {
        self.get(name).map(|d| d.cli)
    }

    /// The full parameter record for a name, cloned.
    pub fn get_config(&self, name: &str) -> Option<ModelDescriptor> {
        self.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.insertion.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insertion.is_empty()
    }
}
