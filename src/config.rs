use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::cli::CliKind;
use crate::error::GaleError;
use crate::health::HealthCheckerConfig;
use crate::models::{ModelDescriptor, ModelRegistry};
use crate::scheduler::{LoopConfig, RetrySettings};
use crate::selector::{ModelSelector, SelectionStrategy};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub namespace: String,
    pub parallel: usize,
    pub max_iterations: Option<u32>,
    /// Treat long-stuck in-progress tasks as pending on startup.
    pub resume: bool,
    pub tasks_file: String,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            parallel: 1,
            max_iterations: None,
            resume: false,
            tasks_file: ".gale/tasks.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerSection {
    pub timeout_ms: u64,
    pub kill_grace_ms: u64,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            timeout_ms: 300_000,
            kill_grace_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub probe_timeout_ms: u64,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub auto_clear_cache: bool,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 30_000,
            batch_size: 3,
            batch_delay_ms: 2_000,
            auto_clear_cache: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SelectorSection {
    pub strategy: SelectionStrategy,
    /// Model names consulted only after the primary pool is exhausted.
    pub fallback: Vec<String>,
}

/// Whole engine configuration: `gale.toml` merged with environment
/// overrides. Missing file means defaults; a present but invalid file
/// is a hard configuration error.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub engine: EngineSection,
    pub retry: RetrySettings,
    pub runner: RunnerSection,
    pub health: HealthSection,
    pub selector: SelectorSection,
    /// CLI kind → executable path. Unlisted kinds are auto-detected on
    /// PATH.
    pub paths: HashMap<String, String>,
    pub models: Vec<ModelDescriptor>,
}

pub const DEFAULT_CONFIG_FILE: &str = "gale.toml";

impl EngineConfig {
    /// Load from an explicit path, or from `gale.toml` when present,
    /// else defaults. Environment overrides are applied afterwards.
    pub fn load(path: Option<&Path>) -> Result<Self, GaleError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, GaleError> {
        let text = std::fs::read_to_string(path).map_err(|e| GaleError::Config {
            message: format!("read {}: {e}", path.display()),
        })?;
        toml::from_str(&text).map_err(|e| GaleError::Config {
            message: format!("parse {}: {e}", path.display()),
        })
    }

    /// `GALE_NAMESPACE`, `GALE_PARALLEL`, `GALE_MAX_ITERATIONS`,
    /// `GALE_MAX_ATTEMPTS`, `GALE_TASKS_FILE` override the file.
    fn apply_env(&mut self) {
        if let Ok(ns) = env::var("GALE_NAMESPACE")
            && !ns.is_empty()
        {
            self.engine.namespace = ns;
        }
        if let Ok(parallel) = env::var("GALE_PARALLEL")
            && let Ok(n) = parallel.parse()
        {
            self.engine.parallel = n;
        }
        if let Ok(iters) = env::var("GALE_MAX_ITERATIONS")
            && let Ok(n) = iters.parse()
        {
            self.engine.max_iterations = Some(n);
        }
        if let Ok(attempts) = env::var("GALE_MAX_ATTEMPTS")
            && let Ok(n) = attempts.parse()
        {
            self.retry.max_attempts = n;
        }
        if let Ok(file) = env::var("GALE_TASKS_FILE")
            && !file.is_empty()
        {
            self.engine.tasks_file = file;
        }
    }

    fn validate(&self) -> Result<(), GaleError> {
        if self.engine.parallel == 0 {
            return Err(GaleError::Config {
                message: "engine.parallel must be at least 1".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(GaleError::Config {
                message: "retry.max_attempts must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(GaleError::Config {
                message: "retry.jitter must be within 0.0..=1.0".to_string(),
            });
        }
        for key in self.paths.keys() {
            key.parse::<CliKind>()?;
        }
        for name in &self.selector.fallback {
            if !self.models.iter().any(|m| m.name.eq_ignore_ascii_case(name)) {
                return Err(GaleError::Config {
                    message: format!("selector.fallback names unknown model: {name}"),
                });
            }
        }
        Ok(())
    }

    /// Executable path per CLI kind: explicit `[paths]` entries win,
    /// then anything found on PATH under its own name. Kinds absent
    /// from the result are reported unhealthy by the health checker.
    pub fn resolved_paths(&self) -> HashMap<CliKind, String> {
        let mut resolved = HashMap::new();
        for (key, value) in &self.paths {
            if let Ok(kind) = key.parse::<CliKind>() {
                resolved.insert(kind, value.clone());
            }
        }
        for kind in CliKind::ALL {
            if !resolved.contains_key(&kind) && which_exists(kind.as_str()) {
                resolved.insert(kind, kind.as_str().to_string());
            }
        }
        resolved
    }

    pub fn model_registry(&self) -> ModelRegistry {
        let mut registry = ModelRegistry::new();
        registry.register_all(self.models.iter().cloned());
        registry
    }

    /// Split the healthy descriptors into primary and fallback pools
    /// per `selector.fallback` and build the selector.
    pub fn build_selector(&self, healthy: Vec<ModelDescriptor>) -> ModelSelector {
        let is_fallback = |d: &ModelDescriptor| {
            self.selector
                .fallback
                .iter()
                .any(|name| d.name.eq_ignore_ascii_case(name))
        };
        let (fallback, primary): (Vec<_>, Vec<_>) = healthy.into_iter().partition(is_fallback);
        ModelSelector::new(self.selector.strategy, primary).with_fallback(fallback)
    }

    pub fn loop_config(&self) -> LoopConfig {
        LoopConfig {
            parallel: self.engine.parallel,
            max_iterations: self.engine.max_iterations,
            retry: self.retry.clone(),
            attempt_timeout: Duration::from_millis(self.runner.timeout_ms),
            kill_grace: Duration::from_millis(self.runner.kill_grace_ms),
            ..LoopConfig::default()
        }
    }

    pub fn health_config(&self) -> HealthCheckerConfig {
        HealthCheckerConfig {
            probe_timeout: Duration::from_millis(self.health.probe_timeout_ms),
            batch_size: self.health.batch_size,
            batch_delay: Duration::from_millis(self.health.batch_delay_ms),
            auto_clear_cache: self.health.auto_clear_cache,
            kill_grace: Duration::from_millis(self.runner.kill_grace_ms),
        }
    }
}

/// Check if an executable exists in PATH.
fn which_exists(name: &str) -> bool {
    std::process::Command::new("which")
        .arg(name)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}
