use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cli::{CliKind, InvocationSpec, PermissionMode, StrategyRegistry};
use crate::models::ModelDescriptor;
use crate::runner::{NullSink, ProcessRunner, RunOutcome, RunRequest};

/// Fixed synthetic probe prompt. Cheap for every model, and any
/// non-empty answer proves the pipe end-to-end.
pub const CANARY_PROMPT: &str = r#"Say "OK" and nothing else."#;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BATCH_SIZE: usize = 3;
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// Usable, but only after recovery (cache clear) or despite a
    /// nonzero exit that still produced output. Selected like healthy.
    Degraded,
}

impl HealthStatus {
    pub fn is_usable(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }
}

/// Result of probing one (CLI, model) pair. Valid for the duration of a
/// scheduler run unless the checker's results are cleared.
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub cli: CliKind,
    pub model: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub validation_time_ms: u64,
    pub cache_cleared: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ValidationSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub cache_cleared: usize,
    pub duration_ms: u64,
}

/// Progressive delivery: one event per classified pair, then the
/// aggregate once every batch has finished.
#[derive(Debug, Clone)]
pub enum HealthEvent {
    ModelHealthy(HealthRecord),
    ModelUnhealthy(HealthRecord),
    ValidationComplete(ValidationSummary),
}

/// Everything `validate` produced: the usable and unusable descriptor
/// partitions plus the per-pair records behind them.
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub healthy: Vec<ModelDescriptor>,
    pub unhealthy: Vec<ModelDescriptor>,
    pub records: Vec<HealthRecord>,
    pub summary: ValidationSummary,
}

#[derive(Debug, Clone)]
pub struct HealthCheckerConfig {
    pub probe_timeout: Duration,
    pub batch_size: usize,
    /// Pause between batches so a burst of probes cannot trip upstream
    /// rate limits.
    pub batch_delay: Duration,
    pub auto_clear_cache: bool,
    pub kill_grace: Duration,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_delay: DEFAULT_BATCH_DELAY,
            auto_clear_cache: true,
            kill_grace: Duration::from_millis(5000),
        }
    }
}

/// Probes each (CLI, model) pair with the canary prompt before the
/// scheduler starts work. Results are cached by pair: a second
/// `validate` call reuses them until `clear_results`.
pub struct HealthChecker {
    strategies: StrategyRegistry,
    paths: HashMap<CliKind, String>,
    config: HealthCheckerConfig,
    runner: ProcessRunner,
    cache: Mutex<HashMap<(CliKind, String), HealthRecord>>,
}

impl HealthChecker {
    pub fn new(
        strategies: StrategyRegistry,
        paths: HashMap<CliKind, String>,
        config: HealthCheckerConfig,
    ) -> Self {
        Self {
            strategies,
            paths,
            config,
            runner: ProcessRunner::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Drop every cached record; the next `validate` re-probes.
    pub fn clear_results(&self) {
        self.cache.lock().expect("health cache lock poisoned").clear();
    }

    pub fn cached_record(&self, cli: CliKind, model: &str) -> Option<HealthRecord> {
        self.cache
            .lock()
            .expect("health cache lock poisoned")
            .get(&(cli, model.to_string()))
            .cloned()
    }

    /// Probe the deduplicated pairs in fixed-size concurrent batches
    /// with a delay between batches. Each record is delivered on
    /// `events` the moment it is classified; the summary arrives once
    /// all batches finish (or cancellation cuts the run short).
    pub async fn validate(
        &self,
        descriptors: &[ModelDescriptor],
        events: Option<mpsc::UnboundedSender<HealthEvent>>,
        cancel: &CancellationToken,
    ) -> ValidationReport {
        let start = Instant::now();

        // Dedupe on (cli, model); the first descriptor of a pair probes
        // for every descriptor sharing it.
        let mut probe_list: Vec<&ModelDescriptor> = Vec::new();
        let mut seen: HashMap<(CliKind, String), ()> = HashMap::new();
        for d in descriptors {
            if seen.insert(d.pair_key(), ()).is_none() {
                probe_list.push(d);
            }
        }

        let mut records: HashMap<(CliKind, String), HealthRecord> = HashMap::new();

        // Serve cached pairs without probing.
        {
            let cache = self.cache.lock().expect("health cache lock poisoned");
            probe_list.retain(|d| {
                if let Some(record) = cache.get(&d.pair_key()) {
                    records.insert(d.pair_key(), record.clone());
                    false
                } else {
                    true
                }
            });
        }

        let batches: Vec<&[&ModelDescriptor]> =
            probe_list.chunks(self.config.batch_size.max(1)).collect();
        let batch_count = batches.len();

        for (i, batch) in batches.into_iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }

            let probes = batch.iter().map(|d| self.probe(d, cancel));
            let batch_records = futures_util::future::join_all(probes).await;

            for record in batch_records {
                let key = (record.cli, record.model.clone());
                self.cache
                    .lock()
                    .expect("health cache lock poisoned")
                    .insert(key.clone(), record.clone());

                if let Some(ref tx) = events {
                    let event = if record.status.is_usable() {
                        HealthEvent::ModelHealthy(record.clone())
                    } else {
                        HealthEvent::ModelUnhealthy(record.clone())
                    };
                    let _ = tx.send(event);
                }
                records.insert(key, record);
            }

            if i + 1 < batch_count && !self.config.batch_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.batch_delay) => {}
                }
            }
        }

        // Partition the caller's descriptors against the records.
        let mut healthy = Vec::new();
        let mut unhealthy = Vec::new();
        for d in descriptors {
            match records.get(&d.pair_key()) {
                Some(r) if r.status.is_usable() => healthy.push(d.clone()),
                Some(_) => unhealthy.push(d.clone()),
                // Cancelled before this pair was probed.
                None => unhealthy.push(d.clone()),
            }
        }

        let record_list: Vec<HealthRecord> = records.into_values().collect();
        let summary = ValidationSummary {
            total: record_list.len(),
            healthy: record_list.iter().filter(|r| r.status.is_usable()).count(),
            unhealthy: record_list.iter().filter(|r| !r.status.is_usable()).count(),
            cache_cleared: record_list.iter().filter(|r| r.cache_cleared).count(),
            duration_ms: start.elapsed().as_millis() as u64,
        };

        if let Some(ref tx) = events {
            let _ = tx.send(HealthEvent::ValidationComplete(summary));
        }

        tracing::info!(
            healthy = summary.healthy,
            unhealthy = summary.unhealthy,
            cache_cleared = summary.cache_cleared,
            "model validation complete"
        );

        ValidationReport {
            healthy,
            unhealthy,
            records: record_list,
            summary,
        }
    }

    async fn probe(&self, descriptor: &ModelDescriptor, cancel: &CancellationToken) -> HealthRecord {
        let start = Instant::now();
        let cli = descriptor.cli;

        let Some(executable) = self.paths.get(&cli) else {
            return HealthRecord {
                cli,
                model: descriptor.model.clone(),
                status: HealthStatus::Unhealthy,
                last_error: Some(format!("CLI {cli} not in paths")),
                validation_time_ms: start.elapsed().as_millis() as u64,
                cache_cleared: false,
            };
        };

        let strategy = match self.strategies.get(cli) {
            Ok(s) => s,
            Err(e) => {
                return HealthRecord {
                    cli,
                    model: descriptor.model.clone(),
                    status: HealthStatus::Unhealthy,
                    last_error: Some(e.to_string()),
                    validation_time_ms: start.elapsed().as_millis() as u64,
                    cache_cleared: false,
                };
            }
        };

        let outcome = self.probe_once(executable, descriptor, &*strategy, cancel).await;
        let mut cache_cleared = false;

        let outcome = match Self::judge(&outcome, &*strategy) {
            Judgement::Usable(_) => outcome,
            Judgement::Unusable => {
                let combined = outcome.combined_output();
                if self.config.auto_clear_cache && strategy.detect_cache_corruption(&combined) {
                    // The clear is best-effort: the record reports that
                    // it was attempted and the single re-probe happens
                    // regardless of whether removal succeeded.
                    let cleared = strategy.clear_cache();
                    if !cleared {
                        tracing::warn!(%cli, model = %descriptor.model, "cache clear failed");
                    }
                    cache_cleared = true;
                    tracing::info!(%cli, model = %descriptor.model, cleared, "re-probing after cache clear");
                    self.probe_once(executable, descriptor, &*strategy, cancel).await
                } else {
                    outcome
                }
            }
        };

        let record = match Self::judge(&outcome, &*strategy) {
            Judgement::Usable(clean) => HealthRecord {
                cli,
                model: descriptor.model.clone(),
                status: if clean && !cache_cleared {
                    HealthStatus::Healthy
                } else {
                    HealthStatus::Degraded
                },
                last_error: None,
                validation_time_ms: start.elapsed().as_millis() as u64,
                cache_cleared,
            },
            Judgement::Unusable => HealthRecord {
                cli,
                model: descriptor.model.clone(),
                status: HealthStatus::Unhealthy,
                last_error: Some(probe_error(&outcome)),
                validation_time_ms: start.elapsed().as_millis() as u64,
                cache_cleared,
            },
        };

        tracing::debug!(
            %cli,
            model = %descriptor.model,
            status = ?record.status,
            ms = record.validation_time_ms,
            "probe finished"
        );
        record
    }

    async fn probe_once(
        &self,
        executable: &str,
        descriptor: &ModelDescriptor,
        strategy: &dyn crate::cli::CliStrategy,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let base_env: HashMap<String, String> = std::env::vars().collect();
        let invocation = strategy.build(&InvocationSpec {
            descriptor,
            prompt: CANARY_PROMPT,
            base_env: &base_env,
            permissions: PermissionMode::Prompt,
        });

        let request = RunRequest {
            executable: executable.to_string(),
            args: invocation.args,
            env: invocation.env,
            stdin: invocation.stdin,
            timeout: self.config.probe_timeout,
            kill_grace: self.config.kill_grace,
            cwd: None,
        };

        self.runner
            .run(request, std::sync::Arc::new(NullSink), cancel.clone())
            .await
    }

    /// Health rule: a clean exit with non-whitespace stdout is healthy;
    /// failing that, any stdout at all with no corruption signature
    /// still counts (some CLIs exit nonzero on auth warnings yet answer
    /// the canary).
    fn judge(outcome: &RunOutcome, strategy: &dyn crate::cli::CliStrategy) -> Judgement {
        if outcome.exit_code == 0 && !outcome.stdout.trim().is_empty() {
            return Judgement::Usable(true);
        }
        if !outcome.stdout.is_empty()
            && !strategy.detect_cache_corruption(&outcome.combined_output())
        {
            return Judgement::Usable(false);
        }
        Judgement::Unusable
    }
}

enum Judgement {
    /// true = clean (exit 0 + real stdout), false = answered despite a
    /// nonzero exit.
    Usable(bool),
    Unusable,
}

fn probe_error(outcome: &RunOutcome) -> String {
    let stderr = outcome.stderr.trim();
    if !stderr.is_empty() {
        let line = stderr.lines().next().unwrap_or(stderr);
        format!("exit {}: {line}", outcome.exit_code)
    } else if let Some(reason) = outcome.kill_reason {
        format!("exit {}: {reason:?}", outcome.exit_code)
    } else {
        format!("exit {} with empty output", outcome.exit_code)
    }
}
