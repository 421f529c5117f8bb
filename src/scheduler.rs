use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backend::{Task, TaskBackend, TaskFilter};
use crate::classifier::{classify, Outcome};
use crate::cli::{CliKind, InvocationSpec, PermissionMode, StrategyRegistry};
use crate::error::GaleError;
use crate::hooks::{HookSet, TaskContext};
use crate::resilience::{
    AttemptSuccess, BackoffPolicy, ConstantBackoff, ExponentialBackoff, FixedAttempts,
    LinearBackoff, NoBackoff, ResilienceEngine, RetryOutcome,
};
use crate::runner::{KillReason, NullSink, OutputSink, ProcessRunner, RunRequest};
use crate::selector::ModelSelector;

/// Which backoff curve the retry loop uses between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Exponential,
    Linear,
    Constant,
    None,
}

/// Retry knobs threaded into the resilience engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    /// Floor on the delay after a rate-limited attempt.
    pub rate_limit_wait_ms: u64,
    /// Quarantine (instead of fail) a task whose retry loop ended at or
    /// past this attempt count with a non-recoverable error. Such
    /// errors stop the loop the first time they occur, so the default
    /// of 1 quarantines them all; raise it to require earlier retryable
    /// failures first. `None` disables quarantining.
    pub quarantine_after: Option<u32>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Exponential,
            base_delay_ms: 2_000,
            max_delay_ms: 120_000,
            jitter: 0.5,
            rate_limit_wait_ms: 60_000,
            quarantine_after: Some(1),
        }
    }
}

impl RetrySettings {
    fn build_engine(&self) -> ResilienceEngine {
        let base = Duration::from_millis(self.base_delay_ms);
        let max = Duration::from_millis(self.max_delay_ms);
        let backoff: Box<dyn BackoffPolicy> = match self.backoff {
            BackoffKind::Exponential => Box::new(ExponentialBackoff::new(base, max, self.jitter)),
            BackoffKind::Linear => Box::new(LinearBackoff::new(base, max)),
            BackoffKind::Constant => Box::new(ConstantBackoff::new(base)),
            BackoffKind::None => Box::new(NoBackoff),
        };
        ResilienceEngine::new(Box::new(FixedAttempts::new(self.max_attempts)), backoff)
            .with_rate_limit_wait(Duration::from_millis(self.rate_limit_wait_ms))
    }
}

/// Configuration for one `run_loop` call.
#[derive(Clone)]
pub struct LoopConfig {
    /// Worker count. Each worker drives one child process at a time.
    pub parallel: usize,
    /// Iteration budget: one iteration is one terminal task completion.
    /// In-flight tasks finish once the cap is hit; no new claims.
    pub max_iterations: Option<u32>,
    pub retry: RetrySettings,
    /// Global per-attempt timeout. A descriptor's own timeout wins.
    pub attempt_timeout: Duration,
    pub kill_grace: Duration,
    pub permissions: PermissionMode,
    pub filter: TaskFilter,
    /// Idle-worker poll fallback for backends without push wake-ups.
    pub poll_interval: Duration,
    pub cwd: Option<std::path::PathBuf>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            parallel: 1,
            max_iterations: None,
            retry: RetrySettings::default(),
            attempt_timeout: Duration::from_secs(300),
            kill_grace: Duration::from_millis(5000),
            permissions: PermissionMode::default(),
            filter: TaskFilter::default(),
            poll_interval: Duration::from_secs(1),
            cwd: None,
        }
    }
}

/// Loop-level summary returned by `run_loop`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub completed: u64,
    pub failed: u64,
    pub duration_ms: u64,
}

/// Renders the prompt for one task. Template rendering lives outside
/// the engine; the default provider hands the CLI the task title.
pub type PromptProvider = Arc<dyn Fn(&Task) -> String + Send + Sync>;

struct Counters {
    completed: u64,
    failed: u64,
}

/// Shared worker state for one loop run.
struct LoopShared {
    backend: Arc<dyn TaskBackend>,
    selector: Arc<ModelSelector>,
    strategies: StrategyRegistry,
    paths: HashMap<CliKind, String>,
    hooks: HookSet,
    prompt: PromptProvider,
    runner: Arc<ProcessRunner>,
    sink: Arc<dyn OutputSink>,
    cancel: CancellationToken,
    engine: ResilienceEngine,
    config: LoopConfig,
    namespace: String,
    counters: Mutex<Counters>,
    iterations: AtomicU32,
    active: AtomicUsize,
    wake: Notify,
}

impl LoopShared {
    fn budget_reached(&self) -> bool {
        self.config
            .max_iterations
            .is_some_and(|cap| self.iterations.load(Ordering::SeqCst) >= cap)
    }
}

/// Drives `parallel` workers over the task backend: claim, execute with
/// retries, write terminal state, fan out hooks. One cancellation token
/// reaches every sleep and every child process; the scheduler drains
/// its workers before returning.
pub struct Scheduler {
    backend: Arc<dyn TaskBackend>,
    selector: Arc<ModelSelector>,
    strategies: StrategyRegistry,
    paths: HashMap<CliKind, String>,
    hooks: HookSet,
    prompt: PromptProvider,
    sink: Arc<dyn OutputSink>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        backend: Arc<dyn TaskBackend>,
        selector: Arc<ModelSelector>,
        strategies: StrategyRegistry,
        paths: HashMap<CliKind, String>,
    ) -> Self {
        Self {
            backend,
            selector,
            strategies,
            paths,
            hooks: HookSet::new(),
            prompt: Arc::new(|task: &Task| task.title.clone()),
            sink: Arc::new(NullSink),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: HookSet) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_prompt_provider(mut self, prompt: PromptProvider) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run workers until the queue drains, the iteration budget is hit,
    /// or cancellation. `on_loop_start` and `on_loop_end` always fire,
    /// an empty model pool included.
    pub async fn run_loop(&self, namespace: &str, config: LoopConfig) -> LoopStats {
        let start = Instant::now();
        let config = self.hooks.config_load(config).await;

        // A fresh loop starts with a fresh selector cycle: fallback
        // switch, serve history, and per-loop disables are all cleared.
        self.selector.reset();

        self.hooks.backend_ready(&*self.backend).await;
        self.hooks.loop_start(namespace).await;

        if self.selector.all_models().is_empty() {
            tracing::warn!(namespace, "no models to run against; loop exits immediately");
            let stats = LoopStats {
                completed: 0,
                failed: 0,
                duration_ms: start.elapsed().as_millis() as u64,
            };
            self.hooks.loop_end(&stats).await;
            return stats;
        }

        let shared = Arc::new(LoopShared {
            backend: self.backend.clone(),
            selector: self.selector.clone(),
            strategies: self.strategies.clone(),
            paths: self.paths.clone(),
            hooks: self.hooks.clone(),
            prompt: self.prompt.clone(),
            runner: Arc::new(ProcessRunner::new()),
            sink: self.sink.clone(),
            cancel: self.cancel.clone(),
            engine: config.retry.build_engine(),
            namespace: namespace.to_string(),
            config,
            counters: Mutex::new(Counters {
                completed: 0,
                failed: 0,
            }),
            iterations: AtomicU32::new(0),
            active: AtomicUsize::new(0),
            wake: Notify::new(),
        });

        let workers = shared.config.parallel.max(1);
        let mut set = JoinSet::new();
        for worker in 0..workers {
            let shared = shared.clone();
            set.spawn(async move {
                worker_loop(worker, shared).await;
            });
        }

        // Drain every worker, cancellation included.
        while let Some(result) = set.join_next().await {
            if let Err(e) = result
                && e.is_panic()
            {
                tracing::error!("worker panicked: {e}");
            }
        }

        let counters = shared.counters.lock().expect("loop counters lock poisoned");
        let stats = LoopStats {
            completed: counters.completed,
            failed: counters.failed,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        drop(counters);

        self.hooks.loop_end(&stats).await;
        tracing::info!(
            namespace,
            completed = stats.completed,
            failed = stats.failed,
            ms = stats.duration_ms,
            "loop finished"
        );
        stats
    }
}

async fn worker_loop(worker: usize, shared: Arc<LoopShared>) {
    loop {
        if shared.cancel.is_cancelled() || shared.budget_reached() {
            break;
        }

        let task = match shared.backend.find_next_task(&shared.config.filter).await {
            Ok(task) => task,
            Err(e) => {
                // Transient backend trouble: log and poll again.
                tracing::warn!(worker, "find_next_task failed: {e}");
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    _ = tokio::time::sleep(shared.config.poll_interval) => continue,
                }
            }
        };

        let Some(task) = task else {
            // Nothing pending. If a peer is still mid-task its
            // completion may unblock dependents, so wait for a wake-up
            // (or the poll fallback); otherwise the queue is drained.
            if shared.active.load(Ordering::SeqCst) == 0 {
                break;
            }
            tokio::select! {
                _ = shared.cancel.cancelled() => break,
                _ = shared.wake.notified() => {}
                _ = tokio::time::sleep(shared.config.poll_interval) => {}
            }
            continue;
        };

        // Claim. Another worker may have won the race; just loop.
        match shared.backend.mark_in_progress(&task.id).await {
            Ok(claim) if claim.success => {}
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(worker, task = %task.id, "mark_in_progress failed: {e}");
                continue;
            }
        }

        shared.active.fetch_add(1, Ordering::SeqCst);
        process_task(worker, &task, &shared).await;
        shared.active.fetch_sub(1, Ordering::SeqCst);
        shared.iterations.fetch_add(1, Ordering::SeqCst);
        shared.wake.notify_waiters();
    }

    // A departing worker may be the one idle peers are waiting on.
    shared.wake.notify_waiters();
}

async fn process_task(worker: usize, task: &Task, shared: &Arc<LoopShared>) {
    let ctx = TaskContext {
        namespace: shared.namespace.clone(),
        task: task.clone(),
        worker,
    };
    shared.hooks.task_start(&ctx).await;
    tracing::info!(worker, task = %task.id, title = %task.title, "task started");

    let outcome = shared
        .engine
        .execute(&shared.cancel, |_attempt| run_one_attempt(task, shared))
        .await;

    if outcome.success {
        let summary = completion_summary(&outcome);
        if let Err(e) = shared.backend.mark_completed(&task.id, Some(&summary)).await {
            tracing::error!(task = %task.id, "mark_completed failed: {e}");
        }
        shared.counters.lock().expect("loop counters lock poisoned").completed += 1;
        tracing::info!(worker, task = %task.id, attempts = outcome.attempts, "task completed");
        shared.hooks.task_complete(&ctx, &outcome).await;
        return;
    }

    let error = outcome
        .final_error
        .as_ref()
        .map(|e| e.user_message())
        .unwrap_or_else(|| "unknown error".to_string());
    let cancelled = matches!(outcome.final_error, Some(GaleError::Cancelled));
    let reason = if cancelled {
        "cancelled".to_string()
    } else {
        format!("exhausted {} attempts; last error: {error}", outcome.attempts)
    };

    let quarantine = !cancelled
        && shared
            .config
            .retry
            .quarantine_after
            .is_some_and(|n| outcome.attempts >= n)
        && outcome.final_error.as_ref().is_some_and(|e| !e.retryable());

    let write = if quarantine {
        shared.backend.mark_quarantined(&task.id, &reason).await
    } else {
        shared.backend.mark_failed(&task.id, &reason).await
    };
    if let Err(e) = write {
        tracing::error!(task = %task.id, "terminal state write failed: {e}");
    }

    shared.counters.lock().expect("loop counters lock poisoned").failed += 1;
    tracing::warn!(worker, task = %task.id, quarantine, %reason, "task failed");

    let final_error = outcome
        .final_error
        .unwrap_or(GaleError::TaskFailed { reason });
    shared.hooks.task_failed(&ctx, &final_error).await;
}

/// One CLI invocation: pick a model (falling back once when the primary
/// pool is spent), build the invocation, run it, and map the classified
/// result onto the retry taxonomy.
async fn run_one_attempt(
    task: &Task,
    shared: &Arc<LoopShared>,
) -> Result<AttemptSuccess, GaleError> {
    if shared.cancel.is_cancelled() {
        return Err(GaleError::Cancelled);
    }

    let descriptor = match shared.selector.get_next() {
        Some(d) => d,
        None => {
            if shared.selector.switch_to_fallback() {
                tracing::info!(task = %task.id, "primary pool exhausted, using fallback");
            }
            shared.selector.get_next().ok_or(GaleError::NoModelAvailable)?
        }
    };

    let strategy = shared.strategies.get(descriptor.cli)?;
    let executable = shared
        .paths
        .get(&descriptor.cli)
        .cloned()
        .ok_or_else(|| GaleError::SpawnError {
            executable: descriptor.cli.to_string(),
            message: format!("CLI {} not in paths", descriptor.cli),
        })?;

    let prompt = (shared.prompt)(task);
    let base_env: HashMap<String, String> = std::env::vars().collect();
    let invocation = strategy.build(&InvocationSpec {
        descriptor: &descriptor,
        prompt: &prompt,
        base_env: &base_env,
        permissions: shared.config.permissions,
    });

    // Per-model timeout wins over the global attempt timeout.
    let timeout = descriptor
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(shared.config.attempt_timeout);

    let outcome = shared
        .runner
        .run(
            RunRequest {
                executable: executable.clone(),
                args: invocation.args,
                env: invocation.env,
                stdin: invocation.stdin,
                timeout,
                kill_grace: shared.config.kill_grace,
                cwd: shared.config.cwd.clone(),
            },
            shared.sink.clone(),
            shared.cancel.clone(),
        )
        .await;

    match outcome.kill_reason {
        Some(KillReason::Timeout) => {
            return Err(GaleError::Timeout {
                ms: outcome.wall_ms,
            });
        }
        Some(KillReason::Cancelled) => return Err(GaleError::Cancelled),
        Some(KillReason::SpawnError) => {
            return Err(GaleError::SpawnError {
                executable,
                message: outcome.stderr,
            });
        }
        Some(KillReason::OutputOverflow) | None => {}
    }

    let classification = classify(&outcome, &*strategy);
    match classification.outcome {
        Outcome::Success => Ok(AttemptSuccess {
            model_used: descriptor.name.clone(),
            display_name: invocation.display_name,
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            wall_ms: outcome.wall_ms,
            stdout_bytes: outcome.stdout_bytes,
            stderr_bytes: outcome.stderr_bytes,
            metrics: classification.metrics,
        }),
        Outcome::RateLimited => {
            // Retryable with the wait floor; the descriptor stays in
            // rotation, since rate limits clear on their own.
            Err(GaleError::RateLimited {
                model: descriptor.name.clone(),
            })
        }
        Outcome::QuotaExhausted => {
            // Out of rotation for the rest of this loop only.
            shared.selector.disable(&descriptor.name);
            Err(GaleError::QuotaExhausted {
                model: descriptor.name.clone(),
            })
        }
        Outcome::CacheCorrupt => {
            let cleared = strategy.clear_cache();
            tracing::warn!(cli = %descriptor.cli, cleared, "corrupt cache detected");
            Err(GaleError::CacheCorrupt {
                cli: descriptor.cli.to_string(),
            })
        }
        Outcome::Failure => {
            // -1 (spawn) and 127 (shell: command not found) mean the
            // executable itself is broken; retrying cannot help.
            if outcome.exit_code == -1 || outcome.exit_code == 127 {
                Err(GaleError::SpawnError {
                    executable,
                    message: format!("exit code {}", outcome.exit_code),
                })
            } else {
                Err(GaleError::TaskFailed {
                    reason: attempt_failure_reason(&outcome),
                })
            }
        }
    }
}

fn attempt_failure_reason(outcome: &crate::runner::RunOutcome) -> String {
    let stderr = outcome.stderr.trim();
    if stderr.is_empty() {
        format!("exit code {} with no output", outcome.exit_code)
    } else {
        let line = stderr.lines().next().unwrap_or(stderr);
        format!("exit code {}: {line}", outcome.exit_code)
    }
}

fn completion_summary(outcome: &RetryOutcome) -> String {
    let model = outcome
        .result
        .as_ref()
        .map(|r| r.display_name.as_str())
        .unwrap_or("unknown");
    format!(
        "completed with {model} in {} attempt{}",
        outcome.attempts,
        if outcome.attempts == 1 { "" } else { "s" }
    )
}
