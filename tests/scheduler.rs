//! End-to-end scheduler runs against `/bin/sh` children: the happy
//! path, rate-limit recovery, cache-clear retry, fallback pools,
//! timeout escalation, empty model pools, claim exclusion, iteration
//! budgets, hook isolation, and cancellation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use gale::backend::memory::MemoryBackend;
use gale::backend::{Task, TaskBackend, TaskStatus};
use gale::cli::{CliKind, CliStrategy, Invocation, InvocationSpec, StrategyRegistry};
use gale::error::GaleError;
use gale::hooks::{HookSet, LifecycleHook, TaskContext};
use gale::models::ModelDescriptor;
use gale::resilience::RetryOutcome;
use gale::scheduler::{BackoffKind, LoopConfig, RetrySettings, Scheduler};
use gale::selector::{ModelSelector, SelectionStrategy};

/// Stub strategy that hands `/bin/sh` the descriptor's args verbatim.
/// Tests write descriptors as `["-c", "<script>"]`. Rate-limit and
/// quota signatures match what the scripts emit; "clearing the cache"
/// creates a repair file the scripts can test for.
#[derive(Debug)]
struct ShStrategy {
    rate: Vec<Regex>,
    quota: Vec<Regex>,
    repair_file: Option<PathBuf>,
    prompt_on_stdin: bool,
}

impl ShStrategy {
    fn new() -> Self {
        Self {
            rate: vec![Regex::new(r"\b429\b").unwrap()],
            quota: vec![Regex::new(r"quota exhausted").unwrap()],
            repair_file: None,
            prompt_on_stdin: false,
        }
    }

    fn with_repair_file(mut self, path: PathBuf) -> Self {
        self.repair_file = Some(path);
        self
    }

    fn with_prompt_on_stdin(mut self) -> Self {
        self.prompt_on_stdin = true;
        self
    }
}

impl CliStrategy for ShStrategy {
    fn kind(&self) -> CliKind {
        CliKind::Claude
    }

    fn build(&self, spec: &InvocationSpec<'_>) -> Invocation {
        Invocation {
            args: spec.descriptor.args.clone(),
            env: HashMap::new(),
            stdin: self.prompt_on_stdin.then(|| spec.prompt.to_string()),
            display_name: format!("claude/{}", spec.descriptor.model),
        }
    }

    fn rate_limit_patterns(&self) -> &[Regex] {
        &self.rate
    }

    fn quota_patterns(&self) -> &[Regex] {
        &self.quota
    }

    fn detect_cache_corruption(&self, output: &str) -> bool {
        output.contains("CACHE_BROKEN")
    }

    fn clear_cache(&self) -> bool {
        match &self.repair_file {
            Some(path) => std::fs::write(path, "repaired").is_ok(),
            None => false,
        }
    }
}

/// Hook that counts lifecycle fan-outs and keeps the last outcomes.
#[derive(Default)]
struct Recorder {
    loop_starts: AtomicU32,
    loop_ends: AtomicU32,
    task_starts: AtomicU32,
    task_completes: AtomicU32,
    task_fails: AtomicU32,
    last_attempts: Mutex<Option<u32>>,
    last_duration_ms: Mutex<Option<u64>>,
    last_stdout: Mutex<Option<String>>,
}

#[async_trait]
impl LifecycleHook for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn on_loop_start(&self, _namespace: &str) -> Result<(), GaleError> {
        self.loop_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_loop_end(&self, _stats: &gale::scheduler::LoopStats) -> Result<(), GaleError> {
        self.loop_ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_task_start(&self, _ctx: &TaskContext) -> Result<(), GaleError> {
        self.task_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_task_complete(
        &self,
        _ctx: &TaskContext,
        result: &RetryOutcome,
    ) -> Result<(), GaleError> {
        self.task_completes.fetch_add(1, Ordering::SeqCst);
        *self.last_attempts.lock().unwrap() = Some(result.attempts);
        *self.last_duration_ms.lock().unwrap() = Some(result.total_duration_ms);
        *self.last_stdout.lock().unwrap() =
            result.result.as_ref().map(|r| r.stdout.clone());
        Ok(())
    }

    async fn on_task_failed(&self, _ctx: &TaskContext, _error: &GaleError) -> Result<(), GaleError> {
        self.task_fails.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn sh_paths() -> HashMap<CliKind, String> {
    HashMap::from([(CliKind::Claude, "/bin/sh".to_string())])
}

fn model(name: &str, script: &str) -> ModelDescriptor {
    ModelDescriptor::new(name, CliKind::Claude, name).with_args(["-c", script])
}

fn strategies(strategy: ShStrategy) -> StrategyRegistry {
    let mut registry = StrategyRegistry::new();
    registry.register(Arc::new(strategy));
    registry
}

fn fast_loop(parallel: usize, max_attempts: u32) -> LoopConfig {
    LoopConfig {
        parallel,
        retry: RetrySettings {
            max_attempts,
            backoff: BackoffKind::None,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: 0.0,
            rate_limit_wait_ms: 0,
            quarantine_after: None,
        },
        attempt_timeout: Duration::from_secs(10),
        kill_grace: Duration::from_millis(300),
        poll_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

fn build(
    backend: Arc<MemoryBackend>,
    models: Vec<ModelDescriptor>,
    strategy: ShStrategy,
    recorder: Arc<Recorder>,
) -> Scheduler {
    let selector = Arc::new(ModelSelector::new(SelectionStrategy::RoundRobin, models));
    let mut hooks = HookSet::new();
    hooks.register(recorder);
    Scheduler::new(backend, selector, strategies(strategy), sh_paths()).with_hooks(hooks)
}

// ---------------------------------------------------------------------------
// Scenario: happy path. 3 tasks, 2 workers, one healthy model
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_completes_all_tasks() {
    let backend = Arc::new(MemoryBackend::with_tasks([
        Task::new("t1", "one"),
        Task::new("t2", "two"),
        Task::new("t3", "three"),
    ]));
    let recorder = Arc::new(Recorder::default());
    let scheduler = build(
        backend.clone(),
        vec![model("sonnet", "echo ok")],
        ShStrategy::new(),
        recorder.clone(),
    );

    let stats = scheduler.run_loop("happy", fast_loop(2, 3)).await;

    assert_eq!(stats.completed, 3);
    assert_eq!(stats.failed, 0);
    assert_eq!(recorder.task_starts.load(Ordering::SeqCst), 3);
    assert_eq!(recorder.task_completes.load(Ordering::SeqCst), 3);
    assert_eq!(recorder.task_fails.load(Ordering::SeqCst), 0);

    for task in backend.all_tasks() {
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.comment.as_deref().unwrap().contains("claude/sonnet"));
    }
}

// ---------------------------------------------------------------------------
// Scenario: rate-limit recovery with the wait floor
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rate_limited_attempt_retries_after_floor() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("first-attempt-done");
    let backend = Arc::new(MemoryBackend::with_tasks([Task::new("t", "task")]));
    let recorder = Arc::new(Recorder::default());

    // Attempt 1 reports a 429; attempt 2 succeeds.
    let script = format!(
        "if [ -f {m} ]; then echo ok; else touch {m}; echo '429 rate limit' >&2; exit 1; fi",
        m = marker.display()
    );
    let scheduler = build(
        backend.clone(),
        vec![model("sonnet", &script)],
        ShStrategy::new(),
        recorder.clone(),
    );

    let mut config = fast_loop(1, 2);
    config.retry.rate_limit_wait_ms = 500;

    let start = Instant::now();
    let stats = scheduler.run_loop("rate-limit", config).await;

    assert_eq!(stats.completed, 1);
    assert_eq!(recorder.last_attempts.lock().unwrap().unwrap(), 2);
    // The second attempt waited for the rate-limit floor.
    assert!(start.elapsed() >= Duration::from_millis(500));
    assert!(recorder.last_duration_ms.lock().unwrap().unwrap() >= 500);
}

// ---------------------------------------------------------------------------
// Scenario: cache corruption cleared between attempts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn corrupt_cache_cleared_then_retried() {
    let dir = tempfile::tempdir().unwrap();
    let repair = dir.path().join("repaired");
    let backend = Arc::new(MemoryBackend::with_tasks([Task::new("t", "task")]));
    let recorder = Arc::new(Recorder::default());

    let script = format!(
        "if [ -f {r} ]; then echo ok; else echo 'CACHE_BROKEN node_modules' >&2; exit 1; fi",
        r = repair.display()
    );
    let scheduler = build(
        backend.clone(),
        vec![model("oc", &script)],
        ShStrategy::new().with_repair_file(repair.clone()),
        recorder.clone(),
    );

    let stats = scheduler.run_loop("cache", fast_loop(1, 2)).await;

    assert_eq!(stats.completed, 1);
    assert!(repair.exists(), "clear_cache must have run");
    assert_eq!(recorder.last_attempts.lock().unwrap().unwrap(), 2);
}

// ---------------------------------------------------------------------------
// Scenario: fallback pool after the primary is exhausted by quota
// ---------------------------------------------------------------------------

#[tokio::test]
async fn quota_exhausted_primaries_fall_back() {
    let backend = Arc::new(MemoryBackend::with_tasks([Task::new("t", "task")]));
    let recorder = Arc::new(Recorder::default());

    let primary = vec![
        model("a", "echo 'quota exhausted' >&2; exit 1"),
        model("b", "echo 'quota exhausted' >&2; exit 1"),
    ];
    let fallback = vec![model("c-ok", "echo rescued")];

    let selector = Arc::new(
        ModelSelector::new(SelectionStrategy::RoundRobin, primary).with_fallback(fallback),
    );
    let mut hooks = HookSet::new();
    hooks.register(recorder.clone());
    let scheduler = Scheduler::new(
        backend.clone(),
        selector.clone(),
        strategies(ShStrategy::new()),
        sh_paths(),
    )
    .with_hooks(hooks);

    let stats = scheduler.run_loop("fallback", fast_loop(1, 3)).await;

    assert_eq!(stats.completed, 1);
    assert!(selector.is_using_fallback());
    let task = backend.get_task("t").await.unwrap().unwrap();
    assert!(task.comment.as_deref().unwrap().contains("claude/c-ok"));
    assert_eq!(recorder.last_attempts.lock().unwrap().unwrap(), 3);
}

// ---------------------------------------------------------------------------
// Scenario: per-attempt timeout with hard-kill escalation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timed_out_task_fails_with_timeout_reason() {
    let backend = Arc::new(MemoryBackend::with_tasks([Task::new("t", "task")]));
    let recorder = Arc::new(Recorder::default());

    // The per-model timeout (1s) wins over the generous global (10s).
    let descriptor =
        model("slow", "trap '' TERM; sleep 10").with_timeout_ms(1_000);
    let scheduler = build(
        backend.clone(),
        vec![descriptor],
        ShStrategy::new(),
        recorder.clone(),
    );

    let start = Instant::now();
    let stats = scheduler.run_loop("timeout", fast_loop(1, 1)).await;

    assert_eq!(stats.failed, 1);
    assert!(start.elapsed() < Duration::from_secs(5));
    let task = backend.get_task("t").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.last_error.as_deref().unwrap().contains("timed out"));
}

// ---------------------------------------------------------------------------
// Scenario: no models at all
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_model_pool_exits_without_claiming() {
    let backend = Arc::new(MemoryBackend::with_tasks([Task::new("t", "task")]));
    let recorder = Arc::new(Recorder::default());
    let scheduler = build(backend.clone(), Vec::new(), ShStrategy::new(), recorder.clone());

    let stats = scheduler.run_loop("empty", fast_loop(2, 3)).await;

    assert_eq!(stats.completed, 0);
    assert_eq!(stats.failed, 0);
    // Loop hooks still fire; task hooks never do.
    assert_eq!(recorder.loop_starts.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.loop_ends.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.task_starts.load(Ordering::SeqCst), 0);
    assert_eq!(
        backend.get_task("t").await.unwrap().unwrap().status,
        TaskStatus::Pending
    );
}

// ---------------------------------------------------------------------------
// Invariants: exclusion, terminality, budget, hook isolation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn one_task_many_workers_runs_once() {
    let backend = Arc::new(MemoryBackend::with_tasks([Task::new("only", "task")]));
    let recorder = Arc::new(Recorder::default());
    let scheduler = build(
        backend.clone(),
        vec![model("sonnet", "echo ok")],
        ShStrategy::new(),
        recorder.clone(),
    );

    let stats = scheduler.run_loop("exclusion", fast_loop(4, 3)).await;

    assert_eq!(stats.completed, 1);
    assert_eq!(recorder.task_starts.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.task_completes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn every_started_task_reaches_exactly_one_terminal_state() {
    let backend = Arc::new(MemoryBackend::with_tasks([
        Task::new("ok-1", "a"),
        Task::new("bad", "b"),
        Task::new("ok-2", "c"),
    ]));
    let recorder = Arc::new(Recorder::default());

    // One model succeeds only for titles not containing "b": simulate a
    // mixed queue with a script keyed on the prompt over stdin.
    let script = "p=$(cat); if [ \"$p\" = b ]; then exit 1; else echo ok; fi";
    let scheduler = build(
        backend.clone(),
        vec![model("sonnet", script)],
        ShStrategy::new().with_prompt_on_stdin(),
        recorder.clone(),
    );

    let stats = scheduler.run_loop("terminality", fast_loop(2, 2)).await;

    assert_eq!(stats.completed + stats.failed, 3);
    for task in backend.all_tasks() {
        assert!(task.status.is_terminal(), "{} not terminal", task.id);
    }
    assert_eq!(
        backend.get_task("bad").await.unwrap().unwrap().status,
        TaskStatus::Failed
    );
}

#[tokio::test]
async fn iteration_budget_stops_new_claims() {
    let tasks: Vec<Task> = (0..5).map(|i| Task::new(format!("t{i}"), "x")).collect();
    let backend = Arc::new(MemoryBackend::with_tasks(tasks));
    let recorder = Arc::new(Recorder::default());
    let scheduler = build(
        backend.clone(),
        vec![model("sonnet", "echo ok")],
        ShStrategy::new(),
        recorder.clone(),
    );

    let mut config = fast_loop(1, 3);
    config.max_iterations = Some(2);
    let stats = scheduler.run_loop("budget", config).await;

    assert_eq!(stats.completed, 2);
    let pending = backend
        .all_tasks()
        .into_iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .count();
    assert_eq!(pending, 3);
}

#[tokio::test]
async fn panicking_hook_leaves_backend_state_unchanged() {
    struct Exploding;

    #[async_trait]
    impl LifecycleHook for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        async fn on_task_start(&self, _ctx: &TaskContext) -> Result<(), GaleError> {
            panic!("hook bug");
        }

        async fn on_task_complete(
            &self,
            _ctx: &TaskContext,
            _result: &RetryOutcome,
        ) -> Result<(), GaleError> {
            panic!("hook bug");
        }
    }

    let backend = Arc::new(MemoryBackend::with_tasks([Task::new("t", "task")]));
    let selector = Arc::new(ModelSelector::new(
        SelectionStrategy::RoundRobin,
        vec![model("sonnet", "echo ok")],
    ));
    let mut hooks = HookSet::new();
    hooks.register(Arc::new(Exploding));
    let scheduler = Scheduler::new(
        backend.clone(),
        selector,
        strategies(ShStrategy::new()),
        sh_paths(),
    )
    .with_hooks(hooks);

    let stats = scheduler.run_loop("hook-isolation", fast_loop(1, 3)).await;

    // Same terminal state as a run without the hook.
    assert_eq!(stats.completed, 1);
    assert_eq!(
        backend.get_task("t").await.unwrap().unwrap().status,
        TaskStatus::Completed
    );
}

// ---------------------------------------------------------------------------
// Quarantine and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn spawn_error_quarantines_with_default_threshold() {
    let backend = Arc::new(MemoryBackend::with_tasks([Task::new("t", "task")]));
    let recorder = Arc::new(Recorder::default());

    let selector = Arc::new(ModelSelector::new(
        SelectionStrategy::RoundRobin,
        vec![model("sonnet", "echo ok")],
    ));
    let mut hooks = HookSet::new();
    hooks.register(recorder.clone());
    // Executable path points at nothing.
    let paths = HashMap::from([(CliKind::Claude, "/definitely/not/real".to_string())]);
    let scheduler = Scheduler::new(backend.clone(), selector, strategies(ShStrategy::new()), paths)
        .with_hooks(hooks);

    // The shipped default threshold must be enough: non-recoverable
    // errors stop the retry loop on first occurrence.
    let mut config = fast_loop(1, 3);
    config.retry.quarantine_after = RetrySettings::default().quarantine_after;
    let stats = scheduler.run_loop("quarantine", config).await;

    assert_eq!(stats.failed, 1);
    let task = backend.get_task("t").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Quarantined);
    assert!(task.last_error.as_deref().unwrap().contains("could not spawn"));
}

#[tokio::test]
async fn retryable_exhaustion_fails_rather_than_quarantines() {
    let backend = Arc::new(MemoryBackend::with_tasks([Task::new("t", "task")]));
    let recorder = Arc::new(Recorder::default());
    let scheduler = build(
        backend.clone(),
        vec![model("sonnet", "echo nope >&2; exit 1")],
        ShStrategy::new(),
        recorder.clone(),
    );

    let mut config = fast_loop(1, 2);
    config.retry.quarantine_after = Some(2);
    let stats = scheduler.run_loop("exhausted", config).await;

    assert_eq!(stats.failed, 1);
    let task = backend.get_task("t").await.unwrap().unwrap();
    // Plain failures stay failed so a later run can be re-pointed at them.
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task
        .last_error
        .as_deref()
        .unwrap()
        .contains("exhausted 2 attempts"));
}

#[tokio::test]
async fn cancellation_drains_and_marks_claimed_task_failed() {
    let backend = Arc::new(MemoryBackend::with_tasks([Task::new("t", "task")]));
    let recorder = Arc::new(Recorder::default());
    let cancel = CancellationToken::new();

    let selector = Arc::new(ModelSelector::new(
        SelectionStrategy::RoundRobin,
        vec![model("slow", "sleep 10")],
    ));
    let mut hooks = HookSet::new();
    hooks.register(recorder.clone());
    let scheduler = Scheduler::new(
        backend.clone(),
        selector,
        strategies(ShStrategy::new()),
        sh_paths(),
    )
    .with_hooks(hooks)
    .with_cancellation(cancel.clone());

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let start = Instant::now();
    let stats = scheduler.run_loop("cancel", fast_loop(1, 3)).await;

    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(stats.failed, 1);
    let task = backend.get_task("t").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.last_error.as_deref(), Some("cancelled"));
    assert_eq!(recorder.task_fails.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Prompt flow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn prompt_provider_output_reaches_the_child() {
    let backend = Arc::new(MemoryBackend::with_tasks([Task::new("t", "fix the login page")]));
    let recorder = Arc::new(Recorder::default());

    let selector = Arc::new(ModelSelector::new(
        SelectionStrategy::RoundRobin,
        vec![model("echoing", "cat")],
    ));
    let mut hooks = HookSet::new();
    hooks.register(recorder.clone());
    let scheduler = Scheduler::new(
        backend,
        selector,
        strategies(ShStrategy::new().with_prompt_on_stdin()),
        sh_paths(),
    )
    .with_hooks(hooks)
    .with_prompt_provider(Arc::new(|task: &Task| format!("TASK: {}", task.title)));

    let stats = scheduler.run_loop("prompt", fast_loop(1, 1)).await;

    assert_eq!(stats.completed, 1);
    assert_eq!(
        recorder.last_stdout.lock().unwrap().as_deref(),
        Some("TASK: fix the login page")
    );
}
