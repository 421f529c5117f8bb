use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::classifier::RunMetrics;
use crate::error::GaleError;

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Decides whether a failed attempt gets another try.
pub trait RetryStrategy: Send + Sync {
    fn should_retry(&self, attempt: u32, error: &GaleError) -> bool;
    fn max_attempts(&self) -> u32;
}

/// Retry up to a fixed attempt count, but only for retryable errors.
pub struct FixedAttempts {
    max: u32,
}

impl FixedAttempts {
    pub fn new(max: u32) -> Self {
        Self { max: max.max(1) }
    }
}

impl RetryStrategy for FixedAttempts {
    fn should_retry(&self, attempt: u32, error: &GaleError) -> bool {
        attempt < self.max && error.retryable()
    }

    fn max_attempts(&self) -> u32 {
        self.max
    }
}

/// Computes the wait before an attempt. `compute_delay(1, _)` is always
/// zero; nothing has failed yet.
pub trait BackoffPolicy: Send + Sync {
    fn compute_delay(&self, attempt: u32, last_error: Option<&GaleError>) -> Duration;
    fn base_delay(&self) -> Duration;
}

/// Delay doubles per retry: base, 2*base, 4*base, … capped at `max`,
/// with a uniform jitter factor (0.5 means delay * 0.5..1.5) to avoid
/// synchronized retry spikes across workers.
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            base,
            max,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(120), 0.5)
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn compute_delay(&self, attempt: u32, _last_error: Option<&GaleError>) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let pow = (attempt - 2).min(16);
        let raw = self.base.saturating_mul(2_u32.saturating_pow(pow));
        apply_jitter(raw.min(self.max), self.jitter)
    }

    fn base_delay(&self) -> Duration {
        self.base
    }
}

/// base, 2*base, 3*base, … capped at `max`.
pub struct LinearBackoff {
    base: Duration,
    max: Duration,
}

impl LinearBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }
}

impl BackoffPolicy for LinearBackoff {
    fn compute_delay(&self, attempt: u32, _last_error: Option<&GaleError>) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        self.base.saturating_mul(attempt - 1).min(self.max)
    }

    fn base_delay(&self) -> Duration {
        self.base
    }
}

/// Same delay before every retry.
pub struct ConstantBackoff {
    delay: Duration,
}

impl ConstantBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl BackoffPolicy for ConstantBackoff {
    fn compute_delay(&self, attempt: u32, _last_error: Option<&GaleError>) -> Duration {
        if attempt <= 1 {
            Duration::ZERO
        } else {
            self.delay
        }
    }

    fn base_delay(&self) -> Duration {
        self.delay
    }
}

/// Immediate retries.
pub struct NoBackoff;

impl BackoffPolicy for NoBackoff {
    fn compute_delay(&self, _attempt: u32, _last_error: Option<&GaleError>) -> Duration {
        Duration::ZERO
    }

    fn base_delay(&self) -> Duration {
        Duration::ZERO
    }
}

/// Jitter factor of 0.5 maps delay to delay * (0.5..1.5).
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let random: f64 = rand::thread_rng().r#gen();
    let factor = 1.0 - jitter + random * 2.0 * jitter;
    Duration::from_millis((delay.as_millis() as f64 * factor).round() as u64)
}

/// What one successful CLI attempt produced.
#[derive(Debug, Clone)]
pub struct AttemptSuccess {
    pub model_used: String,
    pub display_name: String,
    pub exit_code: i32,
    pub stdout: String,
    pub wall_ms: u64,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    pub metrics: RunMetrics,
}

/// One entry in a retry loop's history.
#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    pub attempt_no: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    pub started_at_ms: u64,
    pub ended_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    /// Terminal label of this attempt: `success` or an error kind.
    pub classification: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Final outcome of a retry loop.
#[derive(Debug)]
pub struct RetryOutcome {
    pub success: bool,
    pub attempts: u32,
    pub total_duration_ms: u64,
    pub result: Option<AttemptSuccess>,
    pub attempt_history: Vec<Attempt>,
    pub final_error: Option<GaleError>,
}

/// Monotonic counters across every `execute` call; resettable.
#[derive(Debug, Default)]
pub struct ResilienceStats {
    total_ops: AtomicU64,
    successful_ops: AtomicU64,
    failed_ops: AtomicU64,
    total_attempts: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_ops: u64,
    pub successful_ops: u64,
    pub failed_ops: u64,
    pub total_attempts: u64,
}

impl ResilienceStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_ops: self.total_ops.load(Ordering::Relaxed),
            successful_ops: self.successful_ops.load(Ordering::Relaxed),
            failed_ops: self.failed_ops.load(Ordering::Relaxed),
            total_attempts: self.total_attempts.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.total_ops.store(0, Ordering::Relaxed);
        self.successful_ops.store(0, Ordering::Relaxed);
        self.failed_ops.store(0, Ordering::Relaxed);
        self.total_attempts.store(0, Ordering::Relaxed);
    }
}

type RetryCallback = Box<dyn Fn(u32, &GaleError) + Send + Sync>;

/// Wraps one task attempt with retry and backoff. The runner owns the
/// per-attempt timeout; this engine adds none of its own.
pub struct ResilienceEngine {
    strategy: Box<dyn RetryStrategy>,
    backoff: Box<dyn BackoffPolicy>,
    /// Floor applied to the computed delay when the previous attempt was
    /// rate limited.
    rate_limit_wait: Duration,
    stats: ResilienceStats,
    on_retry: Option<RetryCallback>,
}

impl ResilienceEngine {
    pub fn new(strategy: Box<dyn RetryStrategy>, backoff: Box<dyn BackoffPolicy>) -> Self {
        Self {
            strategy,
            backoff,
            rate_limit_wait: Duration::from_secs(60),
            stats: ResilienceStats::default(),
            on_retry: None,
        }
    }

    pub fn with_rate_limit_wait(mut self, wait: Duration) -> Self {
        self.rate_limit_wait = wait;
        self
    }

    pub fn with_on_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(u32, &GaleError) + Send + Sync + 'static,
    {
        self.on_retry = Some(Box::new(f));
        self
    }

    pub fn stats(&self) -> &ResilienceStats {
        &self.stats
    }

    pub fn max_attempts(&self) -> u32 {
        self.strategy.max_attempts()
    }

    /// Drive `op` to success or exhaustion. The sleep between attempts
    /// and the attempt itself both observe `cancel`; cancellation ends
    /// the loop immediately with `GaleError::Cancelled`.
    pub async fn execute<F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<AttemptSuccess, GaleError>>,
    {
        let loop_start = Instant::now();
        self.stats.total_ops.fetch_add(1, Ordering::Relaxed);

        let mut history: Vec<Attempt> = Vec::new();
        let mut last_error: Option<GaleError> = None;

        for attempt in 1..=self.strategy.max_attempts() {
            let mut delay = self.backoff.compute_delay(attempt, last_error.as_ref());
            if last_error.as_ref().is_some_and(GaleError::is_rate_limited) {
                delay = delay.max(self.rate_limit_wait);
            }

            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return self.finish(loop_start, history, Some(GaleError::Cancelled));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return self.finish(loop_start, history, Some(GaleError::Cancelled));
            }

            let started_at_ms = epoch_ms();
            self.stats.total_attempts.fetch_add(1, Ordering::Relaxed);
            let result = op(attempt).await;
            let ended_at_ms = epoch_ms();

            match result {
                Ok(success) => {
                    history.push(Attempt {
                        attempt_no: attempt,
                        model_used: Some(success.model_used.clone()),
                        started_at_ms,
                        ended_at_ms,
                        exit_code: Some(success.exit_code),
                        stdout_bytes: success.stdout_bytes,
                        stderr_bytes: success.stderr_bytes,
                        classification: "success".to_string(),
                        tokens_in: success.metrics.tokens_in,
                        tokens_out: success.metrics.tokens_out,
                        error: None,
                    });
                    self.stats.successful_ops.fetch_add(1, Ordering::Relaxed);
                    return RetryOutcome {
                        success: true,
                        attempts: attempt,
                        total_duration_ms: loop_start.elapsed().as_millis() as u64,
                        result: Some(success),
                        attempt_history: history,
                        final_error: None,
                    };
                }
                Err(error) => {
                    history.push(Attempt {
                        attempt_no: attempt,
                        model_used: error.model().map(str::to_string),
                        started_at_ms,
                        ended_at_ms,
                        exit_code: None,
                        stdout_bytes: 0,
                        stderr_bytes: 0,
                        classification: error.kind().to_string(),
                        tokens_in: None,
                        tokens_out: None,
                        error: Some(error.to_string()),
                    });

                    let retry = self.strategy.should_retry(attempt, &error);
                    if retry {
                        tracing::debug!(attempt, error = %error, "attempt failed, retrying");
                        if let Some(ref cb) = self.on_retry {
                            cb(attempt, &error);
                        }
                        last_error = Some(error);
                    } else {
                        return self.finish(loop_start, history, Some(error));
                    }
                }
            }
        }

        self.finish(loop_start, history, last_error)
    }

    fn finish(
        &self,
        loop_start: Instant,
        history: Vec<Attempt>,
        final_error: Option<GaleError>,
    ) -> RetryOutcome {
        self.stats.failed_ops.fetch_add(1, Ordering::Relaxed);
        RetryOutcome {
            success: false,
            attempts: history.len() as u32,
            total_duration_ms: loop_start.elapsed().as_millis() as u64,
            result: None,
            attempt_history: history,
            final_error,
        }
    }
}
