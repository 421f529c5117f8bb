use thiserror::Error;

#[derive(Debug, Error)]
pub enum GaleError {
    #[error("rate limited on {model}")]
    RateLimited { model: String },

    #[error("quota exhausted on {model}")]
    QuotaExhausted { model: String },

    #[error("corrupt local cache for {cli} CLI")]
    CacheCorrupt { cli: String },

    #[error("timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("failed to spawn {executable}: {message}")]
    SpawnError { executable: String, message: String },

    #[error("no model available in primary or fallback pool")]
    NoModelAvailable,

    #[error("no strategy registered for {cli} CLI")]
    NoStrategy { cli: String },

    #[error("backend error: {message}")]
    Backend { message: String },

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("{reason}")]
    TaskFailed { reason: String },
}

impl GaleError {
    /// Whether the resilience engine may retry after this error.
    /// Encodes the engine-wide taxonomy: rate limits, quota, corrupt
    /// caches, timeouts, and plain task failures are transient; spawn
    /// errors, cancellation, and pool exhaustion are not.
    pub fn retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. }
            | Self::QuotaExhausted { .. }
            | Self::CacheCorrupt { .. }
            | Self::Timeout { .. }
            | Self::TaskFailed { .. } => true,
            Self::Cancelled
            | Self::SpawnError { .. }
            | Self::NoModelAvailable
            | Self::NoStrategy { .. }
            | Self::Backend { .. }
            | Self::Config { .. } => false,
        }
    }

    /// Whether the last attempt hit a provider rate limit. The retry
    /// loop floors its delay at `rate_limit_wait` when this holds.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Extract the model name from variants that carry one.
    pub fn model(&self) -> Option<&str> {
        match self {
            Self::RateLimited { model } => Some(model),
            Self::QuotaExhausted { model } => Some(model),
            _ => None,
        }
    }

    /// Short tag for attempt records and task failure reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate-limited",
            Self::QuotaExhausted { .. } => "quota-exhausted",
            Self::CacheCorrupt { .. } => "cache-corrupt",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::SpawnError { .. } => "spawn-error",
            Self::NoModelAvailable => "no-model-available",
            Self::NoStrategy { .. } => "no-strategy",
            Self::Backend { .. } => "backend-error",
            Self::Config { .. } => "config-error",
            Self::TaskFailed { .. } => "failure",
        }
    }

    /// Human-readable reason written to the task backend on terminal
    /// failure. Does not leak stderr bodies or internal paths.
    pub fn user_message(&self) -> String {
        match self {
            Self::RateLimited { model } => format!("rate-limited on {model}"),
            Self::QuotaExhausted { model } => format!("quota exhausted on {model}"),
            Self::CacheCorrupt { cli } => format!("corrupt cache for {cli}"),
            Self::Timeout { ms } => format!("timed out after {ms}ms"),
            Self::Cancelled => "cancelled".to_string(),
            Self::SpawnError { executable, .. } => format!("could not spawn {executable}"),
            Self::NoModelAvailable => "no model available".to_string(),
            Self::NoStrategy { cli } => format!("no strategy for {cli}"),
            Self::Backend { .. } => "task backend error".to_string(),
            Self::Config { message } => format!("configuration error: {message}"),
            Self::TaskFailed { reason } => reason.clone(),
        }
    }
}
