pub mod file;
pub mod memory;

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GaleError;

pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Task lifecycle: `pending → in-progress → (completed | failed |
/// quarantined)`. No back-transitions from terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    /// Terminal state for tasks that exhausted every retry with a
    /// non-recoverable classification.
    Quarantined,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Quarantined
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    High,
    #[default]
    Medium,
    Low,
}

impl TaskPriority {
    /// Lower rank dispatches first.
    pub fn rank(&self) -> u8 {
        match self {
            TaskPriority::High => 0,
            TaskPriority::Medium => 1,
            TaskPriority::Low => 2,
        }
    }
}

/// A unit of work. The engine never interprets `title` beyond handing
/// it to the prompt provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub depends_on: HashSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub created_at_ms: u64,
    #[serde(default)]
    pub updated_at_ms: u64,
    /// Human-readable reason recorded on failure or quarantine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Completion comment recorded on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = epoch_ms();
        Self {
            id: id.into(),
            title: title.into(),
            status: TaskStatus::Pending,
            priority: TaskPriority::default(),
            feature: None,
            depends_on: HashSet::new(),
            parent_id: None,
            created_at_ms: now,
            updated_at_ms: now,
            last_error: None,
            comment: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.feature = Some(feature.into());
        self
    }

    pub fn with_depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = ids.into_iter().map(Into::into).collect();
        self
    }
}

/// Narrowing applied to `find_next_task` / `list_pending`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub feature: Option<String>,
    pub priority: Option<TaskPriority>,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(ref feature) = self.feature
            && task.feature.as_deref() != Some(feature.as_str())
        {
            return false;
        }
        if let Some(priority) = self.priority
            && task.priority != priority
        {
            return false;
        }
        true
    }
}

/// Result of a state-transition call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkResult {
    pub success: bool,
    pub reason: Option<String>,
}

impl MarkResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            reason: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PingResult {
    pub ok: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

/// Where tasks live. `mark_in_progress` is the exclusion primitive: for
/// any task id it reports success to at most one concurrent caller. The
/// backend alone decides ordering (`priority`, `feature`, `depends_on`)
/// and persistence.
#[async_trait]
pub trait TaskBackend: Send + Sync {
    async fn find_next_task(&self, filter: &TaskFilter) -> Result<Option<Task>, GaleError>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>, GaleError>;

    /// Claim a pending task. Atomic across concurrent callers.
    async fn mark_in_progress(&self, id: &str) -> Result<MarkResult, GaleError>;

    async fn mark_completed(&self, id: &str, comment: Option<&str>)
        -> Result<MarkResult, GaleError>;

    async fn mark_failed(&self, id: &str, error: &str) -> Result<MarkResult, GaleError>;

    async fn mark_quarantined(&self, id: &str, reason: &str) -> Result<MarkResult, GaleError>;

    async fn reset_to_pending(&self, id: &str) -> Result<MarkResult, GaleError>;

    async fn list_pending(&self, filter: &TaskFilter) -> Result<Vec<Task>, GaleError>;

    async fn count_pending(&self, filter: &TaskFilter) -> Result<usize, GaleError>;

    async fn get_dependencies(&self, id: &str) -> Result<Vec<Task>, GaleError>;

    async fn are_dependencies_met(&self, id: &str) -> Result<bool, GaleError>;

    async fn ping(&self) -> PingResult;
}
