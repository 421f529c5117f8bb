use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::GaleError;
use crate::hooks::{LifecycleHook, TaskContext};
use crate::resilience::{Attempt, RetryOutcome};
use crate::scheduler::LoopStats;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Serialize)]
struct TaskSummary {
    task_id: String,
    title: String,
    outcome: String,
    attempts: u32,
    duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    model_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct SessionFile<'a> {
    session_id: &'a str,
    namespace: &'a str,
    started_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<LoopStats>,
    tasks: &'a [TaskSummary],
}

#[derive(Debug, Serialize)]
struct MonitorState<'a> {
    namespace: &'a str,
    session_id: &'a str,
    updated_at_ms: u64,
    stats: LoopStats,
}

#[derive(Default)]
struct RecorderState {
    namespace: String,
    session_dir: Option<PathBuf>,
    started_at_ms: u64,
    tasks: Vec<TaskSummary>,
}

/// Lifecycle hook that persists one run under
/// `<root>/runs/<namespace>/<session-id>/{session.json,logs/}` plus a
/// `monitor-state.json` at the root. The engine itself writes nothing
/// persistent; this collaborator does, and any write failure is logged
/// and swallowed like every other hook error.
pub struct SessionRecorder {
    root: PathBuf,
    session_id: String,
    state: Mutex<RecorderState>,
}

impl SessionRecorder {
    pub const DEFAULT_ROOT: &'static str = ".gale";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        // Epoch millis + pid + counter keeps ids unique across
        // concurrent processes, same scheme as the task file writes.
        let session_id = format!(
            "{}-{}-{}",
            epoch_ms(),
            std::process::id(),
            SESSION_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        Self {
            root: root.into(),
            session_id,
            state: Mutex::new(RecorderState::default()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn session_dir(&self) -> Option<PathBuf> {
        self.state
            .lock()
            .expect("session state lock poisoned")
            .session_dir
            .clone()
    }

    async fn write_session(&self) -> Result<(), GaleError> {
        let (dir, payload) = {
            let state = self.state.lock().expect("session state lock poisoned");
            let Some(dir) = state.session_dir.clone() else {
                return Ok(());
            };
            let file = SessionFile {
                session_id: &self.session_id,
                namespace: &state.namespace,
                started_at_ms: state.started_at_ms,
                finished_at_ms: None,
                stats: None,
                tasks: &state.tasks,
            };
            (dir, serde_json::to_string_pretty(&file).map_err(io_err)?)
        };
        write_atomic(&dir.join("session.json"), payload.as_bytes()).await
    }

    fn record_task(&self, summary: TaskSummary) -> Option<PathBuf> {
        let mut state = self.state.lock().expect("session state lock poisoned");
        let dir = state.session_dir.clone();
        state.tasks.push(summary);
        dir
    }
}

fn io_err(e: impl std::fmt::Display) -> GaleError {
    GaleError::Backend {
        message: e.to_string(),
    }
}

/// Atomic write: temp file + rename prevents partial reads.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), GaleError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
    }
    let tmp = path.with_extension("tmp");
    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_err(e));
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_err(e));
    }
    Ok(())
}

#[async_trait]
impl LifecycleHook for SessionRecorder {
    fn name(&self) -> &str {
        "session-recorder"
    }

    async fn on_loop_start(&self, namespace: &str) -> Result<(), GaleError> {
        let dir = self
            .root
            .join("runs")
            .join(namespace)
            .join(&self.session_id);
        tokio::fs::create_dir_all(dir.join("logs")).await.map_err(io_err)?;

        {
            let mut state = self.state.lock().expect("session state lock poisoned");
            state.namespace = namespace.to_string();
            state.session_dir = Some(dir);
            state.started_at_ms = epoch_ms();
            state.tasks.clear();
        }
        self.write_session().await
    }

    async fn on_task_complete(
        &self,
        ctx: &TaskContext,
        result: &RetryOutcome,
    ) -> Result<(), GaleError> {
        let summary = TaskSummary {
            task_id: ctx.task.id.clone(),
            title: ctx.task.title.clone(),
            outcome: "completed".to_string(),
            attempts: result.attempts,
            duration_ms: result.total_duration_ms,
            model_used: result.result.as_ref().map(|r| r.model_used.clone()),
            error: None,
        };
        if let Some(dir) = self.record_task(summary) {
            write_task_log(&dir, &ctx.task.id, "completed", &result.attempt_history).await?;
        }
        self.write_session().await
    }

    async fn on_task_failed(&self, ctx: &TaskContext, error: &GaleError) -> Result<(), GaleError> {
        let summary = TaskSummary {
            task_id: ctx.task.id.clone(),
            title: ctx.task.title.clone(),
            outcome: "failed".to_string(),
            attempts: 0,
            duration_ms: 0,
            model_used: None,
            error: Some(error.user_message()),
        };
        if let Some(dir) = self.record_task(summary) {
            write_task_log(&dir, &ctx.task.id, "failed", &[]).await?;
        }
        self.write_session().await
    }

    async fn on_loop_end(&self, stats: &LoopStats) -> Result<(), GaleError> {
        let (dir, session_payload, monitor_payload) = {
            let state = self.state.lock().expect("session state lock poisoned");
            let Some(dir) = state.session_dir.clone() else {
                return Ok(());
            };
            let session = SessionFile {
                session_id: &self.session_id,
                namespace: &state.namespace,
                started_at_ms: state.started_at_ms,
                finished_at_ms: Some(epoch_ms()),
                stats: Some(*stats),
                tasks: &state.tasks,
            };
            let monitor = MonitorState {
                namespace: &state.namespace,
                session_id: &self.session_id,
                updated_at_ms: epoch_ms(),
                stats: *stats,
            };
            (
                dir,
                serde_json::to_string_pretty(&session).map_err(io_err)?,
                serde_json::to_string_pretty(&monitor).map_err(io_err)?,
            )
        };

        write_atomic(&dir.join("session.json"), session_payload.as_bytes()).await?;
        write_atomic(&self.root.join("monitor-state.json"), monitor_payload.as_bytes()).await
    }
}

async fn write_task_log(
    session_dir: &Path,
    task_id: &str,
    outcome: &str,
    attempts: &[Attempt],
) -> Result<(), GaleError> {
    let safe_id: String = task_id
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let payload = serde_json::json!({
        "task_id": task_id,
        "outcome": outcome,
        "attempts": attempts,
    });
    let json = serde_json::to_string_pretty(&payload).map_err(io_err)?;
    write_atomic(
        &session_dir.join("logs").join(format!("{safe_id}.json")),
        json.as_bytes(),
    )
    .await
}
