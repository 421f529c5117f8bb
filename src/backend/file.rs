use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::backend::{
    epoch_ms, MarkResult, PingResult, Task, TaskBackend, TaskFilter, TaskStatus,
};
use crate::error::GaleError;

/// On-disk shape of the task file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct TaskFile {
    #[serde(default)]
    tasks: Vec<Task>,
}

/// Task backend persisted as a single JSON file. Every operation
/// reloads, mutates, and atomically rewrites the file under an internal
/// async mutex; that mutex is what makes `mark_in_progress` atomic for
/// every worker of this process. Cross-process exclusion is out of
/// scope; point two engines at different task files.
pub struct JsonFileBackend {
    path: PathBuf,
    lock: Mutex<()>,
    stuck_after: Duration,
}

impl JsonFileBackend {
    pub const DEFAULT_STUCK_AFTER: Duration = Duration::from_secs(30 * 60);

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
            stuck_after: Self::DEFAULT_STUCK_AFTER,
        }
    }

    pub fn with_stuck_after(mut self, stuck_after: Duration) -> Self {
        self.stuck_after = stuck_after;
        self
    }

    /// Open with the resume knob: in-progress tasks whose last update is
    /// older than `stuck_after` (a crash between claim and terminal
    /// write) are reset to pending before the loop starts.
    pub async fn open_resuming(path: impl Into<PathBuf>) -> Result<Self, GaleError> {
        let backend = Self::new(path);
        let _guard = backend.lock.lock().await;
        let mut file = backend.load().await?;
        let cutoff = epoch_ms().saturating_sub(backend.stuck_after.as_millis() as u64);
        let mut recovered = 0;
        for task in file.tasks.iter_mut() {
            if task.status == TaskStatus::InProgress && task.updated_at_ms <= cutoff {
                task.status = TaskStatus::Pending;
                task.updated_at_ms = epoch_ms();
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::info!(recovered, path = %backend.path.display(), "reset stuck in-progress tasks");
            backend.save(&file).await?;
        }
        drop(_guard);
        Ok(backend)
    }

    pub async fn seed_tasks<I>(&self, tasks: I) -> Result<(), GaleError>
    where
        I: IntoIterator<Item = Task>,
    {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        file.tasks.extend(tasks);
        self.save(&file).await
    }

    async fn load(&self) -> Result<TaskFile, GaleError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| GaleError::Backend {
                message: format!("corrupt task file {}: {e}", self.path.display()),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(TaskFile::default()),
            Err(e) => Err(GaleError::Backend {
                message: format!("read {}: {e}", self.path.display()),
            }),
        }
    }

    /// Atomic write: temp file + rename prevents partial reads.
    async fn save(&self, file: &TaskFile) -> Result<(), GaleError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GaleError::Backend {
                    message: format!("create {}: {e}", parent.display()),
                })?;
        }

        let json = serde_json::to_string_pretty(file).map_err(|e| GaleError::Backend {
            message: format!("serialize task file: {e}"),
        })?;

        let tmp = self.path.with_extension("tmp");
        if let Err(e) = tokio::fs::write(&tmp, json.as_bytes()).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(GaleError::Backend {
                message: format!("write {}: {e}", tmp.display()),
            });
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(GaleError::Backend {
                message: format!("rename {}: {e}", self.path.display()),
            });
        }
        Ok(())
    }

    fn deps_met(tasks: &[Task], task: &Task) -> bool {
        task.depends_on.iter().all(|dep| {
            tasks
                .iter()
                .find(|t| t.id == *dep)
                .is_none_or(|t| t.status == TaskStatus::Completed)
        })
    }

    async fn transition<F>(&self, id: &str, apply: F) -> Result<MarkResult, GaleError>
    where
        F: FnOnce(&mut Task) -> MarkResult,
    {
        let _guard = self.lock.lock().await;
        let mut file = self.load().await?;
        let Some(task) = file.tasks.iter_mut().find(|t| t.id == id) else {
            return Ok(MarkResult::rejected(format!("no such task: {id}")));
        };
        let result = apply(task);
        if result.success {
            task.updated_at_ms = epoch_ms();
            self.save(&file).await?;
        }
        Ok(result)
    }
}

#[async_trait]
impl TaskBackend for JsonFileBackend {
    async fn find_next_task(&self, filter: &TaskFilter) -> Result<Option<Task>, GaleError> {
        let _guard = self.lock.lock().await;
        let file = self.load().await?;
        let mut candidates: Vec<&Task> = file
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| filter.matches(t))
            .filter(|t| Self::deps_met(&file.tasks, t))
            .collect();
        candidates.sort_by_key(|t| t.priority.rank());
        Ok(candidates.first().map(|t| (*t).clone()))
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, GaleError> {
        let _guard = self.lock.lock().await;
        let file = self.load().await?;
        Ok(file.tasks.into_iter().find(|t| t.id == id))
    }

    async fn mark_in_progress(&self, id: &str) -> Result<MarkResult, GaleError> {
        self.transition(id, |task| {
            if task.status == TaskStatus::Pending {
                task.status = TaskStatus::InProgress;
                MarkResult::ok()
            } else {
                MarkResult::rejected(format!("task is {:?}, not pending", task.status))
            }
        })
        .await
    }

    async fn mark_completed(
        &self,
        id: &str,
        comment: Option<&str>,
    ) -> Result<MarkResult, GaleError> {
        let comment = comment.map(str::to_string);
        self.transition(id, move |task| {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Completed;
                task.comment = comment;
                MarkResult::ok()
            } else {
                MarkResult::rejected(format!("task is {:?}, not in-progress", task.status))
            }
        })
        .await
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<MarkResult, GaleError> {
        let error = error.to_string();
        self.transition(id, move |task| {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Failed;
                task.last_error = Some(error);
                MarkResult::ok()
            } else {
                MarkResult::rejected(format!("task is {:?}, not in-progress", task.status))
            }
        })
        .await
    }

    async fn mark_quarantined(&self, id: &str, reason: &str) -> Result<MarkResult, GaleError> {
        let reason = reason.to_string();
        self.transition(id, move |task| {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Quarantined;
                task.last_error = Some(reason);
                MarkResult::ok()
            } else {
                MarkResult::rejected(format!("task is {:?}, not in-progress", task.status))
            }
        })
        .await
    }

    async fn reset_to_pending(&self, id: &str) -> Result<MarkResult, GaleError> {
        self.transition(id, |task| {
            if task.status.is_terminal() || task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Pending;
                task.last_error = None;
                MarkResult::ok()
            } else {
                MarkResult::rejected("task already pending".to_string())
            }
        })
        .await
    }

    async fn list_pending(&self, filter: &TaskFilter) -> Result<Vec<Task>, GaleError> {
        let _guard = self.lock.lock().await;
        let file = self.load().await?;
        Ok(file
            .tasks
            .into_iter()
            .filter(|t| t.status == TaskStatus::Pending && filter.matches(t))
            .collect())
    }

    async fn count_pending(&self, filter: &TaskFilter) -> Result<usize, GaleError> {
        Ok(self.list_pending(filter).await?.len())
    }

    async fn get_dependencies(&self, id: &str) -> Result<Vec<Task>, GaleError> {
        let _guard = self.lock.lock().await;
        let file = self.load().await?;
        let Some(task) = file.tasks.iter().find(|t| t.id == id) else {
            return Ok(Vec::new());
        };
        let deps = task.depends_on.clone();
        Ok(file
            .tasks
            .into_iter()
            .filter(|t| deps.contains(&t.id))
            .collect())
    }

    async fn are_dependencies_met(&self, id: &str) -> Result<bool, GaleError> {
        let _guard = self.lock.lock().await;
        let file = self.load().await?;
        Ok(file
            .tasks
            .iter()
            .find(|t| t.id == id)
            .is_some_and(|t| Self::deps_met(&file.tasks, t)))
    }

    async fn ping(&self) -> PingResult {
        let start = Instant::now();
        match self.load().await {
            Ok(_) => PingResult {
                ok: true,
                latency_ms: start.elapsed().as_millis() as u64,
                error: None,
            },
            Err(e) => PingResult {
                ok: false,
                latency_ms: start.elapsed().as_millis() as u64,
                error: Some(e.to_string()),
            },
        }
    }
}
