use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;

use crate::backend::{
    epoch_ms, MarkResult, PingResult, Task, TaskBackend, TaskFilter, TaskStatus,
};
use crate::error::GaleError;

/// In-process task store. Insertion order is the queue order within a
/// priority band; every transition happens under one mutex, which is
/// what makes `mark_in_progress` atomic across workers.
#[derive(Default)]
pub struct MemoryBackend {
    tasks: Mutex<Vec<Task>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks<I>(tasks: I) -> Self
    where
        I: IntoIterator<Item = Task>,
    {
        Self {
            tasks: Mutex::new(tasks.into_iter().collect()),
        }
    }

    pub fn add_task(&self, task: Task) {
        self.tasks.lock().expect("task store lock poisoned").push(task);
    }

    /// Snapshot of every task, queue order.
    pub fn all_tasks(&self) -> Vec<Task> {
        self.tasks.lock().expect("task store lock poisoned").clone()
    }

    /// Treat lingering in-progress tasks as pending again. The resume
    /// policy lives here, not in the scheduler.
    pub fn recover_stuck(&self) -> usize {
        let mut tasks = self.tasks.lock().expect("task store lock poisoned");
        let mut recovered = 0;
        for task in tasks.iter_mut() {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Pending;
                task.updated_at_ms = epoch_ms();
                recovered += 1;
            }
        }
        recovered
    }

    fn deps_met(tasks: &[Task], task: &Task) -> bool {
        task.depends_on.iter().all(|dep| {
            tasks
                .iter()
                .find(|t| t.id == *dep)
                .is_none_or(|t| t.status == TaskStatus::Completed)
        })
    }

    fn transition<F>(&self, id: &str, apply: F) -> Result<MarkResult, GaleError>
    where
        F: FnOnce(&mut Task) -> MarkResult,
    {
        let mut tasks = self.tasks.lock().expect("task store lock poisoned");
        match tasks.iter_mut().find(|t| t.id == id) {
            Some(task) => {
                let result = apply(task);
                if result.success {
                    task.updated_at_ms = epoch_ms();
                }
                Ok(result)
            }
            None => Ok(MarkResult::rejected(format!("no such task: {id}"))),
        }
    }
}

#[async_trait]
impl TaskBackend for MemoryBackend {
    async fn find_next_task(&self, filter: &TaskFilter) -> Result<Option<Task>, GaleError> {
        let tasks = self.tasks.lock().expect("task store lock poisoned");
        let mut candidates: Vec<&Task> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| filter.matches(t))
            .filter(|t| Self::deps_met(&tasks, t))
            .collect();
        // Stable sort: priority band first, insertion order within it.
        candidates.sort_by_key(|t| t.priority.rank());
        Ok(candidates.first().map(|t| (*t).clone()))
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, GaleError> {
        let tasks = self.tasks.lock().expect("task store lock poisoned");
        Ok(tasks.iter().find(|t| t.id == id).cloned())
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
    }

    async fn mark_completed(
        &self,
        id: &str,
        comment: Option<&str>,
    ) -> Result<MarkResult, GaleError> {
        self.transition(id, |task| {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Completed;
                task.comment = comment.map(str::to_string);
                MarkResult::ok()
            } else {
                MarkResult::rejected(format!("task is {:?}, not in-progress", task.status))
            }
        })
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<MarkResult, GaleError> {
        self.transition(id, |task| {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Failed;
                task.last_error = Some(error.to_string());
                MarkResult::ok()
            } else {
                MarkResult::rejected(format!("task is {:?}, not in-progress", task.status))
            }
        })
    }

    async fn mark_quarantined(&self, id: &str, reason: &str) -> Result<MarkResult, GaleError> {
        self.transition(id, |task| {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Quarantined;
                task.last_error = Some(reason.to_string());
                MarkResult::ok()
            } else {
                MarkResult::rejected(format!("task is {:?}, not in-progress", task.status))
            }
        })
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
    }

    async fn list_pending(&self, filter: &TaskFilter) -> Result<Vec<Task>, GaleError> {
        let tasks = self.tasks.lock().expect("task store lock poisoned");
        Ok(tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && filter.matches(t))
            .cloned()
            .collect())
    }

    async fn count_pending(&self, filter: &TaskFilter) -> Result<usize, GaleError> {
        Ok(self.list_pending(filter).await?.len())
    }

    async fn get_dependencies(&self, id: &str) -> Result<Vec<Task>, GaleError> {
        let tasks = self.tasks.lock().expect("task store lock poisoned");
        let Some(task) = tasks.iter().find(|t| t.id == id) else {
            return Ok(Vec::new());
        };
        Ok(tasks
            .iter()
            .filter(|t| task.depends_on.contains(&t.id))
            .cloned()
            .collect())
    }

    async fn are_dependencies_met(&self, id: &str) -> Result<bool, GaleError> {
        let tasks = self.tasks.lock().expect("task store lock poisoned");
        Ok(tasks
            .iter()
            .find(|t| t.id == id)
            .is_some_and(|t| Self::deps_met(&tasks, t)))
    }

    async fn ping(&self) -> PingResult {
        let start = Instant::now();
        let _ = self.tasks.lock().expect("task store lock poisoned").len();
        PingResult {
            ok: true,
            latency_ms: start.elapsed().as_millis() as u64,
            error: None,
        }
    }
}
