//! Task backend contract tests: claim exclusion under concurrency,
//! lifecycle transitions, JSON file persistence, and the resume knob.

use std::sync::Arc;
use std::time::Duration;

use gale::backend::file::JsonFileBackend;
use gale::backend::memory::MemoryBackend;
use gale::backend::{Task, TaskBackend, TaskFilter, TaskPriority, TaskStatus};

// ---------------------------------------------------------------------------
// Exclusion: exactly one concurrent claimer wins
// ---------------------------------------------------------------------------

#[tokio::test]
async fn memory_claim_is_exclusive_across_concurrent_workers() {
    let backend = Arc::new(MemoryBackend::with_tasks([Task::new("contested", "t")]));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let backend = backend.clone();
        handles.push(tokio::spawn(async move {
            backend.mark_in_progress("contested").await.unwrap().success
        }));
    }

    let mut wins = 0;
    for handle in handles {
        if handle.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1, "exactly one claim must succeed");
}

#[tokio::test]
async fn file_claim_is_exclusive_across_concurrent_workers() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(JsonFileBackend::new(dir.path().join("tasks.json")));
    backend.seed_tasks([Task::new("contested", "t")]).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let backend = backend.clone();
        handles.push(tokio::spawn(async move {
            backend.mark_in_progress("contested").await.unwrap().success
        }));
    }

    let mut wins = 0;
    for handle in handles {
        if handle.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
}

// ---------------------------------------------------------------------------
// File backend: persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn file_backend_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.json");

    {
        let backend = JsonFileBackend::new(&path);
        backend
            .seed_tasks([
                Task::new("a", "first").with_priority(TaskPriority::High),
                Task::new("b", "second"),
            ])
            .await
            .unwrap();
        backend.mark_in_progress("a").await.unwrap();
        backend.mark_completed("a", Some("done")).await.unwrap();
    }

    // Reopen from disk.
    let backend = JsonFileBackend::new(&path);
    let a = backend.get_task("a").await.unwrap().unwrap();
    assert_eq!(a.status, TaskStatus::Completed);
    assert_eq!(a.comment.as_deref(), Some("done"));
    assert_eq!(backend.count_pending(&TaskFilter::default()).await.unwrap(), 1);
}

#[tokio::test]
async fn file_backend_missing_file_is_empty_not_error() {
    let dir = tempfile::tempdir().unwrap();
    let backend = JsonFileBackend::new(dir.path().join("never-written.json"));
    assert!(backend.find_next_task(&TaskFilter::default()).await.unwrap().is_none());
    assert!(backend.ping().await.ok);
}

#[tokio::test]
async fn file_backend_corrupt_file_fails_ping() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.json");
    std::fs::write(&path, "{ not json").unwrap();

    let backend = JsonFileBackend::new(&path);
    let ping = backend.ping().await;
    assert!(!ping.ok);
    assert!(ping.error.unwrap().contains("corrupt task file"));
}

#[tokio::test]
async fn file_backend_orders_by_priority_then_insertion() {
    let dir = tempfile::tempdir().unwrap();
    let backend = JsonFileBackend::new(dir.path().join("tasks.json"));
    backend
        .seed_tasks([
            Task::new("low", "l").with_priority(TaskPriority::Low),
            Task::new("med-1", "m1"),
            Task::new("high", "h").with_priority(TaskPriority::High),
            Task::new("med-2", "m2"),
        ])
        .await
        .unwrap();

    let mut order = Vec::new();
    while let Some(task) = backend.find_next_task(&TaskFilter::default()).await.unwrap() {
        backend.mark_in_progress(&task.id).await.unwrap();
        backend.mark_completed(&task.id, None).await.unwrap();
        order.push(task.id);
    }
    assert_eq!(order, vec!["high", "med-1", "med-2", "low"]);
}

#[tokio::test]
async fn file_backend_dependencies_gate_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let backend = JsonFileBackend::new(dir.path().join("tasks.json"));
    backend
        .seed_tasks([
            Task::new("child", "c").with_depends_on(["parent"]),
            Task::new("parent", "p"),
        ])
        .await
        .unwrap();

    assert_eq!(
        backend.find_next_task(&TaskFilter::default()).await.unwrap().unwrap().id,
        "parent"
    );
    let deps = backend.get_dependencies("child").await.unwrap();
    assert_eq!(deps.len(), 1);
    assert!(!backend.are_dependencies_met("child").await.unwrap());

    backend.mark_in_progress("parent").await.unwrap();
    backend.mark_completed("parent", None).await.unwrap();
    assert!(backend.are_dependencies_met("child").await.unwrap());
}

// ---------------------------------------------------------------------------
// Resume knob: stuck in-progress tasks become pending again
// ---------------------------------------------------------------------------

#[tokio::test]
async fn resume_resets_stuck_in_progress_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.json");

    {
        let backend = JsonFileBackend::new(&path);
        let mut stuck = Task::new("stuck", "crashed mid-run");
        stuck.status = TaskStatus::InProgress;
        stuck.updated_at_ms = 1; // ancient
        let mut fresh = Task::new("fresh", "just claimed");
        fresh.status = TaskStatus::InProgress;
        backend.seed_tasks([stuck, fresh]).await.unwrap();
    }

    let backend = JsonFileBackend::open_resuming(&path).await.unwrap();
    assert_eq!(
        backend.get_task("stuck").await.unwrap().unwrap().status,
        TaskStatus::Pending
    );
    // Recently-updated in-progress work is left alone.
    assert_eq!(
        backend.get_task("fresh").await.unwrap().unwrap().status,
        TaskStatus::InProgress
    );
}

#[tokio::test]
async fn without_resume_stuck_tasks_stay_in_progress() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.json");
    {
        let backend = JsonFileBackend::new(&path);
        let mut stuck = Task::new("stuck", "t");
        stuck.status = TaskStatus::InProgress;
        stuck.updated_at_ms = 1;
        backend.seed_tasks([stuck]).await.unwrap();
    }

    let backend = JsonFileBackend::new(&path).with_stuck_after(Duration::from_secs(1));
    assert_eq!(
        backend.get_task("stuck").await.unwrap().unwrap().status,
        TaskStatus::InProgress
    );
    assert!(backend.find_next_task(&TaskFilter::default()).await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn quarantine_is_terminal() {
    let backend = MemoryBackend::with_tasks([Task::new("t", "x")]);
    backend.mark_in_progress("t").await.unwrap();
    assert!(backend.mark_quarantined("t", "spawn error").await.unwrap().success);

    let task = backend.get_task("t").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Quarantined);
    assert_eq!(task.last_error.as_deref(), Some("spawn error"));

    assert!(!backend.mark_completed("t", None).await.unwrap().success);
    assert!(!backend.mark_in_progress("t").await.unwrap().success);
}

#[tokio::test]
async fn reset_to_pending_reopens_failed_tasks() {
    let backend = MemoryBackend::with_tasks([Task::new("t", "x")]);
    backend.mark_in_progress("t").await.unwrap();
    backend.mark_failed("t", "exit 1").await.unwrap();

    assert!(backend.reset_to_pending("t").await.unwrap().success);
    let task = backend.get_task("t").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert!(task.last_error.is_none());
}

#[tokio::test]
async fn unknown_task_ids_are_rejected_not_errors() {
    let backend = MemoryBackend::new();
    let result = backend.mark_in_progress("ghost").await.unwrap();
    assert!(!result.success);
    assert!(result.reason.unwrap().contains("no such task"));
}
