//! Session recorder layout: `runs/<namespace>/<session-id>/` with
//! session.json, per-task logs, and the root monitor-state.json.

use std::sync::Arc;

use gale::backend::Task;
use gale::hooks::{HookSet, LifecycleHook, TaskContext};
use gale::scheduler::LoopStats;
use gale::session::SessionRecorder;

fn ctx(task: Task) -> TaskContext {
    TaskContext {
        namespace: "nightly".to_string(),
        task,
        worker: 0,
    }
}

#[tokio::test]
async fn records_a_full_session_layout() {
    let root = tempfile::tempdir().unwrap();
    let recorder = Arc::new(SessionRecorder::new(root.path()));

    recorder.on_loop_start("nightly").await.unwrap();
    let session_dir = recorder.session_dir().unwrap();
    assert!(session_dir.starts_with(root.path().join("runs").join("nightly")));
    assert!(session_dir.join("session.json").exists());
    assert!(session_dir.join("logs").is_dir());

    recorder
        .on_task_failed(
            &ctx(Task::new("task-1", "broken")),
            &gale::error::GaleError::Timeout { ms: 1000 },
        )
        .await
        .unwrap();

    let stats = LoopStats {
        completed: 0,
        failed: 1,
        duration_ms: 1234,
    };
    recorder.on_loop_end(&stats).await.unwrap();

    // session.json carries the final stats and the task summary.
    let session: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(session_dir.join("session.json")).unwrap())
            .unwrap();
    assert_eq!(session["namespace"], "nightly");
    assert_eq!(session["stats"]["failed"], 1);
    assert_eq!(session["tasks"][0]["task_id"], "task-1");
    assert_eq!(session["tasks"][0]["outcome"], "failed");

    // Per-task log file exists under logs/.
    assert!(session_dir.join("logs").join("task-1.json").exists());

    // monitor-state.json lands at the root.
    let monitor: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(root.path().join("monitor-state.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(monitor["namespace"], "nightly");
    assert_eq!(monitor["session_id"], session["session_id"]);
}

#[tokio::test]
async fn task_ids_are_sanitized_for_filenames() {
    let root = tempfile::tempdir().unwrap();
    let recorder = Arc::new(SessionRecorder::new(root.path()));
    recorder.on_loop_start("ns").await.unwrap();

    recorder
        .on_task_failed(
            &ctx(Task::new("weird/id: with spaces", "t")),
            &gale::error::GaleError::Cancelled,
        )
        .await
        .unwrap();

    let logs = recorder.session_dir().unwrap().join("logs");
    let entries: Vec<String> = std::fs::read_dir(&logs)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].contains('/'));
    assert!(!entries[0].contains(' '));
}

#[tokio::test]
async fn recorder_works_through_hookset_fanout() {
    let root = tempfile::tempdir().unwrap();
    let recorder = Arc::new(SessionRecorder::new(root.path()));
    let mut hooks = HookSet::new();
    hooks.register(recorder.clone());

    hooks.loop_start("ns").await;
    hooks
        .loop_end(&LoopStats {
            completed: 2,
            failed: 0,
            duration_ms: 10,
        })
        .await;

    let session_dir = recorder.session_dir().unwrap();
    let session: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(session_dir.join("session.json")).unwrap())
            .unwrap();
    assert_eq!(session["stats"]["completed"], 2);
}

#[tokio::test]
async fn two_recorders_never_collide_on_session_ids() {
    let root = tempfile::tempdir().unwrap();
    let a = SessionRecorder::new(root.path());
    let b = SessionRecorder::new(root.path());
    assert_ne!(a.session_id(), b.session_id());
}
