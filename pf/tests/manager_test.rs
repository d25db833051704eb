//! Integration tests for the task manager
//!
//! Every test drives a real manager (dispatcher, workers, supervisor) against
//! the scripted browser double in `common`.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use pagefleet::config::Config;
use pagefleet::domain::{CommandKind, CommandStatus, FailureReason, Outcome};
use pagefleet::manager::{BlockingTaskManager, CloseMode, Lifecycle, TaskManager};
use pagefleet::worker::WorkerState;
use pagefleet::{ManagerError, ResultRecord};
use pagestore::{JsonlStore, MemoryStore, StorageError};
use tempfile::TempDir;

use common::{FlakyStore, Script, ScriptedFactory, Step, result_records, test_config};

async fn start(config: Config, script: &Arc<Script>) -> (TaskManager, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let manager = TaskManager::start_with_factory(config, store.clone(), ScriptedFactory::new(script.clone()))
        .await
        .expect("manager should start");
    (manager, store)
}

/// Poll until `check` holds, failing the test after five seconds
async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn records_for(records: &[ResultRecord], id: u64) -> Vec<&ResultRecord> {
    records.iter().filter(|r| r.command_id.0 == id).collect()
}

// =============================================================================
// Dispatch and ordering
// =============================================================================

#[tokio::test]
async fn test_single_worker_visits_in_submission_order() {
    let temp = TempDir::new().unwrap();
    let script = Script::new();
    let (manager, store) = start(test_config(temp.path(), 1), &script).await;

    let urls = ["http://localhost/1", "http://localhost/2", "http://localhost/3"];
    let handles: Vec<_> = urls
        .iter()
        .map(|url| manager.submit(CommandKind::visit(*url)).unwrap())
        .collect();

    for handle in handles {
        let result = handle.wait().await;
        assert_eq!(result.status, CommandStatus::Succeeded);
        assert_eq!(result.attempts, 1);
        assert!(result.payload.is_some());
    }

    let report = manager.close(CloseMode::Graceful).await.unwrap();
    assert!(report.is_clean(), "unexpected report: {:?}", report);
    assert_eq!(manager.pending_count(), 0);
    assert_eq!(manager.lifecycle(), Lifecycle::Closed);

    let records = result_records(&store);
    let targets: Vec<_> = records.iter().map(|r| r.target.as_str()).collect();
    assert_eq!(targets, urls);
    assert!(records.iter().all(|r| r.outcome == Outcome::Success));
    assert!(records.iter().all(|r| r.session_id == manager.session_id()));

    let key = &records[0].content_keys[0];
    assert_eq!(store.content(key).unwrap(), b"<html>http://localhost/1</html>".to_vec());
    assert!(store.is_closed());
}

#[tokio::test]
async fn test_dispatch_never_exceeds_pool_size() {
    let temp = TempDir::new().unwrap();
    let script = Script::new();
    let (manager, store) = start(test_config(temp.path(), 2), &script).await;

    let handles: Vec<_> = (0..12)
        .map(|i| manager.submit(CommandKind::visit(format!("http://localhost/{}", i))).unwrap())
        .collect();
    for handle in handles {
        assert!(handle.wait().await.is_success());
    }
    manager.close(CloseMode::Graceful).await.unwrap();

    let stats = manager.stats();
    assert_eq!(stats.submitted, 12);
    assert_eq!(stats.succeeded, 12);
    assert!(stats.peak_dispatched <= 2, "peak dispatched {}", stats.peak_dispatched);
    assert!(script.peak_running.load(Ordering::SeqCst) <= 2);
    assert_eq!(result_records(&store).len(), 12);
}

#[tokio::test]
async fn test_graceful_close_drains_queue() {
    let temp = TempDir::new().unwrap();
    let script = Script::new();
    let (manager, store) = start(test_config(temp.path(), 2), &script).await;

    let handles: Vec<_> = (0..5)
        .map(|i| manager.submit(CommandKind::visit(format!("http://localhost/{}", i))).unwrap())
        .collect();
    let report = manager.close(CloseMode::Graceful).await.unwrap();
    assert!(report.abandoned.is_empty());
    assert!(report.unresolved.is_empty());

    for handle in handles {
        assert_eq!(handle.wait().await.status, CommandStatus::Succeeded);
    }
    assert_eq!(result_records(&store).len(), 5);
    assert!(
        manager
            .worker_states()
            .iter()
            .all(|w| w.state == WorkerState::Terminated)
    );
}

#[tokio::test]
async fn test_get_visits_then_sleeps() {
    let temp = TempDir::new().unwrap();
    let script = Script::new();
    let (manager, store) = start(test_config(temp.path(), 1), &script).await;

    let results = manager
        .get("http://localhost/page", Some(Duration::from_millis(20)))
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(matches!(results[0].kind, CommandKind::Visit { .. }));
    assert!(matches!(results[1].kind, CommandKind::Sleep { duration_ms: 20 }));
    assert!(results.iter().all(|r| r.is_success()));

    let err = manager.get("localhost/page", None).await.unwrap_err();
    assert!(matches!(err, ManagerError::InvalidCommand(_)));

    manager.close(CloseMode::Graceful).await.unwrap();
    let kinds: Vec<_> = result_records(&store).into_iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec!["visit", "sleep"]);
}

#[tokio::test]
async fn test_get_sleeps_on_the_visiting_browser() {
    let temp = TempDir::new().unwrap();
    let script = Script::new();
    let (manager, store) = start(test_config(temp.path(), 2), &script).await;
    let manager = Arc::new(manager);

    let mut tasks = Vec::new();
    for n in 0..4 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            manager
                .get(&format!("http://localhost/page/{}", n), Some(Duration::from_millis(20)))
                .await
                .unwrap()
        }));
    }

    for task in tasks {
        let results = task.await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.is_success()));
        assert!(results[0].worker_id.is_some());
        assert_eq!(results[0].worker_id, results[1].worker_id, "sleep runs on the visit's browser");
    }
    assert!(manager.stats().peak_dispatched <= 2);

    manager.close(CloseMode::Graceful).await.unwrap();
    // each worker runs its visit then its sleep before taking the next visit
    let records = result_records(&store);
    for worker in 0..2 {
        let kinds: Vec<_> = records
            .iter()
            .filter(|r| r.worker_id.0 == worker)
            .map(|r| r.kind.as_str())
            .collect();
        for pair in kinds.chunks(2) {
            assert_eq!(pair, ["visit", "sleep"]);
        }
    }
}

#[tokio::test]
async fn test_forced_close_abandons_sequence_followers() {
    let temp = TempDir::new().unwrap();
    let script = Script::new();
    script.on("http://localhost/hang", vec![Step::Hang]);
    let mut config = test_config(temp.path(), 1);
    config.manager.command_timeout_ms = 60_000;
    let (manager, store) = start(config, &script).await;

    let handles = manager
        .submit_sequence(vec![
            CommandKind::visit("http://localhost/hang"),
            CommandKind::sleep(Duration::from_millis(10)),
        ])
        .unwrap();
    wait_until("visit dispatched", || manager.stats().dispatched == 1).await;
    assert_eq!(manager.pending_count(), 1);

    let report = manager.close(CloseMode::Forced).await.unwrap();
    assert_eq!(report.abandoned, vec![handles[1].id()]);
    for handle in handles {
        assert_eq!(handle.wait().await.status, CommandStatus::Abandoned);
    }
    assert!(result_records(&store).is_empty());
}

#[tokio::test]
async fn test_empty_sequence_is_rejected() {
    let temp = TempDir::new().unwrap();
    let script = Script::new();
    let (manager, _store) = start(test_config(temp.path(), 1), &script).await;
    assert!(matches!(manager.submit_sequence(Vec::new()), Err(ManagerError::InvalidCommand(_))));
    manager.close(CloseMode::Graceful).await.unwrap();
}

// =============================================================================
// Crashes and retries
// =============================================================================

#[tokio::test]
async fn test_crash_is_retried_on_another_attempt() {
    let temp = TempDir::new().unwrap();
    let script = Script::new();
    script.on("http://localhost/flaky", vec![Step::Crash]);
    let mut config = test_config(temp.path(), 2);
    config.manager.max_retries = 1;
    let (manager, store) = start(config, &script).await;

    let handle = manager.submit(CommandKind::visit("http://localhost/flaky")).unwrap();
    let id = handle.id();
    let result = handle.wait().await;
    assert_eq!(result.status, CommandStatus::Succeeded);
    assert_eq!(result.attempts, 2);

    manager.close(CloseMode::Graceful).await.unwrap();

    let records = result_records(&store);
    let mine = records_for(&records, id.0);
    assert_eq!(mine.len(), 1, "only the successful attempt is stored");
    assert_eq!(mine[0].attempt, 2);
    assert_eq!(mine[0].outcome, Outcome::Success);

    let stats = manager.stats();
    assert_eq!(stats.crashes, 1);
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.restarts, 1);
    assert_eq!(script.visits().len(), 2);
}

#[tokio::test]
async fn test_max_retries_exceeded() {
    let temp = TempDir::new().unwrap();
    let script = Script::new();
    script.on("http://localhost/doomed", vec![Step::Crash; 4]);
    let mut config = test_config(temp.path(), 1);
    config.manager.max_retries = 2;
    let (manager, store) = start(config, &script).await;

    let handle = manager.submit(CommandKind::visit("http://localhost/doomed")).unwrap();
    let id = handle.id();
    let result = handle.wait().await;
    assert_eq!(result.status, CommandStatus::Failed);
    match result.outcome {
        Outcome::Failure(FailureReason::MaxRetriesExceeded { attempts, last_error }) => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("scripted crash"), "last error: {}", last_error);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }

    // the worker recovers and keeps serving
    let next = manager.submit(CommandKind::visit("http://localhost/fine")).unwrap();
    assert!(next.wait().await.is_success());
    manager.close(CloseMode::Graceful).await.unwrap();

    let records = result_records(&store);
    let mine = records_for(&records, id.0);
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].attempt, 3);
    assert!(matches!(
        mine[0].outcome,
        Outcome::Failure(FailureReason::MaxRetriesExceeded { attempts: 3, .. })
    ));
}

#[tokio::test]
async fn test_command_error_keeps_worker_healthy() {
    let temp = TempDir::new().unwrap();
    let script = Script::new();
    script.on("http://localhost/404", vec![Step::Fail("not found".to_string())]);
    let (manager, store) = start(test_config(temp.path(), 1), &script).await;

    let failed = manager.submit(CommandKind::visit("http://localhost/404")).unwrap().wait().await;
    assert_eq!(failed.status, CommandStatus::Failed);
    assert_eq!(
        failed.outcome.failure_reason(),
        Some(&FailureReason::CommandFailed {
            message: "not found".to_string()
        })
    );

    let ok = manager.submit(CommandKind::visit("http://localhost/ok")).unwrap().wait().await;
    assert!(ok.is_success());
    manager.close(CloseMode::Graceful).await.unwrap();

    assert_eq!(manager.stats().crashes, 0);
    assert_eq!(script.launches.load(Ordering::SeqCst), 1);
    assert_eq!(result_records(&store).len(), 2);
}

#[tokio::test]
async fn test_hanging_command_times_out_and_retries() {
    let temp = TempDir::new().unwrap();
    let script = Script::new();
    script.on("http://localhost/slow", vec![Step::Hang]);
    let mut config = test_config(temp.path(), 1);
    config.manager.command_timeout_ms = 100;
    let (manager, _store) = start(config, &script).await;

    let result = manager.submit(CommandKind::visit("http://localhost/slow")).unwrap().wait().await;
    assert!(result.is_success());
    assert_eq!(result.attempts, 2);
    assert_eq!(manager.stats().crashes, 1);
    manager.close(CloseMode::Graceful).await.unwrap();
}

#[tokio::test]
async fn test_worker_terminated_after_consecutive_crashes() {
    let temp = TempDir::new().unwrap();
    let script = Script::new();
    script.on("http://localhost/poison", vec![Step::Crash; 5]);
    let mut config = test_config(temp.path(), 1);
    config.manager.max_consecutive_crashes = 1;
    config.manager.max_retries = 5;
    let (manager, store) = start(config, &script).await;

    let result = manager.submit(CommandKind::visit("http://localhost/poison")).unwrap().wait().await;
    assert_eq!(result.status, CommandStatus::Failed);
    assert_eq!(result.outcome.failure_reason(), Some(&FailureReason::NoWorkersAvailable));
    assert_eq!(result.attempts, 2, "two attempts ran before the worker was terminated");
    assert_eq!(manager.worker_states()[0].state, WorkerState::Terminated);

    let later = manager.submit(CommandKind::visit("http://localhost/any")).unwrap().wait().await;
    assert_eq!(later.outcome.failure_reason(), Some(&FailureReason::NoWorkersAvailable));
    assert_eq!(later.attempts, 0);
    manager.close(CloseMode::Graceful).await.unwrap();

    // the command that ran leaves a failure record; the one that never ran does not
    let records = result_records(&store);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].command_id, result.command_id);
    assert_eq!(records[0].attempt, 2);
    assert_eq!(records[0].outcome, Outcome::Failure(FailureReason::NoWorkersAvailable));
    assert_eq!(script.visits().len(), 2);
}

#[tokio::test]
async fn test_launch_failure_leaves_no_workers() {
    let temp = TempDir::new().unwrap();
    let script = Script::new();
    script.fail_launches.store(true, Ordering::SeqCst);
    let mut config = test_config(temp.path(), 2);
    config.manager.max_restart_attempts = 2;
    let (manager, _store) = start(config, &script).await;

    wait_until("all workers terminated", || {
        manager
            .worker_states()
            .iter()
            .all(|w| w.state == WorkerState::Terminated)
    })
    .await;
    assert_eq!(script.launches.load(Ordering::SeqCst), 4);

    let result = manager.submit(CommandKind::visit("http://localhost/")).unwrap().wait().await;
    assert_eq!(result.status, CommandStatus::Failed);
    assert_eq!(result.outcome.failure_reason(), Some(&FailureReason::NoWorkersAvailable));
    manager.close(CloseMode::Graceful).await.unwrap();
}

// =============================================================================
// Shutdown, back-pressure, storage failures
// =============================================================================

#[tokio::test]
async fn test_forced_close_is_bounded_with_hung_browser() {
    let temp = TempDir::new().unwrap();
    let script = Script::new();
    script.on("http://localhost/hang", vec![Step::Hang]);
    let mut config = test_config(temp.path(), 1);
    config.manager.command_timeout_ms = 60_000;
    let (manager, store) = start(config, &script).await;

    let hung = manager.submit(CommandKind::visit("http://localhost/hang")).unwrap();
    wait_until("hung command dispatched", || manager.stats().dispatched == 1).await;
    let queued: Vec<_> = (0..2)
        .map(|i| manager.submit(CommandKind::visit(format!("http://localhost/{}", i))).unwrap())
        .collect();

    let started = Instant::now();
    let report = tokio::time::timeout(Duration::from_secs(5), manager.close(CloseMode::Forced))
        .await
        .expect("forced close must be bounded")
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(report.abandoned.len(), 2);
    assert_eq!(report.unresolved, vec![hung.id()]);
    assert_eq!(hung.wait().await.status, CommandStatus::Abandoned);
    for handle in queued {
        let result = handle.wait().await;
        assert_eq!(result.status, CommandStatus::Abandoned);
        assert_eq!(result.outcome.failure_reason(), Some(&FailureReason::Abandoned));
    }

    assert_eq!(manager.stats().abandoned, 3);
    assert!(result_records(&store).is_empty());
    assert!(store.is_closed());
}

#[tokio::test]
async fn test_closed_manager_rejects_calls() {
    let temp = TempDir::new().unwrap();
    let script = Script::new();
    let (manager, _store) = start(test_config(temp.path(), 1), &script).await;

    manager.close(CloseMode::Graceful).await.unwrap();
    assert!(matches!(
        manager.submit(CommandKind::visit("http://localhost/")),
        Err(ManagerError::ManagerClosed)
    ));
    assert!(matches!(
        manager.close(CloseMode::Graceful).await,
        Err(ManagerError::ManagerClosed)
    ));
    assert!(matches!(
        manager.get("http://localhost/", None).await,
        Err(ManagerError::ManagerClosed)
    ));
}

#[tokio::test]
async fn test_queue_bound() {
    let temp = TempDir::new().unwrap();
    let script = Script::new();
    script.on("http://localhost/hang", vec![Step::Hang]);
    let mut config = test_config(temp.path(), 1);
    config.manager.queue_bound = Some(1);
    config.manager.command_timeout_ms = 60_000;
    let (manager, _store) = start(config, &script).await;

    let _busy = manager.submit(CommandKind::visit("http://localhost/hang")).unwrap();
    wait_until("worker busy", || manager.stats().dispatched == 1).await;

    let _queued = manager.submit(CommandKind::visit("http://localhost/a")).unwrap();
    assert_eq!(manager.pending_count(), 1);
    assert!(matches!(
        manager.submit(CommandKind::visit("http://localhost/b")),
        Err(ManagerError::QueueFull { bound: 1 })
    ));

    manager.close(CloseMode::Forced).await.unwrap();
}

#[tokio::test]
async fn test_storage_failure_is_reported_not_fatal() {
    let temp = TempDir::new().unwrap();
    let script = Script::new();
    let store = Arc::new(FlakyStore::default());
    store.failing.store(true, Ordering::SeqCst);
    let manager = TaskManager::start_with_factory(
        test_config(temp.path(), 1),
        store.clone(),
        ScriptedFactory::new(script.clone()),
    )
    .await
    .unwrap();

    let result = manager.submit(CommandKind::visit("http://localhost/1")).unwrap().wait().await;
    assert_eq!(result.status, CommandStatus::Failed);
    assert!(matches!(
        result.outcome,
        Outcome::Failure(FailureReason::StorageError { ref message }) if message.contains("disk full")
    ));

    store.failing.store(false, Ordering::SeqCst);
    let result = manager.submit(CommandKind::visit("http://localhost/2")).unwrap().wait().await;
    assert!(result.is_success());

    manager.close(CloseMode::Graceful).await.unwrap();
    assert_eq!(manager.stats().storage_errors, 1);
    assert_eq!(manager.stats().crashes, 0);
    assert_eq!(result_records(&store.inner).len(), 1);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let temp = TempDir::new().unwrap();
    let script = Script::new();
    let mut config = test_config(temp.path(), 2);
    config.browsers.pop();

    let result = TaskManager::start_with_factory(
        config,
        Arc::new(MemoryStore::new()),
        ScriptedFactory::new(script),
    )
    .await;
    assert!(matches!(result, Err(ManagerError::Configuration(_))));
}

// =============================================================================
// Blocking API
// =============================================================================

#[tokio::test]
async fn test_locked_result_store_fails_start() {
    let temp = TempDir::new().unwrap();
    let config = test_config(temp.path(), 1);
    let _holder = JsonlStore::open(config.database_path()).unwrap();

    let err = TaskManager::start_jsonl(config).await.err().expect("second writer must be refused");
    assert!(matches!(err, ManagerError::Storage(StorageError::Locked(_))));
}

#[test]
fn test_blocking_visit_sync() {
    let temp = TempDir::new().unwrap();
    let script = Script::new();
    let store = Arc::new(MemoryStore::new());
    let manager = BlockingTaskManager::start_with_factory(
        test_config(temp.path(), 1),
        store.clone(),
        ScriptedFactory::new(script),
    )
    .unwrap();

    let results = manager.visit_sync("http://localhost/sync", None).unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0].is_success());

    let handle = manager.submit(CommandKind::visit("http://localhost/handle")).unwrap();
    assert!(manager.wait(handle).is_success());

    let report = manager.close(CloseMode::Graceful).unwrap();
    assert!(report.is_clean());
    assert_eq!(manager.stats().succeeded, 2);
    assert_eq!(result_records(&store).len(), 2);
}
