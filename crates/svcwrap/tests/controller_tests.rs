#![cfg(unix)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use svcwrap::{
    LogConfig, LogHandler, MemoryEventLogger, ProcessController, ProcessId, ProcessTable,
    SpawnRequest, StreamSide, WrapperError, create_process_manager,
};

fn controller(events: Arc<MemoryEventLogger>) -> ProcessController {
    ProcessController::new(create_process_manager(), events)
        .with_sleep_time(Duration::from_millis(100))
}

/// Poll until `root` has `count` descendants
async fn descendants_of(root: ProcessId, count: usize) -> Vec<ProcessId> {
    let table = ProcessTable::new();
    for _ in 0..50 {
        let found = table.descendants(root);
        if found.len() >= count {
            return found;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("process {root} never had {count} descendants");
}

#[tokio::test]
async fn test_stop_tree_terminates_cooperative_tree() {
    let events = Arc::new(MemoryEventLogger::new());
    let controller = controller(events.clone());
    let request = SpawnRequest::new("sh", ["-c", "sleep 30 & sleep 30 & wait"]);
    let process = controller.start(request, None, None).await.unwrap();
    let children = descendants_of(process.pid(), 2).await;

    let outcome = controller
        .stop_tree(&process, Duration::from_secs(5), true)
        .await;

    assert!(outcome.force_killed.is_empty(), "{outcome:?}");
    assert!(outcome.survivors.is_empty());
    assert!(process.has_exited());
    assert!(ProcessTable::new().alive_among(&children).is_empty());
    assert_eq!(process.known_descendants().len(), 2);
}

#[tokio::test]
async fn test_stop_tree_kills_tree_that_ignores_termination() {
    let events = Arc::new(MemoryEventLogger::new());
    let controller = controller(events.clone());
    let request = SpawnRequest::new("sh", ["-c", "trap '' TERM; sleep 30 & sleep 30 & wait"]);
    let process = controller.start(request, None, None).await.unwrap();
    let children = descendants_of(process.pid(), 2).await;

    let outcome = controller
        .stop_tree(&process, Duration::from_millis(500), true)
        .await;

    assert!(outcome.force_killed.contains(&process.pid()));
    assert!(outcome.survivors.is_empty(), "{outcome:?}");
    assert_eq!(outcome.exit_code, Some(128 + 9));
    assert!(ProcessTable::new().alive_among(&children).is_empty());
    assert!(events.contains("did not stop within"));
}

#[tokio::test]
async fn test_children_first_order_also_empties_tree() {
    let events = Arc::new(MemoryEventLogger::new());
    let controller = controller(events);
    let request = SpawnRequest::new("sh", ["-c", "sleep 30 & wait"]);
    let process = controller.start(request, None, None).await.unwrap();
    let children = descendants_of(process.pid(), 1).await;

    let outcome = controller
        .stop_tree(&process, Duration::from_secs(5), false)
        .await;

    assert!(outcome.survivors.is_empty());
    assert!(process.wait_timeout(Duration::from_secs(5)).await.is_some());
    assert!(ProcessTable::new().alive_among(&children).is_empty());
}

#[tokio::test]
async fn test_stop_descendants_reaches_reparented_children() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("child.pid");
    let script = format!("sleep 300 & echo $! > {}; exit 3", pid_file.display());
    let controller = controller(Arc::new(MemoryEventLogger::new()));
    let process = controller
        .start(SpawnRequest::new("sh", ["-c", script.as_str()]), None, None)
        .await
        .unwrap();
    assert_eq!(process.wait().await, 3);

    let orphan: ProcessId = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let table = ProcessTable::new();
    assert!(table.descendants(process.pid()).is_empty());
    assert!(table.is_alive(orphan));

    let outcome = controller
        .stop_descendants(&process, Duration::from_secs(5))
        .await;

    assert_eq!(outcome.exit_code, Some(3));
    assert!(outcome.survivors.is_empty(), "{outcome:?}");
    assert!(process.known_descendants().contains(&orphan));
    assert!(!table.is_alive(orphan));
}

#[tokio::test]
async fn test_wait_for_exit_reports_progress_each_slice() {
    let controller = controller(Arc::new(MemoryEventLogger::new()));
    let process = controller
        .start(SpawnRequest::new("sleep", ["1"]), None, None)
        .await
        .unwrap();

    let ticks = AtomicUsize::new(0);
    let code = controller
        .wait_for_exit(&process, || {
            ticks.fetch_add(1, Ordering::SeqCst);
        })
        .await;

    assert_eq!(code, 0);
    assert!(ticks.load(Ordering::SeqCst) >= 5);
}

#[tokio::test]
async fn test_output_is_written_through_log_handler() {
    let dir = tempfile::tempdir().unwrap();
    let events = Arc::new(MemoryEventLogger::new());
    let controller = controller(events.clone());
    let handler = LogHandler::new(&LogConfig::in_directory(dir.path()), "svc", events);

    let request = SpawnRequest::new("sh", ["-c", "echo hello; echo oops >&2; exit 4"]);
    let process = controller.start(request, Some(&handler), None).await.unwrap();
    assert!(process.stdout_redirected());

    assert_eq!(process.wait().await, 4);
    assert!(process.output_drained(Duration::from_secs(5)).await);

    let out = std::fs::read_to_string(handler.active_path(StreamSide::Out)).unwrap();
    let err = std::fs::read_to_string(handler.active_path(StreamSide::Err)).unwrap();
    assert_eq!(out, "hello\n");
    assert_eq!(err, "oops\n");
}

#[tokio::test]
async fn test_spawn_failure_is_fatal() {
    let controller = controller(Arc::new(MemoryEventLogger::new()));
    let result = controller
        .start(
            SpawnRequest::new("/nonexistent/svcwrap-test-binary", Vec::<String>::new()),
            None,
            None,
        )
        .await;

    let error = result.err().unwrap();
    assert!(matches!(error, WrapperError::Spawn(_)));
    assert!(error.is_fatal_to_phase());
}
