//! Session registry integration tests.
//!
//! Drives the registry through its handle with scripted backends and checks
//! the event stream a consumer sees.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use db_sessions::backend::{
    ColumnInfo, EventStream, QueryBackend, QueryRequest, ResourceId, Row, RowRequest,
    ScriptedBatch, ScriptedQueryBackend, Value,
};
use db_sessions::config::SessionSettings;
use db_sessions::error::{Result, SessionError};
use db_sessions::session::{
    EventReceiver, QueueEvent, RunOutcome, SessionRegistry, SessionRegistryHandle, SessionState,
};
use pretty_assertions::assert_eq;

const WAIT: Duration = Duration::from_secs(5);

fn start(backend: Arc<dyn QueryBackend>, settings: SessionSettings) -> SessionRegistryHandle {
    let (handle, _task) = SessionRegistry::start(backend, &settings);
    handle
}

fn five_row_batch() -> ScriptedBatch {
    ScriptedBatch::new()
        .with_result_set(
            vec![ColumnInfo::new("n", "int4")],
            (1..=5).map(|n| vec![Value::Int(n)]).collect(),
        )
        .with_elapsed(Duration::from_millis(45))
}

/// Receives events until the execution ends.
async fn collect_until_terminal(rx: &mut EventReceiver) -> Vec<QueueEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event stream closed");
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}

/// Receives events until one of the given kind arrives.
async fn collect_until(rx: &mut EventReceiver, kind: &str) -> Vec<QueueEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event stream closed");
        let done = event.kind() == kind;
        events.push(event);
        if done {
            return events;
        }
    }
}

async fn wait_until_idle(handle: &SessionRegistryHandle, resource: &str) {
    tokio::time::timeout(WAIT, async {
        while handle.is_running(resource).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session never finished");
}

fn kinds(events: &[QueueEvent]) -> Vec<&'static str> {
    events.iter().map(QueueEvent::kind).collect()
}

#[tokio::test]
async fn test_single_batch_five_rows() {
    let backend = Arc::new(ScriptedQueryBackend::new().with_batch(five_row_batch()));
    let handle = start(backend, SessionSettings::default());

    handle
        .run("doc-1", QueryRequest::new("SELECT n FROM t"), None)
        .await
        .unwrap();
    let mut rx = handle.attach("doc-1").await.unwrap();
    let events = collect_until_terminal(&mut rx).await;

    assert_eq!(
        kinds(&events),
        vec![
            "session_ready",
            "started",
            "batch_start",
            "result_set_complete",
            "batch_complete",
            "completed"
        ]
    );

    match &events[3] {
        QueueEvent::ResultSetComplete { summary } => {
            assert_eq!(summary.batch_id, 0);
            assert_eq!(summary.id, 0);
            assert_eq!(summary.row_count, 5);
        }
        other => panic!("Expected ResultSetComplete, got {other:?}"),
    }
    match &events[4] {
        QueueEvent::BatchComplete { batch } => {
            assert_eq!(batch.execution_elapsed.as_deref(), Some("00:00:00.045"));
        }
        other => panic!("Expected BatchComplete, got {other:?}"),
    }
    match &events[5] {
        QueueEvent::Completed {
            elapsed_ms,
            aborted,
            batches,
        } => {
            assert_eq!(*elapsed_ms, 45);
            assert!(!aborted);
            assert_eq!(batches.len(), 1);
        }
        other => panic!("Expected Completed, got {other:?}"),
    }

    let rows = handle
        .fetch_rows("doc-1", RowRequest::new(0, 0, 0, 5))
        .await
        .unwrap();
    assert_eq!(rows.len(), 5);
    assert_eq!(rows[4], vec![Value::Int(5)]);
    assert_eq!(handle.state("doc-1").await.unwrap(), SessionState::Completed);
    assert_eq!(handle.elapsed_ms("doc-1").await.unwrap(), 45);
}

#[tokio::test]
async fn test_concurrent_runs_start_one_execution() {
    let backend = Arc::new(ScriptedQueryBackend::new().held());
    let handle = start(backend.clone(), SessionSettings::default());

    let runs = (0..10).map(|i| {
        let handle = handle.clone();
        async move {
            handle
                .run("doc", QueryRequest::new(format!("SELECT {i}")), None)
                .await
                .unwrap()
        }
    });
    let outcomes = futures::future::join_all(runs).await;

    let submitted = outcomes
        .iter()
        .filter(|o| matches!(o, RunOutcome::Submitted { .. }))
        .count();
    assert_eq!(submitted, 1);
    assert!(handle.is_running("doc").await);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.run_count(), 1);

    backend.release();
    wait_until_idle(&handle, "doc").await;
    assert_eq!(backend.run_count(), 1);
}

#[tokio::test]
async fn test_events_before_and_after_attach_arrive_once_in_order() {
    let backend = Arc::new(
        ScriptedQueryBackend::new()
            .with_batch(five_row_batch())
            .with_batch(five_row_batch())
            .with_batch(five_row_batch())
            .with_step_delay(Duration::from_millis(20)),
    );
    let handle = start(backend, SessionSettings::default());

    handle.run("doc", QueryRequest::new("q"), None).await.unwrap();

    // Let part of the execution happen before anyone listens.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = handle.snapshot("doc").await.unwrap().unwrap();
    assert!(snapshot.pending_events >= 3);
    assert!(!snapshot.ready);

    let mut rx = handle.attach("doc").await.unwrap();
    let events = collect_until_terminal(&mut rx).await;

    let mut expected = vec!["session_ready", "started"];
    for _ in 0..3 {
        expected.extend(["batch_start", "result_set_complete", "batch_complete"]);
    }
    expected.push("completed");
    assert_eq!(kinds(&events), expected);

    let batch_ids: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            QueueEvent::BatchStart { batch } => Some(batch.id),
            _ => None,
        })
        .collect();
    assert_eq!(batch_ids, vec![0, 1, 2]);

    let snapshot = handle.snapshot("doc").await.unwrap().unwrap();
    assert_eq!(snapshot.pending_events, 0);
    assert!(snapshot.ready);
}

#[tokio::test]
async fn test_cancel_unknown_session_is_ok() {
    let handle = start(
        Arc::new(ScriptedQueryBackend::new()),
        SessionSettings::default(),
    );

    assert!(handle.cancel("unknown").await.is_ok());
    assert!(!handle.is_running("unknown").await);
}

#[tokio::test]
async fn test_cancel_idle_session_is_ok() {
    let backend = Arc::new(ScriptedQueryBackend::new());
    let handle = start(backend.clone(), SessionSettings::default());

    handle.run("doc", QueryRequest::new("q"), None).await.unwrap();
    wait_until_idle(&handle, "doc").await;

    assert!(handle.cancel("doc").await.is_ok());
    assert_eq!(backend.cancel_count(), 0);
}

#[tokio::test]
async fn test_fetch_rows_before_result_set_is_invalid() {
    let backend = Arc::new(
        ScriptedQueryBackend::new()
            .with_batch(five_row_batch())
            .with_step_delay(Duration::from_millis(200)),
    );
    let handle = start(backend, SessionSettings::default());

    handle.run("doc", QueryRequest::new("q"), None).await.unwrap();
    let result = handle.fetch_rows("doc", RowRequest::new(0, 0, 0, 10)).await;

    assert!(matches!(result, Err(SessionError::InvalidResultSet(_))));
}

#[tokio::test]
async fn test_fetch_rows_outside_result_set_is_invalid() {
    let backend = Arc::new(ScriptedQueryBackend::new().with_batch(five_row_batch()));
    let handle = start(backend, SessionSettings::default());

    handle.run("doc", QueryRequest::new("q"), None).await.unwrap();
    wait_until_idle(&handle, "doc").await;

    for window in [
        RowRequest::new(0, 0, 5, 1),
        RowRequest::new(0, 1, 0, 1),
        RowRequest::new(3, 0, 0, 1),
    ] {
        let result = handle.fetch_rows("doc", window).await;
        assert!(
            matches!(result, Err(SessionError::InvalidResultSet(_))),
            "window {window:?} gave {result:?}"
        );
    }

    let clipped = handle
        .fetch_rows("doc", RowRequest::new(0, 0, 3, 50))
        .await
        .unwrap();
    assert_eq!(clipped, vec![vec![Value::Int(4)], vec![Value::Int(5)]]);
}

#[tokio::test]
async fn test_cancel_completes_as_aborted() {
    let backend = Arc::new(
        ScriptedQueryBackend::new()
            .with_batch(five_row_batch())
            .held(),
    );
    let handle = start(backend.clone(), SessionSettings::default());

    handle.run("doc", QueryRequest::new("q"), None).await.unwrap();
    let mut rx = handle.attach("doc").await.unwrap();
    collect_until(&mut rx, "batch_complete").await;

    handle.cancel("doc").await.unwrap();
    let events = collect_until_terminal(&mut rx).await;

    assert!(events.iter().any(|e| matches!(
        e,
        QueueEvent::Message { message } if message.message == "Query was cancelled by user"
    )));
    assert!(matches!(
        events.last(),
        Some(QueueEvent::Completed { aborted: true, .. })
    ));
    assert_eq!(handle.state("doc").await.unwrap(), SessionState::Completed);
    assert_eq!(backend.cancel_count(), 1);
}

#[tokio::test]
async fn test_failed_cancel_keeps_session_executing() {
    let backend = Arc::new(
        ScriptedQueryBackend::new()
            .held()
            .with_cancel_error("driver busy"),
    );
    let handle = start(backend.clone(), SessionSettings::default());

    handle.run("doc", QueryRequest::new("q"), None).await.unwrap();
    let result = handle.cancel("doc").await;

    assert!(matches!(result, Err(SessionError::Backend(_))));
    assert!(handle.is_running("doc").await);
    assert_eq!(handle.state("doc").await.unwrap(), SessionState::Executing);

    backend.release();
    wait_until_idle(&handle, "doc").await;
}

#[tokio::test]
async fn test_rerun_reuses_session() {
    let backend = Arc::new(ScriptedQueryBackend::new());
    let handle = start(backend.clone(), SessionSettings::default());

    handle
        .run("doc", QueryRequest::new("first"), None)
        .await
        .unwrap();
    let mut rx = handle.attach("doc").await.unwrap();
    collect_until_terminal(&mut rx).await;

    let outcome = handle
        .run("doc", QueryRequest::new("second"), Some("Second".into()))
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Submitted { execution: 2 });

    let events = collect_until_terminal(&mut rx).await;
    assert_eq!(
        events[0],
        QueueEvent::Started {
            resource_id: ResourceId::from("doc"),
            title: "Second".to_string(),
            execution: 2,
        }
    );
    assert!(!events
        .iter()
        .any(|e| matches!(e, QueueEvent::SessionReady { .. })));
    assert_eq!(backend.last_request().unwrap().text, "second");
}

#[tokio::test]
async fn test_detach_buffers_until_reattach() {
    let backend = Arc::new(ScriptedQueryBackend::new().held());
    let handle = start(backend.clone(), SessionSettings::default());

    handle.run("doc", QueryRequest::new("q"), None).await.unwrap();
    let mut first = handle.attach("doc").await.unwrap();
    collect_until(&mut first, "batch_complete").await;

    handle.detach("doc").await.unwrap();
    backend.release();
    wait_until_idle(&handle, "doc").await;

    assert!(first.recv().await.is_none());

    let mut second = handle.attach("doc").await.unwrap();
    let events = collect_until_terminal(&mut second).await;
    assert_eq!(kinds(&events), vec!["completed"]);
}

#[tokio::test]
async fn test_bounded_buffer_drops_oldest() {
    let backend = Arc::new(
        ScriptedQueryBackend::new()
            .with_batch(five_row_batch())
            .with_batch(five_row_batch()),
    );
    let settings = SessionSettings {
        event_queue_capacity: 4,
        ..SessionSettings::default()
    };
    let handle = start(backend, settings);

    handle.run("doc", QueryRequest::new("q"), None).await.unwrap();
    wait_until_idle(&handle, "doc").await;

    let snapshot = handle.snapshot("doc").await.unwrap().unwrap();
    assert_eq!(snapshot.pending_events, 4);
    assert_eq!(snapshot.dropped_events, 5);

    let mut rx = handle.attach("doc").await.unwrap();
    let events = collect_until_terminal(&mut rx).await;
    assert_eq!(
        kinds(&events),
        vec![
            "batch_start",
            "result_set_complete",
            "batch_complete",
            "completed"
        ]
    );
}

#[tokio::test]
async fn test_dispose_running_session_cancels_and_releases() {
    let backend = Arc::new(ScriptedQueryBackend::new().held());
    let handle = start(backend.clone(), SessionSettings::default());

    handle.run("doc", QueryRequest::new("q"), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(handle.dispose("doc").await.unwrap());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(backend.cancel_count(), 1);
    assert_eq!(backend.dispose_count(), 1);
    assert!(!handle.is_running("doc").await);
    assert!(matches!(
        handle.attach("doc").await,
        Err(SessionError::UnknownSession(_))
    ));
}

#[tokio::test]
async fn test_start_failure_reports_failed() {
    let backend = Arc::new(ScriptedQueryBackend::new().with_start_error("connection reset"));
    let handle = start(backend, SessionSettings::default());

    handle.run("doc", QueryRequest::new("q"), None).await.unwrap();
    let mut rx = handle.attach("doc").await.unwrap();
    let events = collect_until_terminal(&mut rx).await;

    assert_eq!(
        kinds(&events),
        vec!["session_ready", "started", "message", "failed"]
    );
    assert_eq!(handle.state("doc").await.unwrap(), SessionState::Failed);
}

/// Backend whose round trips never finish.
struct StalledBackend;

#[async_trait]
impl QueryBackend for StalledBackend {
    async fn run_query(&self, _: &ResourceId, _: &QueryRequest) -> Result<EventStream> {
        futures::future::pending().await
    }

    async fn cancel_query(&self, _: &ResourceId) -> Result<()> {
        futures::future::pending().await
    }

    async fn get_rows(&self, _: &ResourceId, _: &RowRequest) -> Result<Vec<Row>> {
        futures::future::pending().await
    }

    async fn dispose(&self, _: &ResourceId) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_backend_deadline() {
    let settings = SessionSettings {
        backend_timeout_ms: 50,
        ..SessionSettings::default()
    };
    let handle = start(Arc::new(StalledBackend), settings);

    handle.run("doc", QueryRequest::new("q"), None).await.unwrap();
    let cancel = handle.cancel("doc").await;
    assert!(matches!(cancel, Err(SessionError::Timeout { .. })));

    let mut rx = handle.attach("doc").await.unwrap();
    let events = collect_until_terminal(&mut rx).await;
    match events.last() {
        Some(QueueEvent::Failed { error }) => assert!(error.contains("timed out"), "{error}"),
        other => panic!("Expected Failed, got {other:?}"),
    }
    assert_eq!(handle.state("doc").await.unwrap(), SessionState::Failed);
}
