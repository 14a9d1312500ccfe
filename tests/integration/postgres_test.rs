//! PostgreSQL integration tests.
//!
//! Runs the registry and the tree cache against a real database. Skipped
//! unless DATABASE_URL is set.

use std::sync::Arc;
use std::time::Duration;

use db_sessions::backend::{
    PostgresBrowseBackend, PostgresQueryBackend, QueryRequest, RowRequest, Value,
};
use db_sessions::config::{ConnectionConfig, SessionSettings};
use db_sessions::explorer::TreeSessionCache;
use db_sessions::session::{QueueEvent, SessionRegistry};

/// Helper to get test database config from environment.
fn get_test_config() -> Option<ConnectionConfig> {
    let url = std::env::var("DATABASE_URL").ok()?;
    ConnectionConfig::from_connection_string(&url).ok()
}

#[tokio::test]
async fn test_registry_runs_batches() {
    let Some(config) = get_test_config() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let backend = PostgresQueryBackend::connect(&config, 1000).await.unwrap();
    let (handle, _task) = SessionRegistry::start(Arc::new(backend), &SessionSettings::default());

    handle
        .run(
            "pg-doc",
            QueryRequest::new(
                "SELECT generate_series(1, 5)::int8 AS n\nGO\nSELECT 'done' AS status",
            ),
            None,
        )
        .await
        .unwrap();
    let mut rx = handle.attach("pg-doc").await.unwrap();

    let batches = loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event stream closed");
        match event {
            QueueEvent::Completed { batches, .. } => break batches,
            QueueEvent::Failed { error } => panic!("Query failed: {error}"),
            _ => {}
        }
    };

    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].result_set_summaries[0].row_count, 5);
    assert_eq!(batches[1].selection.map(|s| s.start_line), Some(2));

    let rows = handle
        .fetch_rows("pg-doc", RowRequest::new(0, 0, 3, 10))
        .await
        .unwrap();
    assert_eq!(rows, vec![vec![Value::Int(4)], vec![Value::Int(5)]]);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_long_running_query() {
    let Some(config) = get_test_config() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let backend = PostgresQueryBackend::connect(&config, 1000).await.unwrap();
    let (handle, _task) = SessionRegistry::start(Arc::new(backend), &SessionSettings::default());

    handle
        .run("pg-sleep", QueryRequest::new("SELECT pg_sleep(30)"), None)
        .await
        .unwrap();
    let mut rx = handle.attach("pg-sleep").await.unwrap();

    // Give the execution time to reach the server.
    tokio::time::sleep(Duration::from_millis(300)).await;
    handle.cancel("pg-sleep").await.unwrap();

    // The server may report the cancelled statement before the cancel call
    // returns, so only the early completion is checked, not the aborted flag.
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("cancel did not stop the query")
            .expect("event stream closed");
        if matches!(event, QueueEvent::Completed { .. }) {
            break;
        }
    }
    assert!(!handle.is_running("pg-sleep").await);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_browse_public_schema() {
    let Some(config) = get_test_config() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let cache = TreeSessionCache::new(&SessionSettings::default());
    cache.register_provider("postgres", Arc::new(PostgresBrowseBackend::new()));

    let root = cache.create_session("postgres", &config).await.unwrap();
    let schemas = cache.expand_node(&root.session_id, "/").await.unwrap();

    assert!(schemas
        .children()
        .iter()
        .any(|node| node.path == "/public" && node.node_type == "Schema"));
    assert!(cache.delete_session(&config).await);
}
