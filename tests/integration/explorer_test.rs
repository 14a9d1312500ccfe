//! Tree session cache integration tests.

use std::sync::Arc;
use std::time::Duration;

use db_sessions::backend::{NodeInfo, ScriptedBrowseBackend};
use db_sessions::config::{ConnectionConfig, SessionSettings};
use db_sessions::error::SessionError;
use db_sessions::explorer::{Expansion, TreeNode, TreeSessionCache};

fn connection(database: &str) -> ConnectionConfig {
    ConnectionConfig {
        host: Some("localhost".to_string()),
        database: Some(database.to_string()),
        user: Some("postgres".to_string()),
        ..Default::default()
    }
}

fn sample_tree() -> ScriptedBrowseBackend {
    ScriptedBrowseBackend::new(NodeInfo::folder("/", "appdb", "Database"))
        .with_children(
            "/",
            vec![
                NodeInfo::folder("/public", "public", "Schema"),
                NodeInfo::folder("/sales", "sales", "Schema"),
            ],
        )
        .with_children(
            "/public",
            vec![
                NodeInfo::folder("/public/users", "users", "Table"),
                NodeInfo::folder("/public/orders", "orders", "Table"),
            ],
        )
}

async fn open(
    backend: Arc<ScriptedBrowseBackend>,
    settings: &SessionSettings,
) -> (TreeSessionCache, TreeNode) {
    let cache = TreeSessionCache::new(settings);
    cache.register_provider("scripted", backend);
    let root = cache
        .create_session("scripted", &connection("appdb"))
        .await
        .unwrap();
    (cache, root)
}

fn shared(expansion: &Expansion) -> &Arc<[TreeNode]> {
    match expansion {
        Expansion::Children(children) => children,
        other => panic!("Expected children, got {other:?}"),
    }
}

#[tokio::test]
async fn test_create_session_returns_root() {
    let (cache, root) = open(Arc::new(sample_tree()), &SessionSettings::default()).await;

    assert_eq!(root.path, "/");
    assert_eq!(root.label, "appdb");
    assert!(root.is_root());
    assert_eq!(cache.root(&root.session_id).unwrap(), root);
    assert_eq!(cache.session_count(), 1);
    assert_eq!(
        cache.session_for(&connection("appdb")),
        Some(root.session_id.clone())
    );
}

#[tokio::test]
async fn test_cached_expand_returns_same_list() {
    let backend = Arc::new(sample_tree());
    let (cache, root) = open(backend.clone(), &SessionSettings::default()).await;

    let first = cache.expand_node(&root.session_id, "/").await.unwrap();
    let second = cache.expand_node(&root.session_id, "/").await.unwrap();

    assert!(Arc::ptr_eq(shared(&first), shared(&second)));
    assert_eq!(backend.expand_count("/"), 1);
    assert_eq!(first.children()[1].label, "sales");
}

#[tokio::test]
async fn test_refresh_replaces_children() {
    let backend = Arc::new(sample_tree());
    let (cache, root) = open(backend.clone(), &SessionSettings::default()).await;
    let session = root.session_id.clone();

    let before = cache.expand_node(&session, "/public").await;
    assert!(matches!(before, Err(SessionError::UnknownNode { .. })));

    cache.expand_node(&session, "/").await.unwrap();
    let tables = cache.expand_node(&session, "/public").await.unwrap();
    let old_users = tables.children()[0].clone();

    backend.set_children(
        "/public",
        vec![NodeInfo::folder("/public/accounts", "accounts", "Table")],
    );
    let refreshed = cache.refresh_node(&session, "/public").await.unwrap();

    assert_eq!(refreshed.children().len(), 1);
    assert_eq!(refreshed.children()[0].label, "accounts");
    assert!(!Arc::ptr_eq(shared(&tables), shared(&refreshed)));
    assert!(!cache.is_current(&old_users));

    let cached = cache.expand_node(&session, "/public").await.unwrap();
    assert!(Arc::ptr_eq(shared(&cached), shared(&refreshed)));
    assert_eq!(backend.expand_count("/public"), 1);
    assert_eq!(backend.refresh_count("/public"), 1);
}

#[tokio::test]
async fn test_refresh_keeps_unchanged_nodes_addressable() {
    let backend = Arc::new(sample_tree());
    let (cache, root) = open(backend.clone(), &SessionSettings::default()).await;
    let session = root.session_id.clone();

    let schemas = cache.expand_node(&session, "/").await.unwrap();
    let public = schemas.children()[0].clone();
    cache.refresh_node(&session, "/").await.unwrap();

    assert!(!cache.is_current(&public));
    let current = cache.node(&session, "/public").unwrap();
    assert_eq!(current.label, public.label);
    assert!(current.generation > public.generation);
    assert!(cache.is_current(&current));
}

#[tokio::test]
async fn test_unknown_session_and_node() {
    let (cache, root) = open(Arc::new(sample_tree()), &SessionSettings::default()).await;

    assert!(matches!(
        cache.expand_node("missing", "/").await,
        Err(SessionError::UnknownSession(_))
    ));
    assert!(matches!(
        cache.refresh_node(&root.session_id, "/nope").await,
        Err(SessionError::UnknownNode { .. })
    ));
}

#[tokio::test]
async fn test_unknown_provider() {
    let cache = TreeSessionCache::new(&SessionSettings::default());
    let result = cache.create_session("oracle", &connection("appdb")).await;
    assert!(matches!(result, Err(SessionError::InvalidProvider(_))));
}

#[tokio::test]
async fn test_create_session_error_propagates() {
    let backend = Arc::new(
        ScriptedBrowseBackend::new(NodeInfo::folder("/", "db", "Database"))
            .with_create_error("authentication failed"),
    );
    let cache = TreeSessionCache::new(&SessionSettings::default());
    cache.register_provider("scripted", backend);

    let result = cache.create_session("scripted", &connection("appdb")).await;
    assert!(matches!(result, Err(SessionError::Backend(_))));
    assert_eq!(cache.session_count(), 0);
}

#[tokio::test]
async fn test_delete_session_closes_backend() {
    let backend = Arc::new(sample_tree());
    let (cache, root) = open(backend.clone(), &SessionSettings::default()).await;
    let schemas = cache.expand_node(&root.session_id, "/").await.unwrap();

    assert!(cache.delete_session(&connection("appdb")).await);
    assert_eq!(backend.open_session_count(), 0);
    assert!(!cache.is_current(&schemas.children()[0]));
    assert!(matches!(
        cache.root(&root.session_id),
        Err(SessionError::UnknownSession(_))
    ));

    assert!(!cache.delete_session(&connection("appdb")).await);
}

#[tokio::test]
async fn test_sessions_per_connection_are_independent() {
    let backend = Arc::new(sample_tree());
    let cache = TreeSessionCache::new(&SessionSettings::default());
    cache.register_provider("scripted", backend.clone());

    let app = cache
        .create_session("scripted", &connection("appdb"))
        .await
        .unwrap();
    let reports = cache
        .create_session("scripted", &connection("reports"))
        .await
        .unwrap();
    assert_ne!(app.session_id, reports.session_id);

    cache.expand_node(&app.session_id, "/").await.unwrap();
    cache.delete_session(&connection("appdb")).await;

    assert_eq!(cache.session_count(), 1);
    let expansion = cache.expand_node(&reports.session_id, "/").await.unwrap();
    assert_eq!(expansion.children().len(), 2);
}

#[tokio::test]
async fn test_slow_expand_times_out() {
    let backend = Arc::new(sample_tree().with_delay(Duration::from_millis(200)));
    let settings = SessionSettings {
        backend_timeout_ms: 20,
        ..SessionSettings::default()
    };
    let (cache, root) = open(backend, &settings).await;

    let expansion = cache.expand_node(&root.session_id, "/").await.unwrap();
    match expansion {
        Expansion::Error(message) => assert!(message.contains("timed out"), "{message}"),
        other => panic!("Expected an error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_slow_session_does_not_block_others() {
    let slow = Arc::new(sample_tree().with_delay(Duration::from_millis(500)));
    let fast = Arc::new(sample_tree());
    let cache = Arc::new(TreeSessionCache::new(&SessionSettings::default()));
    cache.register_provider("slow", slow);
    cache.register_provider("fast", fast);

    let slow_root = cache
        .create_session("slow", &connection("warehouse"))
        .await
        .unwrap();
    let fast_root = cache
        .create_session("fast", &connection("appdb"))
        .await
        .unwrap();

    let slow_expand = tokio::spawn({
        let cache = Arc::clone(&cache);
        async move { cache.expand_node(&slow_root.session_id, "/").await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let fast_expand = tokio::time::timeout(
        Duration::from_millis(200),
        cache.expand_node(&fast_root.session_id, "/"),
    )
    .await
    .expect("fast session waited on the slow one")
    .unwrap();
    assert_eq!(fast_expand.children().len(), 2);

    let slow_expand = slow_expand.await.unwrap().unwrap();
    assert_eq!(slow_expand.children().len(), 2);
}

#[tokio::test]
async fn test_providers_with_same_session_ids_stay_apart() {
    let first = Arc::new(sample_tree());
    let second = Arc::new(sample_tree());
    let cache = TreeSessionCache::new(&SessionSettings::default());
    cache.register_provider("first", first.clone());
    cache.register_provider("second", second.clone());

    let app = cache
        .create_session("first", &connection("appdb"))
        .await
        .unwrap();
    let reports = cache
        .create_session("second", &connection("reports"))
        .await
        .unwrap();
    assert_ne!(app.session_id, reports.session_id);
    assert_eq!(cache.session_count(), 2);
    cache.expand_node(&app.session_id, "/").await.unwrap();

    assert!(cache.delete_session(&connection("appdb")).await);
    assert_eq!(first.open_session_count(), 0);
    assert_eq!(second.open_session_count(), 1);
    assert_eq!(
        cache.session_for(&connection("reports")),
        Some(reports.session_id.clone())
    );
    let expansion = cache.expand_node(&reports.session_id, "/").await.unwrap();
    assert_eq!(expansion.children().len(), 2);
}
