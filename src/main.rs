//! sessionctl - drive the session core from the command line.

use std::sync::Arc;

use db_sessions::backend::{
    NodeInfo, PostgresBrowseBackend, PostgresQueryBackend, QueryBackend, QueryRequest, Row,
    RowRequest, ScriptedBrowseBackend, ScriptedQueryBackend,
};
use db_sessions::cli::Cli;
use db_sessions::config::{Config, ConnectionConfig};
use db_sessions::error::{Result, SessionError};
use db_sessions::explorer::{Expansion, TreeSessionCache};
use db_sessions::logging;
use db_sessions::session::{QueueEvent, SessionRegistry, SessionRegistryHandle};
use serde::Serialize;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    if cli.log_file {
        logging::init_file_logging();
    } else {
        logging::init_stderr_logging();
    }

    if let Err(e) = run(cli).await {
        error!("{}: {}", e.category(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config_path();
    info!("Loading config from: {}", config_path.display());
    let config = Config::load_from_file(&config_path)?;

    if cli.browse {
        browse(&cli, &config).await
    } else {
        execute(&cli, &config).await
    }
}

/// Runs the query through the registry and prints its event stream.
async fn execute(cli: &Cli, config: &Config) -> Result<()> {
    let text = cli.query_text()?;
    let settings = &config.sessions;

    let backend: Arc<dyn QueryBackend> = if cli.mock {
        Arc::new(ScriptedQueryBackend::new())
    } else {
        let connection = require_connection(cli, config)?;
        info!("Connection: {}", connection.display_string());
        Arc::new(
            PostgresQueryBackend::connect(&connection, settings.max_rows_per_result_set).await?,
        )
    };

    let (handle, task) = SessionRegistry::start(backend, settings);
    let result = stream_execution(cli, &handle, text).await;

    handle.shutdown().await?;
    if let Err(e) = task.await {
        warn!("Registry task ended abnormally: {}", e);
    }
    result
}

async fn stream_execution(cli: &Cli, handle: &SessionRegistryHandle, text: String) -> Result<()> {
    let resource = cli.resource.as_str();
    handle
        .run(resource, QueryRequest::new(text), Some(resource.to_string()))
        .await?;
    let mut events = handle.attach(resource).await?;

    let completed = loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted; cancelling {}", resource);
                handle.cancel(resource).await?;
                continue;
            }
        };

        let Some(event) = event else {
            return Err(SessionError::internal("Event stream closed before completion"));
        };
        print_json(&event)?;

        match event {
            QueueEvent::Completed { batches, .. } => break batches,
            QueueEvent::Failed { error } => return Err(SessionError::backend(error)),
            _ => {}
        }
    };

    if cli.rows == 0 {
        return Ok(());
    }
    for batch in &completed {
        for result_set in &batch.result_set_summaries {
            if result_set.row_count == 0 {
                continue;
            }
            let window = RowRequest::new(batch.id, result_set.id, 0, cli.rows);
            let rows = handle.fetch_rows(resource, window).await?;
            print_json(&RowsLine {
                event: "rows",
                batch_id: batch.id,
                result_set_id: result_set.id,
                rows,
            })?;
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct RowsLine {
    event: &'static str,
    batch_id: u32,
    result_set_id: u32,
    rows: Vec<Row>,
}

/// Walks the object tree breadth-first and prints every node.
async fn browse(cli: &Cli, config: &Config) -> Result<()> {
    let cache = TreeSessionCache::new(&config.sessions);
    let (provider, connection) = if cli.mock {
        cache.register_provider("scripted", Arc::new(demo_tree()));
        ("scripted", ConnectionConfig::default())
    } else {
        cache.register_provider("postgres", Arc::new(PostgresBrowseBackend::new()));
        ("postgres", require_connection(cli, config)?)
    };

    let root = cache.create_session(provider, &connection).await?;
    print_json(&root)?;

    let mut frontier = vec![root.path.clone()];
    for _ in 0..cli.depth {
        let mut next = Vec::new();
        for path in frontier {
            match cache.expand_node(&root.session_id, &path).await? {
                Expansion::Children(children) => {
                    for child in children.iter() {
                        print_json(child)?;
                        if !child.is_leaf {
                            next.push(child.path.clone());
                        }
                    }
                }
                Expansion::Error(message) => warn!("Could not expand {}: {}", path, message),
                Expansion::Leaf | Expansion::Empty => {}
            }
        }
        frontier = next;
    }

    cache.delete_session(&connection).await;
    Ok(())
}

fn demo_tree() -> ScriptedBrowseBackend {
    ScriptedBrowseBackend::new(NodeInfo::folder("/", "demo", "Database"))
        .with_children("/", vec![NodeInfo::folder("/public", "public", "Schema")])
        .with_children(
            "/public",
            vec![
                NodeInfo::folder("/public/users", "users", "Table"),
                NodeInfo::folder("/public/orders", "orders", "Table"),
            ],
        )
        .with_children(
            "/public/users",
            vec![
                NodeInfo::leaf("/public/users/id", "id", "Column"),
                NodeInfo::leaf("/public/users/email", "email", "Column"),
            ],
        )
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let line = serde_json::to_string(value)
        .map_err(|e| SessionError::internal(format!("Failed to encode output: {e}")))?;
    println!("{line}");
    Ok(())
}

fn require_connection(cli: &Cli, config: &Config) -> Result<ConnectionConfig> {
    resolve_connection(cli, config)?.ok_or_else(|| {
        SessionError::config("No database connection configured. Use --mock or --help.")
    })
}

/// Resolves the final connection configuration from CLI args, config file, and environment.
fn resolve_connection(cli: &Cli, config: &Config) -> Result<Option<ConnectionConfig>> {
    let mut connection = cli.to_connection_config()?;

    if connection.is_none() {
        if let Some(name) = cli.connection_name() {
            connection = config.get_connection(Some(name)).cloned();
            if connection.is_none() {
                return Err(SessionError::config(format!(
                    "Connection '{}' not found in config file",
                    name
                )));
            }
        }
    }

    if connection.is_none() {
        connection = config.get_connection(None).cloned();
    }

    if let Some(ref mut conn) = connection {
        conn.apply_env_defaults();
    }

    Ok(connection)
}
