//! PostgreSQL backends.
//!
//! `PostgresQueryBackend` implements `QueryBackend` and
//! `PostgresBrowseBackend` implements `BrowseBackend`, both using sqlx.

use super::{
    format_elapsed, BackendEvent, BatchSummary, BrowseBackend, BrowseSession, ColumnInfo,
    EventStream, MessageInfo, NodeExpansion, NodeInfo, QueryBackend, QueryCompleteInfo,
    QueryRequest, ResourceId, ResultSetSummary, Row, RowRequest, SelectionRange, Value,
};
use crate::config::ConnectionConfig;
use crate::error::{Result, SessionError};
use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::StreamExt;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Column as SqlxColumn, Either, Row as SqlxRow, TypeInfo};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Maximum number of connection retry attempts.
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay between retry attempts (doubles each retry).
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Connections in the query pool. Each running execution holds one.
const QUERY_POOL_SIZE: u32 = 5;

/// Opens a connection pool, retrying transient failures with backoff.
async fn connect_pool(config: &ConnectionConfig) -> Result<PgPool> {
    let conn_str = config.to_connection_string()?;

    let mut last_error = None;
    let mut delay = Duration::from_millis(RETRY_BASE_DELAY_MS);

    for attempt in 1..=MAX_RETRY_ATTEMPTS {
        debug!("Connection attempt {} of {}", attempt, MAX_RETRY_ATTEMPTS);

        let result = PgPoolOptions::new()
            .max_connections(QUERY_POOL_SIZE)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&conn_str)
            .await;

        match result {
            Ok(pool) => {
                debug!("Connected to {}", config.display_string());
                return Ok(pool);
            }
            Err(e) => {
                let is_transient = is_transient_error(&e);
                last_error = Some(e);

                if attempt < MAX_RETRY_ATTEMPTS && is_transient {
                    warn!(
                        "Connection attempt {} failed (transient error), retrying in {:?}",
                        attempt, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                } else {
                    break;
                }
            }
        }
    }

    match last_error {
        Some(error) => Err(map_connection_error(error, config)),
        None => Err(SessionError::connection("No connection attempt was made")),
    }
}

/// Splits request text into batches on lines consisting only of `GO`.
///
/// Returns each non-blank batch with its position relative to the request.
pub fn split_batches(text: &str) -> Vec<(SelectionRange, String)> {
    let mut batches = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut start_line = 0u32;

    let mut flush = |lines: &mut Vec<&str>, start: u32| {
        if lines.iter().any(|line| !line.trim().is_empty()) {
            let end_line = start + lines.len() as u32 - 1;
            let end_column = lines.last().map(|l| l.chars().count()).unwrap_or(0) as u32;
            batches.push((
                SelectionRange::new(start, 0, end_line, end_column),
                lines.join("\n"),
            ));
        }
        lines.clear();
    };

    for (index, line) in text.lines().enumerate() {
        let index = index as u32;
        if line.trim().eq_ignore_ascii_case("go") {
            flush(&mut current, start_line);
            start_line = index + 1;
        } else {
            current.push(line);
        }
    }
    flush(&mut current, start_line);

    batches
}

type ResultStore = Arc<Mutex<HashMap<(u32, u32), Vec<Row>>>>;

/// Server pid of an execution's connection. Cleared under the lock before the
/// connection goes back to the pool, so a cancel holding the lock can never
/// reach a statement of another execution.
type PidSlot = Arc<tokio::sync::Mutex<Option<i32>>>;

struct Execution {
    cancel: CancellationToken,
    backend_pid: PidSlot,
    results: ResultStore,
    running: Arc<AtomicBool>,
}

/// Query backend executing against a PostgreSQL pool.
///
/// Each execution runs on its own pooled connection so it can be cancelled
/// with `pg_cancel_backend`. Cancels go through a separate single-connection
/// pool, which stays usable while every query connection is busy.
pub struct PostgresQueryBackend {
    pool: PgPool,
    cancel_pool: PgPool,
    max_rows: usize,
    executions: Mutex<HashMap<ResourceId, Execution>>,
}

impl PostgresQueryBackend {
    /// Connects to the database described by the config.
    pub async fn connect(config: &ConnectionConfig, max_rows: usize) -> Result<Self> {
        let pool = connect_pool(config).await?;
        Ok(Self::from_pool(pool, max_rows))
    }

    /// Creates a backend from an existing connection pool.
    pub fn from_pool(pool: PgPool, max_rows: usize) -> Self {
        let cancel_pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy_with((*pool.connect_options()).clone());
        Self {
            pool,
            cancel_pool,
            max_rows,
            executions: Mutex::new(HashMap::new()),
        }
    }

    /// Closes the underlying pools.
    pub async fn close(&self) {
        self.cancel_pool.close().await;
        self.pool.close().await;
    }

    fn executions(&self) -> MutexGuard<'_, HashMap<ResourceId, Execution>> {
        self.executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Everything one execution task needs.
struct ExecutionTask {
    pool: PgPool,
    batches: Vec<(SelectionRange, String)>,
    tx: UnboundedSender<BackendEvent>,
    cancel: CancellationToken,
    backend_pid: PidSlot,
    results: ResultStore,
    running: Arc<AtomicBool>,
    max_rows: usize,
}

impl ExecutionTask {
    async fn run(self) {
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                let _ = self.tx.unbounded_send(BackendEvent::Failed(format!(
                    "Failed to acquire connection: {e}"
                )));
                self.running.store(false, Ordering::SeqCst);
                return;
            }
        };

        match sqlx::query_scalar::<_, i32>("SELECT pg_backend_pid()")
            .fetch_one(&mut *conn)
            .await
        {
            Ok(pid) => *self.backend_pid.lock().await = Some(pid),
            Err(e) => warn!("Could not read backend pid, cancel will be local only: {e}"),
        }

        let mut summaries = Vec::with_capacity(self.batches.len());
        for (index, (selection, text)) in self.batches.iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            let id = index as u32;
            let mut summary = BatchSummary::new(id);
            summary.selection = Some(*selection);
            let _ = self
                .tx
                .unbounded_send(BackendEvent::BatchStart(summary.clone()));

            let started = Instant::now();
            if let Err(message) = self.run_batch(&mut conn, &mut summary, text).await {
                summary.has_error = true;
                let _ = self
                    .tx
                    .unbounded_send(BackendEvent::Message(MessageInfo::error(Some(id), message)));
            }
            summary.execution_elapsed = Some(format_elapsed(started.elapsed()));

            let _ = self
                .tx
                .unbounded_send(BackendEvent::BatchComplete(summary.clone()));
            summaries.push(summary);
        }

        if self.cancel.is_cancelled() {
            let _ = self.tx.unbounded_send(BackendEvent::Message(MessageInfo::info(
                None,
                "Query was cancelled by user",
            )));
        }

        {
            let mut pid = self.backend_pid.lock().await;
            *pid = None;
            self.running.store(false, Ordering::SeqCst);
            drop(conn);
        }

        let _ = self
            .tx
            .unbounded_send(BackendEvent::QueryComplete(QueryCompleteInfo {
                batch_summaries: summaries,
            }));
    }

    /// Runs one batch, emitting a `ResultSetComplete` per row-returning
    /// statement. Returns the error text if the batch failed.
    async fn run_batch(
        &self,
        conn: &mut PgConnection,
        summary: &mut BatchSummary,
        text: &str,
    ) -> std::result::Result<(), String> {
        let batch_id = summary.id;
        let mut stream = sqlx::raw_sql(text).fetch_many(&mut *conn);
        let mut columns: Option<Vec<ColumnInfo>> = None;
        let mut rows: Vec<Row> = Vec::new();
        let mut total_rows = 0u64;
        let mut result_set_id = 0u32;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err("Query was cancelled".to_string()),
                item = stream.next() => item,
            };

            match next {
                None => break,
                Some(Err(e)) => return Err(format_query_error(e)),
                Some(Ok(Either::Right(row))) => {
                    if columns.is_none() {
                        columns = Some(
                            row.columns()
                                .iter()
                                .map(|col| ColumnInfo::new(col.name(), col.type_info().name()))
                                .collect(),
                        );
                    }
                    total_rows += 1;
                    if rows.len() < self.max_rows {
                        rows.push(convert_row(&row));
                    }
                }
                Some(Ok(Either::Left(done))) => match columns.take() {
                    Some(columns) => {
                        if total_rows > rows.len() as u64 {
                            warn!(
                                "Result set {} of batch {} returned {} rows, keeping {}",
                                result_set_id,
                                batch_id,
                                total_rows,
                                rows.len()
                            );
                            let _ = self.tx.unbounded_send(BackendEvent::Message(
                                MessageInfo::info(
                                    Some(batch_id),
                                    format!(
                                        "Result truncated: keeping {} of {} rows",
                                        rows.len(),
                                        total_rows
                                    ),
                                ),
                            ));
                        }

                        let result_set = ResultSetSummary {
                            id: result_set_id,
                            batch_id,
                            row_count: rows.len() as u64,
                            columns,
                            complete: true,
                        };
                        self.results
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .insert((batch_id, result_set_id), std::mem::take(&mut rows));
                        summary.store_result_set(result_set.clone());
                        let _ = self
                            .tx
                            .unbounded_send(BackendEvent::ResultSetComplete(result_set));

                        result_set_id += 1;
                        total_rows = 0;
                    }
                    None => {
                        let _ = self.tx.unbounded_send(BackendEvent::Message(MessageInfo::info(
                            Some(batch_id),
                            format!("({} rows affected)", done.rows_affected()),
                        )));
                    }
                },
            }
        }

        Ok(())
    }
}

#[async_trait]
impl QueryBackend for PostgresQueryBackend {
    async fn run_query(
        &self,
        resource: &ResourceId,
        request: &QueryRequest,
    ) -> Result<EventStream> {
        let batches = split_batches(&request.text);
        debug!("Running {} batch(es) for {}", batches.len(), resource);

        let cancel = CancellationToken::new();
        let backend_pid: PidSlot = Arc::new(tokio::sync::Mutex::new(None));
        let results: ResultStore = Arc::new(Mutex::new(HashMap::new()));
        let running = Arc::new(AtomicBool::new(true));

        let previous = self.executions().insert(
            resource.clone(),
            Execution {
                cancel: cancel.clone(),
                backend_pid: Arc::clone(&backend_pid),
                results: Arc::clone(&results),
                running: Arc::clone(&running),
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        let (tx, rx) = mpsc::unbounded();
        let task = ExecutionTask {
            pool: self.pool.clone(),
            batches,
            tx,
            cancel,
            backend_pid,
            results,
            running,
            max_rows: self.max_rows,
        };
        tokio::spawn(task.run());

        Ok(rx.boxed())
    }

    async fn cancel_query(&self, resource: &ResourceId) -> Result<()> {
        let not_running = || SessionError::backend(format!("No query is running for {resource}"));
        let (token, backend_pid, running) = {
            let executions = self.executions();
            match executions.get(resource) {
                Some(execution) if execution.running.load(Ordering::SeqCst) => (
                    execution.cancel.clone(),
                    Arc::clone(&execution.backend_pid),
                    Arc::clone(&execution.running),
                ),
                _ => return Err(not_running()),
            }
        };

        // The execution cannot release its connection while the slot is held.
        let pid = backend_pid.lock().await;
        if !running.load(Ordering::SeqCst) {
            return Err(not_running());
        }
        if let Some(pid) = *pid {
            sqlx::query("SELECT pg_cancel_backend($1)")
                .bind(pid)
                .execute(&self.cancel_pool)
                .await
                .map_err(|e| SessionError::backend(format!("Failed to cancel query: {e}")))?;
        }
        drop(pid);
        token.cancel();
        Ok(())
    }

    async fn get_rows(&self, resource: &ResourceId, window: &RowRequest) -> Result<Vec<Row>> {
        let results = self
            .executions()
            .get(resource)
            .map(|execution| Arc::clone(&execution.results))
            .ok_or_else(|| SessionError::backend(format!("No results held for {resource}")))?;

        let results = results.lock().unwrap_or_else(PoisonError::into_inner);
        let rows = results
            .get(&(window.batch_id, window.result_set_id))
            .ok_or_else(|| {
                SessionError::backend(format!(
                    "No rows for batch {} result set {}",
                    window.batch_id, window.result_set_id
                ))
            })?;

        Ok(rows
            .iter()
            .skip(window.row_start as usize)
            .take(window.row_count as usize)
            .cloned()
            .collect())
    }

    async fn dispose(&self, resource: &ResourceId) -> Result<()> {
        if let Some(execution) = self.executions().remove(resource) {
            execution.cancel.cancel();
        }
        Ok(())
    }
}

/// Browse backend listing schemas, tables and columns.
///
/// Node paths are `/`, `/<schema>`, `/<schema>/<table>` and
/// `/<schema>/<table>/<column>`.
pub struct PostgresBrowseBackend {
    next_session: AtomicU64,
    sessions: Mutex<HashMap<String, PgPool>>,
}

impl PostgresBrowseBackend {
    /// Creates a browse backend with no open sessions.
    pub fn new() -> Self {
        Self {
            next_session: AtomicU64::new(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn pool(&self, session_id: &str) -> Result<PgPool> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::backend(format!("Browse session {session_id} is closed")))
    }

    async fn list_schemas(pool: &PgPool) -> Result<Vec<NodeInfo>> {
        let schemas: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT schema_name::text
            FROM information_schema.schemata
            WHERE schema_name NOT IN ('pg_catalog', 'information_schema')
                AND schema_name NOT LIKE 'pg_toast%'
                AND schema_name NOT LIKE 'pg_temp%'
            ORDER BY schema_name
            "#,
        )
        .fetch_all(pool)
        .await
        .map_err(|e| SessionError::backend(format!("Failed to fetch schemas: {e}")))?;

        Ok(schemas
            .into_iter()
            .map(|schema| NodeInfo::folder(format!("/{schema}"), schema, "Schema"))
            .collect())
    }

    async fn list_tables(pool: &PgPool, schema: &str) -> Result<Vec<NodeInfo>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
            SELECT table_name::text, table_type::text
            FROM information_schema.tables
            WHERE table_schema = $1
            ORDER BY table_name
            "#,
        )
        .bind(schema)
        .fetch_all(pool)
        .await
        .map_err(|e| SessionError::backend(format!("Failed to fetch tables for {schema}: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|(table, table_type)| {
                let node_type = if table_type == "VIEW" { "View" } else { "Table" };
                NodeInfo::folder(format!("/{schema}/{table}"), table, node_type)
            })
            .collect())
    }

    async fn list_columns(pool: &PgPool, schema: &str, table: &str) -> Result<Vec<NodeInfo>> {
        let rows: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT column_name::text, data_type::text, is_nullable::text
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(pool)
        .await
        .map_err(|e| {
            SessionError::backend(format!("Failed to fetch columns for {schema}.{table}: {e}"))
        })?;

        Ok(rows
            .into_iter()
            .map(|(column, data_type, is_nullable)| {
                let nullability = if is_nullable == "YES" { "null" } else { "not null" };
                NodeInfo::leaf(
                    format!("/{schema}/{table}/{column}"),
                    format!("{column} ({data_type}, {nullability})"),
                    "Column",
                )
            })
            .collect())
    }
}

impl Default for PostgresBrowseBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrowseBackend for PostgresBrowseBackend {
    async fn create_session(&self, connection: &ConnectionConfig) -> Result<BrowseSession> {
        let pool = connect_pool(connection).await?;
        let session_id = format!(
            "pg-{}",
            self.next_session.fetch_add(1, Ordering::Relaxed)
        );
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.clone(), pool);

        let database = connection.database.as_deref().unwrap_or("postgres");
        Ok(BrowseSession {
            session_id,
            root: NodeInfo::folder("/", database, "Database"),
        })
    }

    async fn expand_node(&self, session_id: &str, path: &str) -> Result<NodeExpansion> {
        let pool = self.pool(session_id)?;
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        let children = match segments.as_slice() {
            [] => Self::list_schemas(&pool).await?,
            [schema] => Self::list_tables(&pool, schema).await?,
            [schema, table] => Self::list_columns(&pool, schema, table).await?,
            _ => {
                return Ok(NodeExpansion::failed(format!(
                    "Node {path} cannot be expanded"
                )))
            }
        };

        Ok(NodeExpansion::with_children(children))
    }

    async fn refresh_node(&self, session_id: &str, path: &str) -> Result<NodeExpansion> {
        self.expand_node(session_id, path).await
    }

    async fn close_session(&self, session_id: &str) -> Result<()> {
        let pool = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        match pool {
            Some(pool) => {
                pool.close().await;
                Ok(())
            }
            None => Err(SessionError::backend(format!(
                "Browse session {session_id} is not open"
            ))),
        }
    }
}

/// Converts a sqlx PgRow to our Row type.
fn convert_row(row: &PgRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| convert_value(row, i, col.type_info().name()))
        .collect()
}

/// Converts a single column value from a PgRow to our Value type.
fn convert_value(row: &PgRow, index: usize, type_name: &str) -> Value {
    match type_name.to_uppercase().as_str() {
        "BOOL" | "BOOLEAN" => row
            .try_get::<Option<bool>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),

        "INT2" | "SMALLINT" => row
            .try_get::<Option<i16>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT4" | "INT" | "INTEGER" => row
            .try_get::<Option<i32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),

        "INT8" | "BIGINT" => row
            .try_get::<Option<i64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Int)
            .unwrap_or(Value::Null),

        "FLOAT4" | "REAL" => row
            .try_get::<Option<f32>, _>(index)
            .ok()
            .flatten()
            .map(|v| Value::Float(v as f64))
            .unwrap_or(Value::Null),

        "FLOAT8" | "DOUBLE PRECISION" => row
            .try_get::<Option<f64>, _>(index)
            .ok()
            .flatten()
            .map(Value::Float)
            .unwrap_or(Value::Null),

        "BYTEA" => row
            .try_get::<Option<Vec<u8>>, _>(index)
            .ok()
            .flatten()
            .map(Value::Bytes)
            .unwrap_or(Value::Null),

        _ => row
            .try_get::<Option<String>, _>(index)
            .ok()
            .flatten()
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

/// Determines if an error is transient and worth retrying.
fn is_transient_error(error: &sqlx::Error) -> bool {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
        || error_str.contains("does not exist")
        || error_str.contains("ssl")
        || error_str.contains("tls")
    {
        return false;
    }

    error_str.contains("connection refused")
        || error_str.contains("timed out")
        || error_str.contains("timeout")
        || error_str.contains("temporarily unavailable")
        || error_str.contains("connection reset")
        || error_str.contains("broken pipe")
}

/// Maps sqlx connection errors to user-facing messages.
fn map_connection_error(error: sqlx::Error, config: &ConnectionConfig) -> SessionError {
    let host = config.host.as_deref().unwrap_or("localhost");
    let port = config.port;
    let user = config.user.as_deref().unwrap_or("unknown");
    let database = config.database.as_deref().unwrap_or("unknown");

    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") || error_str.contains("could not connect") {
        SessionError::connection(format!(
            "Cannot connect to {host}:{port}. Check that the server is running."
        ))
    } else if error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
    {
        SessionError::connection(format!(
            "Authentication failed for user '{user}'. Check your credentials."
        ))
    } else if error_str.contains("does not exist") && error_str.contains("database") {
        SessionError::connection(format!("Database '{database}' does not exist."))
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        SessionError::connection(format!(
            "Connection to {host}:{port} timed out. The server may be overloaded or unreachable."
        ))
    } else {
        SessionError::connection(error.to_string())
    }
}

/// Formats a query error with detail and hint when the server sent them.
fn format_query_error(error: sqlx::Error) -> String {
    let Some(db_error) = error.as_database_error() else {
        return error.to_string();
    };

    let mut result = format!("ERROR: {}", db_error.message());
    if let Some(pg_error) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
        if let Some(detail) = pg_error.detail() {
            result.push_str("\n  DETAIL: ");
            result.push_str(detail);
        }
        if let Some(hint) = pg_error.hint() {
            result.push_str("\n  HINT: ");
            result.push_str(hint);
        }
    }
    result
}
