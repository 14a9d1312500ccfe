//! Scripted backends for testing.
//!
//! Provide in-memory query and browse drivers that replay configured batches
//! and trees, with hooks for holding executions open and injecting failures.

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
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One batch a scripted backend will play back.
#[derive(Debug, Clone, Default)]
pub struct ScriptedBatch {
    result_sets: Vec<(Vec<ColumnInfo>, Vec<Row>)>,
    messages: Vec<String>,
    error: Option<String>,
    elapsed: Duration,
}

impl ScriptedBatch {
    /// Creates a batch with no output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a result set.
    pub fn with_result_set(mut self, columns: Vec<ColumnInfo>, rows: Vec<Row>) -> Self {
        self.result_sets.push((columns, rows));
        self
    }

    /// Adds an informational message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }

    /// Makes the batch fail with an error message instead of producing rows.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Sets the elapsed time the batch reports.
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }
}

struct Execution {
    batches: Vec<ScriptedBatch>,
    cancel: CancellationToken,
    running: bool,
}

#[derive(Default)]
struct ScriptState {
    executions: HashMap<ResourceId, Execution>,
    requests: Vec<QueryRequest>,
    run_count: usize,
    cancel_count: usize,
    dispose_count: usize,
}

/// A query backend that replays scripted batches.
///
/// With no batches configured it echoes the request text back as a single
/// one-row result set.
pub struct ScriptedQueryBackend {
    batches: Vec<ScriptedBatch>,
    hold: Option<CancellationToken>,
    step_delay: Duration,
    start_error: Option<String>,
    cancel_error: Option<String>,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedQueryBackend {
    /// Creates a backend that echoes each request.
    pub fn new() -> Self {
        Self {
            batches: Vec::new(),
            hold: None,
            step_delay: Duration::ZERO,
            start_error: None,
            cancel_error: None,
            state: Arc::new(Mutex::new(ScriptState::default())),
        }
    }

    /// Adds a batch to the script.
    pub fn with_batch(mut self, batch: ScriptedBatch) -> Self {
        self.batches.push(batch);
        self
    }

    /// Keeps every execution open after its last batch until `release` is
    /// called or the execution is cancelled.
    pub fn held(mut self) -> Self {
        self.hold = Some(CancellationToken::new());
        self
    }

    /// Pauses between emitted events.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Makes `run_query` fail before producing any events.
    pub fn with_start_error(mut self, error: impl Into<String>) -> Self {
        self.start_error = Some(error.into());
        self
    }

    /// Makes `cancel_query` fail.
    pub fn with_cancel_error(mut self, error: impl Into<String>) -> Self {
        self.cancel_error = Some(error.into());
        self
    }

    /// Lets held executions finish.
    pub fn release(&self) {
        if let Some(hold) = &self.hold {
            hold.cancel();
        }
    }

    /// Number of `run_query` calls that started an execution.
    pub fn run_count(&self) -> usize {
        self.state().run_count
    }

    /// Number of accepted cancellations.
    pub fn cancel_count(&self) -> usize {
        self.state().cancel_count
    }

    /// Number of `dispose` calls.
    pub fn dispose_count(&self) -> usize {
        self.state().dispose_count
    }

    /// The most recent request seen.
    pub fn last_request(&self) -> Option<QueryRequest> {
        self.state().requests.last().cloned()
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn echo_batch(request: &QueryRequest) -> ScriptedBatch {
        ScriptedBatch::new()
            .with_result_set(
                vec![ColumnInfo::new("result", "text")],
                vec![vec![Value::String(format!(
                    "Scripted result for: {}",
                    request.text
                ))]],
            )
            .with_elapsed(Duration::from_millis(1))
    }
}

impl Default for ScriptedQueryBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits for the step delay unless the execution is cancelled first.
async fn pause(delay: Duration, cancel: &CancellationToken) {
    if delay.is_zero() {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = cancel.cancelled() => {}
    }
}

/// Emits the events for every batch, returning the final summaries.
async fn play_batches(
    tx: &UnboundedSender<BackendEvent>,
    batches: &[ScriptedBatch],
    step_delay: Duration,
    cancel: &CancellationToken,
) -> Vec<BatchSummary> {
    let mut summaries = Vec::with_capacity(batches.len());

    for (index, batch) in batches.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        let id = index as u32;
        let mut summary = BatchSummary::new(id);
        summary.selection = Some(SelectionRange::new(id, 0, id, 0));

        let _ = tx.unbounded_send(BackendEvent::BatchStart(summary.clone()));
        pause(step_delay, cancel).await;

        if let Some(error) = &batch.error {
            summary.has_error = true;
            let _ = tx.unbounded_send(BackendEvent::Message(MessageInfo::error(
                Some(id),
                error.clone(),
            )));
        } else {
            for (set_index, (columns, rows)) in batch.result_sets.iter().enumerate() {
                let result_set = ResultSetSummary {
                    id: set_index as u32,
                    batch_id: id,
                    row_count: rows.len() as u64,
                    columns: columns.clone(),
                    complete: true,
                };
                summary.store_result_set(result_set.clone());
                let _ = tx.unbounded_send(BackendEvent::ResultSetComplete(result_set));
                pause(step_delay, cancel).await;
            }
        }

        for message in &batch.messages {
            let _ = tx.unbounded_send(BackendEvent::Message(MessageInfo::info(
                Some(id),
                message.clone(),
            )));
        }

        summary.execution_elapsed = Some(format_elapsed(batch.elapsed));
        let _ = tx.unbounded_send(BackendEvent::BatchComplete(summary.clone()));
        summaries.push(summary);
    }

    summaries
}

#[async_trait]
impl QueryBackend for ScriptedQueryBackend {
    async fn run_query(
        &self,
        resource: &ResourceId,
        request: &QueryRequest,
    ) -> Result<EventStream> {
        if let Some(error) = &self.start_error {
            return Err(SessionError::backend(error.clone()));
        }

        let batches = if self.batches.is_empty() {
            vec![Self::echo_batch(request)]
        } else {
            self.batches.clone()
        };
        let cancel = CancellationToken::new();

        {
            let mut state = self.state();
            state.run_count += 1;
            state.requests.push(request.clone());
            state.executions.insert(
                resource.clone(),
                Execution {
                    batches: batches.clone(),
                    cancel: cancel.clone(),
                    running: true,
                },
            );
        }

        let (tx, rx) = mpsc::unbounded();
        let hold = self.hold.clone();
        let step_delay = self.step_delay;
        let state = Arc::clone(&self.state);
        let resource = resource.clone();

        tokio::spawn(async move {
            let summaries = play_batches(&tx, &batches, step_delay, &cancel).await;

            if let Some(hold) = hold {
                tokio::select! {
                    _ = hold.cancelled() => {}
                    _ = cancel.cancelled() => {}
                }
            }

            if cancel.is_cancelled() {
                let _ = tx.unbounded_send(BackendEvent::Message(MessageInfo::info(
                    None,
                    "Query was cancelled by user",
                )));
            }

            if let Some(execution) = state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .executions
                .get_mut(&resource)
            {
                execution.running = false;
            }

            let _ = tx.unbounded_send(BackendEvent::QueryComplete(QueryCompleteInfo {
                batch_summaries: summaries,
            }));
            debug!("Scripted execution for {} finished", resource);
        });

        Ok(rx.boxed())
    }

    async fn cancel_query(&self, resource: &ResourceId) -> Result<()> {
        if let Some(error) = &self.cancel_error {
            return Err(SessionError::backend(error.clone()));
        }

        let mut state = self.state();
        let token = match state.executions.get(resource) {
            Some(execution) if execution.running => execution.cancel.clone(),
            _ => {
                return Err(SessionError::backend(format!(
                    "No query is running for {resource}"
                )))
            }
        };
        token.cancel();
        state.cancel_count += 1;
        Ok(())
    }

    async fn get_rows(&self, resource: &ResourceId, window: &RowRequest) -> Result<Vec<Row>> {
        let state = self.state();
        let rows = state
            .executions
            .get(resource)
            .and_then(|execution| execution.batches.get(window.batch_id as usize))
            .and_then(|batch| batch.result_sets.get(window.result_set_id as usize))
            .map(|(_, rows)| rows)
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
        let mut state = self.state();
        if let Some(execution) = state.executions.remove(resource) {
            execution.cancel.cancel();
        }
        state.dispose_count += 1;
        Ok(())
    }
}

#[derive(Default)]
struct BrowseState {
    tree: HashMap<String, Vec<NodeInfo>>,
    failures: HashMap<String, String>,
    open_sessions: HashSet<String>,
    expand_calls: HashMap<String, usize>,
    refresh_calls: HashMap<String, usize>,
}

/// A browse backend serving an in-memory tree.
pub struct ScriptedBrowseBackend {
    root: NodeInfo,
    delay: Duration,
    create_error: Option<String>,
    next_session: AtomicU64,
    state: Mutex<BrowseState>,
}

impl ScriptedBrowseBackend {
    /// Creates a backend whose sessions are rooted at the given node.
    pub fn new(root: NodeInfo) -> Self {
        Self {
            root,
            delay: Duration::ZERO,
            create_error: None,
            next_session: AtomicU64::new(1),
            state: Mutex::new(BrowseState::default()),
        }
    }

    /// Sets the children served for a path.
    pub fn with_children(self, path: impl Into<String>, children: Vec<NodeInfo>) -> Self {
        self.set_children(path, children);
        self
    }

    /// Delays every expand and refresh.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Makes `create_session` fail.
    pub fn with_create_error(mut self, error: impl Into<String>) -> Self {
        self.create_error = Some(error.into());
        self
    }

    /// Replaces the children served for a path.
    pub fn set_children(&self, path: impl Into<String>, children: Vec<NodeInfo>) {
        self.state().tree.insert(path.into(), children);
    }

    /// Makes expansion of a path report an error.
    pub fn fail_path(&self, path: impl Into<String>, message: impl Into<String>) {
        self.state().failures.insert(path.into(), message.into());
    }

    /// Removes an injected failure.
    pub fn clear_failure(&self, path: &str) {
        self.state().failures.remove(path);
    }

    /// Number of expand calls for a path.
    pub fn expand_count(&self, path: &str) -> usize {
        self.state().expand_calls.get(path).copied().unwrap_or(0)
    }

    /// Number of refresh calls for a path.
    pub fn refresh_count(&self, path: &str) -> usize {
        self.state().refresh_calls.get(path).copied().unwrap_or(0)
    }

    /// Number of sessions not yet closed.
    pub fn open_session_count(&self) -> usize {
        self.state().open_sessions.len()
    }

    fn state(&self) -> MutexGuard<'_, BrowseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn children_of(&self, session_id: &str, path: &str) -> Result<NodeExpansion> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let state = self.state();
        if !state.open_sessions.contains(session_id) {
            return Err(SessionError::backend(format!(
                "Browse session {session_id} is closed"
            )));
        }
        if let Some(message) = state.failures.get(path) {
            return Ok(NodeExpansion::failed(message.clone()));
        }
        Ok(NodeExpansion::with_children(
            state.tree.get(path).cloned().unwrap_or_default(),
        ))
    }
}

#[async_trait]
impl BrowseBackend for ScriptedBrowseBackend {
    async fn create_session(&self, _connection: &ConnectionConfig) -> Result<BrowseSession> {
        if let Some(error) = &self.create_error {
            return Err(SessionError::backend(error.clone()));
        }

        let session_id = format!(
            "session-{}",
            self.next_session.fetch_add(1, Ordering::Relaxed)
        );
        self.state().open_sessions.insert(session_id.clone());

        Ok(BrowseSession {
            session_id,
            root: self.root.clone(),
        })
    }

    async fn expand_node(&self, session_id: &str, path: &str) -> Result<NodeExpansion> {
        *self
            .state()
            .expand_calls
            .entry(path.to_string())
            .or_default() += 1;
        self.children_of(session_id, path).await
    }

    async fn refresh_node(&self, session_id: &str, path: &str) -> Result<NodeExpansion> {
        *self
            .state()
            .refresh_calls
            .entry(path.to_string())
            .or_default() += 1;
        self.children_of(session_id, path).await
    }

    async fn close_session(&self, session_id: &str) -> Result<()> {
        if self.state().open_sessions.remove(session_id) {
            Ok(())
        } else {
            Err(SessionError::backend(format!(
                "Browse session {session_id} is not open"
            )))
        }
    }
}
