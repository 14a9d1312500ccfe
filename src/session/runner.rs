//! Lifecycle of one query execution against one resource.
//!
//! A `SessionRunner` owns the state machine and the batch list. Backend
//! notifications reach it as `RunnerEvent`s on a channel supplied at
//! construction; the owner feeds them back through `handle`, which returns the
//! consumer events to publish.

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::StreamExt;
use regex::Regex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::QueueEvent;
use crate::backend::{
    with_deadline, BackendEvent, BatchSummary, MessageInfo, QueryBackend, QueryCompleteInfo,
    QueryRequest, ResourceId, ResultSetSummary, Row, RowRequest, SelectionRange,
};
use crate::error::{Result, SessionError};

/// Execution state of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Executing,
    Cancelling,
    Completed,
    Failed,
}

impl SessionState {
    /// Returns true while the backend may still produce events.
    pub fn is_executing(&self) -> bool {
        matches!(self, Self::Executing | Self::Cancelling)
    }
}

/// Something that happened to a runner outside the owner's control flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerSignal {
    /// A notification from the backend's event stream.
    Backend(BackendEvent),
    /// The backend accepted a cancel request.
    CancelAcknowledged,
}

/// A signal tagged with the runner and execution it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerEvent {
    pub resource_id: ResourceId,
    pub execution: u64,
    pub signal: RunnerSignal,
}

/// Sending side for runner events.
pub type RunnerEventSender = mpsc::UnboundedSender<RunnerEvent>;

/// Parses a backend elapsed-time string (`HH:MM:SS` with optional fraction)
/// into milliseconds.
pub fn parse_elapsed_ms(elapsed: &str) -> Option<u64> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"^(\d+):([0-5]\d):([0-5]\d)(?:\.(\d{1,9}))?$").ok())
        .as_ref()?;

    let captures = pattern.captures(elapsed.trim())?;
    let hours: u64 = captures[1].parse().ok()?;
    let minutes: u64 = captures[2].parse().ok()?;
    let seconds: u64 = captures[3].parse().ok()?;
    let millis = match captures.get(4) {
        Some(fraction) => {
            let digits: String = fraction.as_str().chars().chain("00".chars()).take(3).collect();
            digits.parse::<u64>().ok()?
        }
        None => 0,
    };

    hours
        .checked_mul(60)?
        .checked_add(minutes)?
        .checked_mul(60)?
        .checked_add(seconds)?
        .checked_mul(1000)?
        .checked_add(millis)
}

/// Runs and tracks executions for one resource.
pub struct SessionRunner {
    resource_id: ResourceId,
    backend: Arc<dyn QueryBackend>,
    events: RunnerEventSender,
    deadline: Duration,
    state: SessionState,
    batches: Vec<BatchSummary>,
    elapsed_ms: u64,
    execution: u64,
    /// Selection of the submitted request; batch positions are relative to it.
    origin: SelectionRange,
    cancel_acknowledged: bool,
    pump: Option<CancellationToken>,
    disposed: bool,
}

impl SessionRunner {
    /// Creates an idle runner whose backend events go to `events`.
    pub fn new(
        resource_id: ResourceId,
        backend: Arc<dyn QueryBackend>,
        events: RunnerEventSender,
        deadline: Duration,
    ) -> Self {
        Self {
            resource_id,
            backend,
            events,
            deadline,
            state: SessionState::Idle,
            batches: Vec::new(),
            elapsed_ms: 0,
            execution: 0,
            origin: SelectionRange::default(),
            cancel_acknowledged: false,
            pump: None,
            disposed: false,
        }
    }

    /// Returns the resource this runner executes for.
    pub fn resource_id(&self) -> &ResourceId {
        &self.resource_id
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns true while an execution is in flight.
    pub fn is_executing(&self) -> bool {
        self.state.is_executing()
    }

    /// Returns the batches of the current or last execution.
    pub fn batches(&self) -> &[BatchSummary] {
        &self.batches
    }

    /// Returns the elapsed time accumulated from completed batches.
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    /// Returns the number of executions submitted so far.
    pub fn execution(&self) -> u64 {
        self.execution
    }

    /// Starts a new execution.
    ///
    /// Returns immediately; progress arrives as runner events.
    pub fn submit(&mut self, request: QueryRequest) -> Result<()> {
        if self.disposed {
            return Err(SessionError::unknown_session(self.resource_id.as_str()));
        }
        if self.is_executing() {
            return Err(SessionError::already_executing(self.resource_id.as_str()));
        }

        if let Some(previous) = self.pump.take() {
            previous.cancel();
        }

        self.execution += 1;
        self.state = SessionState::Executing;
        self.batches.clear();
        self.elapsed_ms = 0;
        self.cancel_acknowledged = false;
        self.origin = request.selection.unwrap_or_default();

        let token = CancellationToken::new();
        self.pump = Some(token.clone());

        info!(
            "Submitting execution {} for {}",
            self.execution, self.resource_id
        );
        tokio::spawn(pump_events(
            Arc::clone(&self.backend),
            self.resource_id.clone(),
            self.execution,
            request,
            self.events.clone(),
            token,
            self.deadline,
        ));

        Ok(())
    }

    /// Applies a runner event, returning the consumer events it produces.
    ///
    /// Events from an earlier execution are discarded.
    pub fn handle(&mut self, event: RunnerEvent) -> Vec<QueueEvent> {
        if event.execution != self.execution {
            debug!(
                "Discarding event from execution {} of {} (current is {})",
                event.execution, self.resource_id, self.execution
            );
            return Vec::new();
        }

        match event.signal {
            RunnerSignal::CancelAcknowledged => {
                self.on_cancel_acknowledged();
                Vec::new()
            }
            RunnerSignal::Backend(backend_event) => match backend_event {
                BackendEvent::BatchStart(batch) => self.on_batch_start(batch).into_iter().collect(),
                BackendEvent::ResultSetComplete(summary) => {
                    self.on_result_set_complete(summary).into_iter().collect()
                }
                BackendEvent::BatchComplete(batch) => {
                    self.on_batch_complete(batch).into_iter().collect()
                }
                BackendEvent::Message(message) => vec![self.on_message(message)],
                BackendEvent::QueryComplete(info) => {
                    self.on_query_complete(info).into_iter().collect()
                }
                BackendEvent::Failed(error) => self.on_failure(error),
            },
        }
    }

    /// Records a new batch, translating its selection into document
    /// coordinates.
    pub fn on_batch_start(&mut self, mut batch: BatchSummary) -> Option<QueueEvent> {
        if !self.is_executing() {
            warn!("Batch {} started while {} is not executing", batch.id, self.resource_id);
            return None;
        }
        batch.selection = batch.selection.map(|s| s.offset_by(&self.origin));
        self.batches.push(batch.clone());
        Some(QueueEvent::BatchStart { batch })
    }

    /// Stores a finished result set in its batch.
    pub fn on_result_set_complete(&mut self, summary: ResultSetSummary) -> Option<QueueEvent> {
        let Some(batch) = self.batches.iter_mut().find(|b| b.id == summary.batch_id) else {
            warn!(
                "Result set {} refers to unknown batch {} of {}",
                summary.id, summary.batch_id, self.resource_id
            );
            return None;
        };
        batch.store_result_set(summary.clone());
        Some(QueueEvent::ResultSetComplete { summary })
    }

    /// Accumulates the batch's elapsed time.
    pub fn on_batch_complete(&mut self, mut batch: BatchSummary) -> Option<QueueEvent> {
        match batch.execution_elapsed.as_deref() {
            Some(elapsed) => match parse_elapsed_ms(elapsed) {
                Some(ms) => self.elapsed_ms = self.elapsed_ms.saturating_add(ms),
                None => warn!("Unparseable elapsed time '{}' for batch {}", elapsed, batch.id),
            },
            None => debug!("Batch {} reported no elapsed time", batch.id),
        }

        batch.selection = batch.selection.map(|s| s.offset_by(&self.origin));
        if let Some(existing) = self.batches.iter_mut().find(|b| b.id == batch.id) {
            existing.has_error = batch.has_error;
            existing.execution_elapsed = batch.execution_elapsed.clone();
        }
        Some(QueueEvent::BatchComplete { batch })
    }

    /// Forwards a backend message.
    pub fn on_message(&mut self, message: MessageInfo) -> QueueEvent {
        if message.is_error {
            if let Some(batch) = message
                .batch_id
                .and_then(|id| self.batches.iter_mut().find(|b| b.id == id))
            {
                batch.has_error = true;
            }
        }
        QueueEvent::Message { message }
    }

    /// Finishes the execution with the backend's authoritative batch list.
    pub fn on_query_complete(&mut self, info: QueryCompleteInfo) -> Option<QueueEvent> {
        if !self.is_executing() {
            debug!("Ignoring completion for {} in state {:?}", self.resource_id, self.state);
            return None;
        }

        let aborted = self.state == SessionState::Cancelling || self.cancel_acknowledged;
        self.batches = info
            .batch_summaries
            .into_iter()
            .map(|mut batch| {
                batch.selection = batch.selection.map(|s| s.offset_by(&self.origin));
                batch
            })
            .collect();
        self.state = SessionState::Completed;
        self.pump = None;

        info!(
            "Execution {} for {} completed in {}ms{}",
            self.execution,
            self.resource_id,
            self.elapsed_ms,
            if aborted { " (cancelled)" } else { "" }
        );
        Some(QueueEvent::Completed {
            elapsed_ms: self.elapsed_ms,
            aborted,
            batches: self.batches.clone(),
        })
    }

    /// Fails the execution.
    pub fn on_failure(&mut self, error: String) -> Vec<QueueEvent> {
        if !self.is_executing() {
            debug!("Ignoring failure for {} in state {:?}", self.resource_id, self.state);
            return Vec::new();
        }

        warn!("Execution {} for {} failed: {}", self.execution, self.resource_id, error);
        self.state = SessionState::Failed;
        self.pump = None;
        vec![
            QueueEvent::Message {
                message: MessageInfo::error(None, error.clone()),
            },
            QueueEvent::Failed { error },
        ]
    }

    /// Moves to `Cancelling` once the backend has accepted a cancel.
    pub fn on_cancel_acknowledged(&mut self) {
        self.cancel_acknowledged = true;
        if self.state == SessionState::Executing {
            self.state = SessionState::Cancelling;
        }
    }

    /// Builds the cancel round trip for the running execution.
    ///
    /// Returns `None` when nothing is executing. The returned future asks the
    /// backend to cancel and, on success, reports `CancelAcknowledged` on the
    /// runner's event channel before resolving. On failure the state is left
    /// untouched and the error is returned to the caller.
    pub fn cancel(&self) -> Option<impl Future<Output = Result<()>> + Send + 'static> {
        if self.state != SessionState::Executing {
            return None;
        }

        let backend = Arc::clone(&self.backend);
        let resource_id = self.resource_id.clone();
        let execution = self.execution;
        let events = self.events.clone();
        let deadline = self.deadline;

        Some(async move {
            with_deadline(deadline, "cancel query", backend.cancel_query(&resource_id)).await?;
            let _ = events.send(RunnerEvent {
                resource_id,
                execution,
                signal: RunnerSignal::CancelAcknowledged,
            });
            Ok(())
        })
    }

    /// Validates a row window and builds the fetch round trip.
    ///
    /// The window must start inside a result set that has completed; a window
    /// running past the end is clipped.
    pub fn fetch_rows(
        &self,
        window: RowRequest,
    ) -> Result<impl Future<Output = Result<Vec<Row>>> + Send + 'static> {
        let batch = self
            .batches
            .iter()
            .find(|b| b.id == window.batch_id)
            .ok_or_else(|| {
                SessionError::invalid_result_set(format!(
                    "batch {} does not exist in {}",
                    window.batch_id, self.resource_id
                ))
            })?;
        let result_set = batch.result_set(window.result_set_id).ok_or_else(|| {
            SessionError::invalid_result_set(format!(
                "result set {} of batch {} has not completed",
                window.result_set_id, window.batch_id
            ))
        })?;
        if window.row_start >= result_set.row_count {
            return Err(SessionError::invalid_result_set(format!(
                "row {} is outside result set {} of batch {} ({} rows)",
                window.row_start, window.result_set_id, window.batch_id, result_set.row_count
            )));
        }

        let clipped = RowRequest {
            row_count: window
                .row_count
                .min(result_set.row_count - window.row_start),
            ..window
        };
        let backend = Arc::clone(&self.backend);
        let resource_id = self.resource_id.clone();
        let deadline = self.deadline;

        Ok(async move {
            with_deadline(deadline, "fetch rows", backend.get_rows(&resource_id, &clipped)).await
        })
    }

    /// Releases backend resources. Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        if let Some(pump) = self.pump.take() {
            pump.cancel();
        }

        let was_executing = self.is_executing();
        let backend = Arc::clone(&self.backend);
        let resource_id = self.resource_id.clone();
        let deadline = self.deadline;

        debug!("Disposing runner for {}", resource_id);
        tokio::spawn(async move {
            if was_executing {
                if let Err(e) =
                    with_deadline(deadline, "cancel query", backend.cancel_query(&resource_id))
                        .await
                {
                    debug!("Cancel during dispose of {} failed: {}", resource_id, e);
                }
            }
            if let Err(e) = with_deadline(deadline, "dispose", backend.dispose(&resource_id)).await
            {
                warn!("Failed to dispose backend resources for {}: {}", resource_id, e);
            }
        });
    }
}

/// Forwards one execution's backend stream onto the runner channel, in order.
async fn pump_events(
    backend: Arc<dyn QueryBackend>,
    resource_id: ResourceId,
    execution: u64,
    request: QueryRequest,
    events: RunnerEventSender,
    token: CancellationToken,
    deadline: Duration,
) {
    let send = |signal: RunnerSignal| {
        events
            .send(RunnerEvent {
                resource_id: resource_id.clone(),
                execution,
                signal,
            })
            .is_ok()
    };

    let start = tokio::select! {
        biased;
        _ = token.cancelled() => return,
        start = with_deadline(deadline, "start query", backend.run_query(&resource_id, &request)) => start,
    };

    let mut stream = match start {
        Ok(stream) => stream,
        Err(e) => {
            send(RunnerSignal::Backend(BackendEvent::Failed(e.to_string())));
            return;
        }
    };

    loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            next = stream.next() => next,
        };

        match next {
            Some(event) => {
                let terminal = event.is_terminal();
                if !send(RunnerSignal::Backend(event)) || terminal {
                    return;
                }
            }
            None => {
                send(RunnerSignal::Backend(BackendEvent::Failed(
                    "Backend stream ended before the query completed".to_string(),
                )));
                return;
            }
        }
    }
}
