//! Actor that owns every live session.
//!
//! The registry maps resource ids to a runner and its event queue. It runs as
//! a single task: commands arrive from `SessionRegistryHandle`s and runner
//! events arrive from execution pumps, and both are applied one at a time.
//! Backend round trips (cancel, row fetches) are spawned so they never stall
//! the loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::event_queue::{EventQueue, EventReceiver};
use super::events::QueueEvent;
use super::runner::{RunnerEvent, SessionRunner, SessionState};
use crate::backend::{BatchSummary, QueryBackend, QueryRequest, ResourceId, Row, RowRequest};
use crate::config::SessionSettings;
use crate::error::{Result, SessionError};

/// What a `run` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A new execution was started.
    Submitted { execution: u64 },
    /// The session was already executing; nothing changed.
    AlreadyRunning,
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub resource_id: ResourceId,
    pub title: String,
    pub state: SessionState,
    pub execution: u64,
    pub batches: Vec<BatchSummary>,
    pub elapsed_ms: u64,
    /// Events waiting for a consumer.
    pub pending_events: usize,
    /// Whether a consumer is attached.
    pub ready: bool,
    /// Events dropped because nobody attached in time.
    pub dropped_events: u64,
}

/// Commands sent from handles to the registry actor.
#[derive(Debug)]
enum RegistryCommand {
    Run {
        resource_id: ResourceId,
        request: QueryRequest,
        title: Option<String>,
        reply: oneshot::Sender<Result<RunOutcome>>,
    },
    Cancel {
        resource_id: ResourceId,
        reply: oneshot::Sender<Result<()>>,
    },
    Attach {
        resource_id: ResourceId,
        reply: oneshot::Sender<Result<EventReceiver>>,
    },
    Detach {
        resource_id: ResourceId,
        reply: oneshot::Sender<Result<()>>,
    },
    FetchRows {
        resource_id: ResourceId,
        window: RowRequest,
        reply: oneshot::Sender<Result<Vec<Row>>>,
    },
    IsRunning {
        resource_id: ResourceId,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        resource_id: ResourceId,
        reply: oneshot::Sender<Option<SessionSnapshot>>,
    },
    Dispose {
        resource_id: ResourceId,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// A live session: its runner, its event queue and a display title.
struct SessionEntry {
    runner: SessionRunner,
    queue: EventQueue,
    title: String,
}

impl SessionEntry {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            resource_id: self.runner.resource_id().clone(),
            title: self.title.clone(),
            state: self.runner.state(),
            execution: self.runner.execution(),
            batches: self.runner.batches().to_vec(),
            elapsed_ms: self.runner.elapsed_ms(),
            pending_events: self.queue.pending_count(),
            ready: self.queue.is_ready(),
            dropped_events: self.queue.dropped_count(),
        }
    }
}

/// The registry actor.
pub struct SessionRegistry {
    backend: Arc<dyn QueryBackend>,
    sessions: HashMap<ResourceId, SessionEntry>,
    /// Commands from handles.
    receiver: mpsc::Receiver<RegistryCommand>,
    /// Events from execution pumps; the sender is cloned into each runner.
    runner_tx: mpsc::UnboundedSender<RunnerEvent>,
    runner_rx: mpsc::UnboundedReceiver<RunnerEvent>,
    queue_capacity: usize,
    deadline: Duration,
}

impl SessionRegistry {
    /// Creates the actor and a handle for talking to it.
    ///
    /// The actor does nothing until `run` is awaited, usually on its own task.
    pub fn spawn(
        backend: Arc<dyn QueryBackend>,
        settings: &SessionSettings,
    ) -> (SessionRegistryHandle, Self) {
        let (sender, receiver) = mpsc::channel(settings.command_channel_size.max(1));
        let (runner_tx, runner_rx) = mpsc::unbounded_channel();

        let actor = Self {
            backend,
            sessions: HashMap::new(),
            receiver,
            runner_tx,
            runner_rx,
            queue_capacity: settings.event_queue_capacity,
            deadline: settings.backend_timeout(),
        };

        (SessionRegistryHandle { sender }, actor)
    }

    /// Creates the actor and runs it on a new task.
    pub fn start(
        backend: Arc<dyn QueryBackend>,
        settings: &SessionSettings,
    ) -> (SessionRegistryHandle, JoinHandle<()>) {
        let (handle, actor) = Self::spawn(backend, settings);
        let task = tokio::spawn(actor.run());
        (handle, task)
    }

    /// Runs the actor loop until `Shutdown` is received or every handle is
    /// dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                Some(event) = self.runner_rx.recv() => {
                    self.route(event);
                }

                cmd = self.receiver.recv() => match cmd {
                    Some(RegistryCommand::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        debug!("All registry handles dropped");
                        self.shutdown();
                        break;
                    }
                },
            }
        }
    }

    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Run {
                resource_id,
                request,
                title,
                reply,
            } => {
                let _ = reply.send(self.run_query(resource_id, request, title));
            }
            RegistryCommand::Cancel { resource_id, reply } => {
                self.cancel(&resource_id, reply);
            }
            RegistryCommand::Attach { resource_id, reply } => {
                let _ = reply.send(self.attach(&resource_id));
            }
            RegistryCommand::Detach { resource_id, reply } => {
                let _ = reply.send(self.detach(&resource_id));
            }
            RegistryCommand::FetchRows {
                resource_id,
                window,
                reply,
            } => {
                self.fetch_rows(&resource_id, window, reply);
            }
            RegistryCommand::IsRunning { resource_id, reply } => {
                let running = self
                    .sessions
                    .get(&resource_id)
                    .is_some_and(|entry| entry.runner.is_executing());
                let _ = reply.send(running);
            }
            RegistryCommand::Snapshot { resource_id, reply } => {
                let _ = reply.send(self.sessions.get(&resource_id).map(SessionEntry::snapshot));
            }
            RegistryCommand::Dispose { resource_id, reply } => {
                let _ = reply.send(self.dispose(&resource_id));
            }
            RegistryCommand::Shutdown { .. } => {
                // Handled in run() loop
            }
        }
    }

    /// Looks up or creates the session and submits the request.
    fn run_query(
        &mut self,
        resource_id: ResourceId,
        request: QueryRequest,
        title: Option<String>,
    ) -> Result<RunOutcome> {
        if let Some(entry) = self.sessions.get(&resource_id) {
            if entry.runner.is_executing() {
                debug!("{} is already executing; ignoring run", resource_id);
                return Ok(RunOutcome::AlreadyRunning);
            }
        }

        let entry = match self.sessions.entry(resource_id.clone()) {
            std::collections::hash_map::Entry::Occupied(occupied) => occupied.into_mut(),
            std::collections::hash_map::Entry::Vacant(vacant) => {
                info!("Creating session for {}", resource_id);
                let runner = SessionRunner::new(
                    resource_id.clone(),
                    Arc::clone(&self.backend),
                    self.runner_tx.clone(),
                    self.deadline,
                );
                let mut queue = EventQueue::with_capacity(self.queue_capacity);
                queue.push(QueueEvent::SessionReady {
                    resource_id: resource_id.clone(),
                });
                vacant.insert(SessionEntry {
                    runner,
                    queue,
                    title: resource_id.to_string(),
                })
            }
        };

        if let Some(title) = title {
            entry.title = title;
        }
        entry.runner.submit(request)?;

        let execution = entry.runner.execution();
        entry.queue.push(QueueEvent::Started {
            resource_id,
            title: entry.title.clone(),
            execution,
        });
        Ok(RunOutcome::Submitted { execution })
    }

    fn cancel(&mut self, resource_id: &ResourceId, reply: oneshot::Sender<Result<()>>) {
        let pending = self
            .sessions
            .get(resource_id)
            .and_then(|entry| entry.runner.cancel());

        match pending {
            Some(cancel) => {
                let resource_id = resource_id.clone();
                tokio::spawn(async move {
                    let result = cancel.await;
                    if let Err(e) = &result {
                        warn!("Cancel for {} failed: {}", resource_id, e);
                    }
                    let _ = reply.send(result);
                });
            }
            None => {
                debug!("Nothing to cancel for {}", resource_id);
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn attach(&mut self, resource_id: &ResourceId) -> Result<EventReceiver> {
        let entry = self
            .sessions
            .get_mut(resource_id)
            .ok_or_else(|| SessionError::unknown_session(resource_id.as_str()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let delivered = entry.queue.mark_ready(tx);
        debug!(
            "Consumer attached to {}; replayed {} buffered events",
            resource_id, delivered
        );
        Ok(rx)
    }

    fn detach(&mut self, resource_id: &ResourceId) -> Result<()> {
        let entry = self
            .sessions
            .get_mut(resource_id)
            .ok_or_else(|| SessionError::unknown_session(resource_id.as_str()))?;
        entry.queue.detach();
        Ok(())
    }

    fn fetch_rows(
        &mut self,
        resource_id: &ResourceId,
        window: RowRequest,
        reply: oneshot::Sender<Result<Vec<Row>>>,
    ) {
        let fetch = match self.sessions.get(resource_id) {
            Some(entry) => entry.runner.fetch_rows(window),
            None => Err(SessionError::unknown_session(resource_id.as_str())),
        };

        match fetch {
            Ok(fetch) => {
                tokio::spawn(async move {
                    let _ = reply.send(fetch.await);
                });
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn dispose(&mut self, resource_id: &ResourceId) -> bool {
        match self.sessions.remove(resource_id) {
            Some(mut entry) => {
                info!("Disposing session {}", resource_id);
                entry.runner.dispose();
                true
            }
            None => false,
        }
    }

    /// Applies a runner event and publishes what it produces.
    fn route(&mut self, event: RunnerEvent) {
        let Some(entry) = self.sessions.get_mut(&event.resource_id) else {
            debug!("Dropping event for disposed session {}", event.resource_id);
            return;
        };

        for published in entry.runner.handle(event) {
            entry.queue.push(published);
        }
    }

    fn shutdown(&mut self) {
        info!("Shutting down session registry ({} sessions)", self.sessions.len());
        for (_, mut entry) in self.sessions.drain() {
            entry.runner.dispose();
        }
    }
}

/// Handle for talking to the registry actor.
///
/// Cheap to clone. Every call is a request/reply round trip; once the actor
/// has stopped, calls fail with an internal error.
#[derive(Clone)]
pub struct SessionRegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
}

impl SessionRegistryHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(make(reply))
            .await
            .map_err(|_| SessionError::internal("Session registry closed"))?;
        rx.await
            .map_err(|_| SessionError::internal("Session registry dropped the request"))
    }

    /// Starts executing `request` for a resource.
    ///
    /// Creates the session on first use. A session that is already executing
    /// is left alone and `RunOutcome::AlreadyRunning` is returned.
    pub async fn run(
        &self,
        resource_id: impl Into<ResourceId>,
        request: QueryRequest,
        title: Option<String>,
    ) -> Result<RunOutcome> {
        let resource_id = resource_id.into();
        self.request(|reply| RegistryCommand::Run {
            resource_id,
            request,
            title,
            reply,
        })
        .await?
    }

    /// Cancels the running execution. Succeeds when nothing is running.
    pub async fn cancel(&self, resource_id: impl Into<ResourceId>) -> Result<()> {
        let resource_id = resource_id.into();
        self.request(|reply| RegistryCommand::Cancel { resource_id, reply })
            .await?
    }

    /// Attaches a consumer, returning a receiver that yields every buffered
    /// event followed by live ones.
    ///
    /// Attaching again replaces the previous consumer, whose receiver closes.
    pub async fn attach(&self, resource_id: impl Into<ResourceId>) -> Result<EventReceiver> {
        let resource_id = resource_id.into();
        self.request(|reply| RegistryCommand::Attach { resource_id, reply })
            .await?
    }

    /// Detaches the consumer; later events are buffered again.
    pub async fn detach(&self, resource_id: impl Into<ResourceId>) -> Result<()> {
        let resource_id = resource_id.into();
        self.request(|reply| RegistryCommand::Detach { resource_id, reply })
            .await?
    }

    /// Fetches a window of rows from a completed result set.
    pub async fn fetch_rows(
        &self,
        resource_id: impl Into<ResourceId>,
        window: RowRequest,
    ) -> Result<Vec<Row>> {
        let resource_id = resource_id.into();
        self.request(|reply| RegistryCommand::FetchRows {
            resource_id,
            window,
            reply,
        })
        .await?
    }

    /// Returns whether the session is executing. False for unknown sessions
    /// and once the registry has stopped.
    pub async fn is_running(&self, resource_id: impl Into<ResourceId>) -> bool {
        let resource_id = resource_id.into();
        self.request(|reply| RegistryCommand::IsRunning { resource_id, reply })
            .await
            .unwrap_or(false)
    }

    /// Returns a snapshot of the session, or `None` if it does not exist.
    pub async fn snapshot(
        &self,
        resource_id: impl Into<ResourceId>,
    ) -> Result<Option<SessionSnapshot>> {
        let resource_id = resource_id.into();
        self.request(|reply| RegistryCommand::Snapshot { resource_id, reply })
            .await
    }

    /// Returns the session's state.
    pub async fn state(&self, resource_id: impl Into<ResourceId>) -> Result<SessionState> {
        Ok(self.existing(resource_id.into()).await?.state)
    }

    /// Returns the batches of the current or last execution.
    pub async fn batches(&self, resource_id: impl Into<ResourceId>) -> Result<Vec<BatchSummary>> {
        Ok(self.existing(resource_id.into()).await?.batches)
    }

    /// Returns the elapsed time accumulated by the current or last execution.
    pub async fn elapsed_ms(&self, resource_id: impl Into<ResourceId>) -> Result<u64> {
        Ok(self.existing(resource_id.into()).await?.elapsed_ms)
    }

    /// Disposes a session, cancelling it if it is running. Returns whether
    /// the session existed.
    pub async fn dispose(&self, resource_id: impl Into<ResourceId>) -> Result<bool> {
        let resource_id = resource_id.into();
        self.request(|reply| RegistryCommand::Dispose { resource_id, reply })
            .await
    }

    /// Disposes every session and stops the actor.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| RegistryCommand::Shutdown { reply })
            .await
    }

    async fn existing(&self, resource_id: ResourceId) -> Result<SessionSnapshot> {
        let id = resource_id.to_string();
        self.snapshot(resource_id)
            .await?
            .ok_or_else(|| SessionError::unknown_session(id))
    }
}
