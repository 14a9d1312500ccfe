//! Events delivered to session consumers.

use crate::backend::{BatchSummary, MessageInfo, ResourceId, ResultSetSummary};
use serde::Serialize;

/// A lifecycle or progress notification for one session.
///
/// Each variant carries what a consumer needs to rebuild its view of the
/// session without querying the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    /// The registry created the session.
    SessionReady { resource_id: ResourceId },

    /// An execution began.
    Started {
        resource_id: ResourceId,
        title: String,
        execution: u64,
    },

    /// A batch began, with its selection in document coordinates.
    BatchStart { batch: BatchSummary },

    /// A result set finished and its rows can be fetched.
    ResultSetComplete { summary: ResultSetSummary },

    /// A batch finished.
    BatchComplete { batch: BatchSummary },

    /// A backend message; `is_error` marks per-batch failures.
    Message { message: MessageInfo },

    /// The execution finished, possibly after a cancel.
    Completed {
        elapsed_ms: u64,
        aborted: bool,
        batches: Vec<BatchSummary>,
    },

    /// The execution failed as a whole.
    Failed { error: String },
}

impl QueueEvent {
    /// Short name of the variant, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionReady { .. } => "session_ready",
            Self::Started { .. } => "started",
            Self::BatchStart { .. } => "batch_start",
            Self::ResultSetComplete { .. } => "result_set_complete",
            Self::BatchComplete { .. } => "batch_complete",
            Self::Message { .. } => "message",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
        }
    }

    /// Returns true for the events that end an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}
