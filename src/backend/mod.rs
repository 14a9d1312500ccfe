//! Backend abstraction layer.
//!
//! The session core never talks to a data source directly. Query execution
//! and object browsing go through the `QueryBackend` and `BrowseBackend`
//! traits, so drivers can be swapped and scripted in tests.

mod mock;
mod postgres;
mod types;

pub use mock::{ScriptedBatch, ScriptedBrowseBackend, ScriptedQueryBackend};
pub use postgres::{PostgresBrowseBackend, PostgresQueryBackend};
pub use types::{
    format_elapsed, BackendEvent, BatchSummary, BrowseSession, ColumnInfo, MessageInfo,
    NodeExpansion, NodeInfo, QueryCompleteInfo, QueryRequest, ResourceId, ResultSetSummary, Row,
    RowRequest, SelectionRange, Value,
};

use crate::config::ConnectionConfig;
use crate::error::{Result, SessionError};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::future::Future;
use std::time::Duration;

/// Ordered stream of lifecycle notifications for one execution.
pub type EventStream = BoxStream<'static, BackendEvent>;

/// Execution driver for queries.
///
/// All operations are keyed by the resource id the execution belongs to; a
/// backend runs at most one execution per resource at a time.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    /// Starts executing the request and returns its event stream.
    ///
    /// The stream must end with `QueryComplete` or `Failed`, and each batch
    /// id must be emitted exactly once.
    async fn run_query(&self, resource: &ResourceId, request: &QueryRequest)
        -> Result<EventStream>;

    /// Asks the backend to stop the running execution.
    async fn cancel_query(&self, resource: &ResourceId) -> Result<()>;

    /// Returns a window of rows from a completed result set.
    async fn get_rows(&self, resource: &ResourceId, window: &RowRequest) -> Result<Vec<Row>>;

    /// Releases whatever the backend holds for the resource.
    async fn dispose(&self, resource: &ResourceId) -> Result<()>;
}

/// Browsing driver for the object tree.
#[async_trait]
pub trait BrowseBackend: Send + Sync {
    /// Opens a browse session for a connection.
    async fn create_session(&self, connection: &ConnectionConfig) -> Result<BrowseSession>;

    /// Lists the children of a node.
    async fn expand_node(&self, session_id: &str, path: &str) -> Result<NodeExpansion>;

    /// Lists the children of a node, bypassing any backend-side cache.
    async fn refresh_node(&self, session_id: &str, path: &str) -> Result<NodeExpansion>;

    /// Closes a browse session.
    async fn close_session(&self, session_id: &str) -> Result<()>;
}

/// Runs a backend round trip under a deadline.
pub async fn with_deadline<T, F>(deadline: Duration, operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::timeout(operation, deadline)),
    }
}
