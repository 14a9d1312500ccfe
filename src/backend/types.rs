//! Data types shared between backends and the session core.
//!
//! Batches, result sets and rows are opaque to the core beyond the fields
//! defined here.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Opaque identifier of a document/connection-bound execution context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    /// Creates a resource id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(v: &str) -> Self {
        Self(v.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(v: String) -> Self {
        Self(v)
    }
}

/// A span of text inside the originating document, zero-based.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl SelectionRange {
    /// Creates a selection range.
    pub fn new(start_line: u32, start_column: u32, end_line: u32, end_column: u32) -> Self {
        Self {
            start_line,
            start_column,
            end_line,
            end_column,
        }
    }

    /// Translates a range relative to a submitted selection into document
    /// coordinates.
    ///
    /// Lines shift by the selection's start line. Columns only shift on the
    /// first line, since later lines start at column zero in both frames.
    pub fn offset_by(&self, origin: &SelectionRange) -> Self {
        Self {
            start_line: self.start_line.saturating_add(origin.start_line),
            start_column: if self.start_line == 0 {
                self.start_column.saturating_add(origin.start_column)
            } else {
                self.start_column
            },
            end_line: self.end_line.saturating_add(origin.start_line),
            end_column: if self.end_line == 0 {
                self.end_column.saturating_add(origin.start_column)
            } else {
                self.end_column
            },
        }
    }
}

/// The unit of work handed to a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Query text; opaque to the core.
    pub text: String,

    /// Where the text came from in the document, if it was a selection.
    pub selection: Option<SelectionRange>,
}

impl QueryRequest {
    /// Creates a request for a whole document.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            selection: None,
        }
    }

    /// Sets the originating selection.
    pub fn with_selection(mut self, selection: SelectionRange) -> Self {
        self.selection = Some(selection);
        self
    }
}

/// Metadata about a column in a result set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,

    /// Column data type.
    pub data_type: String,
}

impl ColumnInfo {
    /// Creates a new column info with the given name and type.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// Summary of one tabular output within a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSetSummary {
    /// Index of the result set within its batch.
    pub id: u32,

    /// Batch the result set belongs to.
    pub batch_id: u32,

    /// Number of rows available through `get_rows`.
    pub row_count: u64,

    /// Column schema.
    pub columns: Vec<ColumnInfo>,

    /// Whether the backend has finished producing rows.
    pub complete: bool,
}

/// One logical unit of backend execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Batch id, unique within one execution.
    pub id: u32,

    /// Position of the batch text, relative to the submitted request until the
    /// runner translates it.
    pub selection: Option<SelectionRange>,

    /// Whether any message in the batch was an error.
    #[serde(default)]
    pub has_error: bool,

    /// Elapsed time as reported by the backend, `HH:MM:SS.fff`.
    pub execution_elapsed: Option<String>,

    /// Result sets produced so far, ordered by id.
    #[serde(default)]
    pub result_set_summaries: Vec<ResultSetSummary>,
}

impl BatchSummary {
    /// Creates an empty batch summary.
    pub fn new(id: u32) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Stores a result set summary in its slot, replacing an earlier version.
    pub fn store_result_set(&mut self, summary: ResultSetSummary) {
        match self
            .result_set_summaries
            .iter_mut()
            .find(|rs| rs.id == summary.id)
        {
            Some(existing) => *existing = summary,
            None => {
                self.result_set_summaries.push(summary);
                self.result_set_summaries.sort_by_key(|rs| rs.id);
            }
        }
    }

    /// Looks up a result set by id.
    pub fn result_set(&self, id: u32) -> Option<&ResultSetSummary> {
        self.result_set_summaries.iter().find(|rs| rs.id == id)
    }
}

/// A message produced while a batch ran.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInfo {
    /// Batch the message belongs to, if any.
    pub batch_id: Option<u32>,

    /// Whether the message reports an error.
    pub is_error: bool,

    /// Message text.
    pub message: String,
}

impl MessageInfo {
    /// Creates an informational message.
    pub fn info(batch_id: Option<u32>, message: impl Into<String>) -> Self {
        Self {
            batch_id,
            is_error: false,
            message: message.into(),
        }
    }

    /// Creates an error message.
    pub fn error(batch_id: Option<u32>, message: impl Into<String>) -> Self {
        Self {
            batch_id,
            is_error: true,
            message: message.into(),
        }
    }
}

/// Final report of a finished query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCompleteInfo {
    /// Authoritative list of batches.
    pub batch_summaries: Vec<BatchSummary>,
}

/// Lifecycle notification emitted by a query backend.
///
/// Within one execution, a batch's `BatchStart` precedes its
/// `ResultSetComplete`s, which precede its `BatchComplete`, and everything
/// precedes the terminal `QueryComplete` or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendEvent {
    BatchStart(BatchSummary),
    ResultSetComplete(ResultSetSummary),
    BatchComplete(BatchSummary),
    Message(MessageInfo),
    QueryComplete(QueryCompleteInfo),
    /// The execution failed as a whole.
    Failed(String),
}

impl BackendEvent {
    /// Returns true for events that end an execution.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::QueryComplete(_) | Self::Failed(_))
    }
}

/// A window of rows requested from one result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRequest {
    pub batch_id: u32,
    pub result_set_id: u32,
    pub row_start: u64,
    pub row_count: u64,
}

impl RowRequest {
    /// Creates a row window request.
    pub fn new(batch_id: u32, result_set_id: u32, row_start: u64, row_count: u64) -> Self {
        Self {
            batch_id,
            result_set_id,
            row_start,
            row_count,
        }
    }
}

/// A row of data from a result set.
pub type Row = Vec<Value>;

/// Represents a single value from a database query.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub enum Value {
    /// NULL value.
    #[default]
    Null,

    /// Boolean value.
    Bool(bool),

    /// Signed integer (up to i64).
    Int(i64),

    /// Floating point number.
    Float(f64),

    /// Text/string value.
    String(String),

    /// Binary data.
    Bytes(Vec<u8>),
}

impl Value {
    /// Returns true if this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Value::Null,
        }
    }
}

/// Formats a duration the way backends report batch elapsed time,
/// `HH:MM:SS.fff`.
pub fn format_elapsed(duration: Duration) -> String {
    let total_ms = duration.as_millis();
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms / 60_000) % 60;
    let seconds = (total_ms / 1_000) % 60;
    let millis = total_ms % 1_000;
    format!("{hours:02}:{minutes:02}:{seconds:02}.{millis:03}")
}

/// A node as reported by a browse backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Path of the node, unique within its session.
    pub path: String,

    /// Display label.
    pub label: String,

    /// Kind of object, e.g. "Schema", "Table", "Column".
    pub node_type: String,

    /// Whether the node can never have children.
    pub is_leaf: bool,
}

impl NodeInfo {
    /// Creates an expandable node.
    pub fn folder(
        path: impl Into<String>,
        label: impl Into<String>,
        node_type: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            label: label.into(),
            node_type: node_type.into(),
            is_leaf: false,
        }
    }

    /// Creates a leaf node.
    pub fn leaf(
        path: impl Into<String>,
        label: impl Into<String>,
        node_type: impl Into<String>,
    ) -> Self {
        Self {
            is_leaf: true,
            ..Self::folder(path, label, node_type)
        }
    }
}

/// A newly created browse session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseSession {
    pub session_id: String,
    pub root: NodeInfo,
}

/// The answer to an expand or refresh request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeExpansion {
    /// Children in display order.
    pub children: Vec<NodeInfo>,

    /// Set when the backend could not expand the node.
    pub error_message: Option<String>,
}

impl NodeExpansion {
    /// Creates a successful expansion.
    pub fn with_children(children: Vec<NodeInfo>) -> Self {
        Self {
            children,
            error_message: None,
        }
    }

    /// Creates a failed expansion.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            children: Vec::new(),
            error_message: Some(message.into()),
        }
    }
}
