//! Error types for the session core.
//!
//! Defines the main error enum used throughout the crate.

use std::time::Duration;
use thiserror::Error;

/// Main error type for session operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A submit arrived while the session was still executing.
    #[error("Session '{0}' is already executing a query")]
    AlreadyExecuting(String),

    /// No registry entry or browse session exists for the identifier.
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    /// No browse provider is registered under the given id.
    #[error("Invalid provider: {0}")]
    InvalidProvider(String),

    /// A node path that is not part of the session's tree.
    #[error("Unknown node '{path}' in session '{session}'")]
    UnknownNode { session: String, path: String },

    /// Row window, batch id or result set id outside what the session holds.
    #[error("Invalid result set: {0}")]
    InvalidResultSet(String),

    /// Failure reported by the execution or browsing driver.
    #[error("Backend error: {0}")]
    Backend(String),

    /// A backend round trip exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Database connection errors (host unreachable, auth failed, etc.)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Configuration errors (invalid config file, missing required fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal errors (registry task gone, unexpected states, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Creates an already-executing error for the given resource.
    pub fn already_executing(resource: impl Into<String>) -> Self {
        Self::AlreadyExecuting(resource.into())
    }

    /// Creates an unknown-session error.
    pub fn unknown_session(id: impl Into<String>) -> Self {
        Self::UnknownSession(id.into())
    }

    /// Creates an invalid-provider error.
    pub fn invalid_provider(id: impl Into<String>) -> Self {
        Self::InvalidProvider(id.into())
    }

    /// Creates an unknown-node error.
    pub fn unknown_node(session: impl Into<String>, path: impl Into<String>) -> Self {
        Self::UnknownNode {
            session: session.into(),
            path: path.into(),
        }
    }

    /// Creates an invalid-result-set error with the given message.
    pub fn invalid_result_set(msg: impl Into<String>) -> Self {
        Self::InvalidResultSet(msg.into())
    }

    /// Creates a backend error with the given message.
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Creates a timeout error for the named operation.
    pub fn timeout(operation: &'static str, after: Duration) -> Self {
        Self::Timeout { operation, after }
    }

    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::AlreadyExecuting(_) => "Busy",
            Self::UnknownSession(_) | Self::UnknownNode { .. } => "Unknown Session",
            Self::InvalidProvider(_) => "Invalid Provider",
            Self::InvalidResultSet(_) => "Invalid Result Set",
            Self::Backend(_) => "Backend Error",
            Self::Timeout { .. } => "Timeout",
            Self::Connection(_) => "Connection Error",
            Self::Config(_) => "Configuration Error",
            Self::Internal(_) => "Internal Error",
        }
    }
}

/// Result type alias using SessionError.
pub type Result<T> = std::result::Result<T, SessionError>;
