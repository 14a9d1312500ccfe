//! Query and browse session core.
//!
//! Runs queries against a data source on behalf of many documents at once,
//! buffers each session's lifecycle events until a consumer attaches, and
//! caches hierarchical object browsing.

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod explorer;
pub mod logging;
pub mod session;
