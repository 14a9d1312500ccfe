//! Integration tests for the session core.

pub mod explorer_test;
pub mod postgres_test;
pub mod session_test;
