//! Shared storage integration tests.
//!
//! Tests the StatusStore interface against all implementations.
//! Each implementation module imports these test functions and runs them.

pub mod status_store_tests;
