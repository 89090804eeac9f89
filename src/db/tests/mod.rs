//! Shared repository tests.
//!
//! Each repository has a test module containing shared test functions that
//! take `&dyn XxxRepo`, instantiated once for the in-memory store and once for
//! SQLite (in-memory database with real migrations).

mod consume_logs;
pub mod harness;
