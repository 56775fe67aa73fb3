//! Infrastructure layer for weft.
//!
//! Implements the `WorkflowStore` port from `weft-core` on SQLite, and loads
//! engine configuration from the data directory.

pub mod config;
pub mod sqlite;
