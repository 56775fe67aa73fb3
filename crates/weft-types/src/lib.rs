//! Shared domain types for weft.
//!
//! This crate contains the types shared by the workflow engine and its
//! storage adapters: step results, run snapshots, run records, observation
//! events, engine configuration, and repository errors.
//!
//! Zero infrastructure dependencies -- only serde, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
