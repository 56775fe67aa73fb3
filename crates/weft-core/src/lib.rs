//! Workflow engine and snapshot-store traits for weft.
//!
//! This crate defines the `WorkflowStore` port that storage adapters
//! implement, plus the builder, executor, and run handles. It depends only
//! on `weft-types` -- never on `weft-infra` or any database crate.

pub mod repository;
pub mod workflow;
