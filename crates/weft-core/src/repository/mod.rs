//! Snapshot store trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (weft-infra) implements. The core crate never depends on any specific
//! storage technology; it ships only a type-erased wrapper and an in-memory
//! implementation.

pub mod box_store;
pub mod in_memory;
pub mod workflow;

pub use box_store::BoxWorkflowStore;
pub use in_memory::InMemoryWorkflowStore;
pub use workflow::WorkflowStore;
