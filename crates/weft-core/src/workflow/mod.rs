//! Workflow engine: graph builder, execution engine, runs, and snapshots.
//!
//! - `builder` -- fluent `Workflow` construction, commit, and run registry
//! - `graph` -- execution graph entries and their serialized form
//! - `step` -- the `Step` trait, its object-safe twin, and closure steps
//! - `context` -- what a step or condition sees while running
//! - `engine` -- recursive graph executor producing a `WorkflowResult`
//! - `run` -- a single run: start, resume, stream, watch, cancel
//! - `nested` -- a committed workflow used as a step of another
//! - `mapping` -- field mappings behind `map_fields`
//! - `checkpoint` -- snapshot persistence policy over a `WorkflowStore`
//! - `retry` -- attempt counting and backoff between attempts
//! - `emitter` / `state` -- event channels and cumulative watch state

pub mod builder;
pub mod checkpoint;
pub mod context;
pub mod emitter;
pub mod engine;
pub mod graph;
pub mod mapping;
pub mod nested;
pub mod retry;
pub mod run;
pub mod runtime_context;
pub mod state;
pub mod step;

pub use builder::{CreateRunOptions, Workflow};
pub use context::{ConditionContext, ResumeInfo, StepContext};
pub use engine::{ExecutionEngine, WorkflowResult};
pub use graph::{Condition, GraphEntry};
pub use mapping::MapField;
pub use run::{ResumeOptions, Run, WorkflowStream};
pub use runtime_context::RuntimeContext;
pub use step::{Step, StepError, StepOutcome, StepRef, create_step};

use weft_types::workflow::WorkflowRunStatus;

use checkpoint::CheckpointError;

/// Errors raised by workflow construction and run control.
///
/// Step failures are not errors here; they end up in a `Failed` result.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow {0} has no steps")]
    EmptyGraph(String),

    #[error("workflow {0} must be committed before creating runs")]
    Uncommitted(String),

    #[error("step id \"input\" is reserved")]
    ReservedStepId,

    #[error("mapping {mapping} in workflow {workflow} references unknown step {step}")]
    InvalidStepReference {
        workflow: String,
        mapping: String,
        step: String,
    },

    #[error("resume path does not match the graph: {path}")]
    InvalidResumePath { path: String },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("no snapshot found for run {0}")]
    SnapshotNotFound(String),

    #[error("run {run_id} is not suspended (status: {status})")]
    NotSuspended {
        run_id: String,
        status: WorkflowRunStatus,
    },

    #[error("step {step} is not suspended; suspended steps: {available:?}")]
    StepNotSuspended { step: String, available: Vec<String> },

    #[error("execution error: {0}")]
    Execution(String),
}

impl From<CheckpointError> for WorkflowError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::Repository(message) => WorkflowError::Persistence(message),
            CheckpointError::RunNotFound(run_id) => WorkflowError::SnapshotNotFound(run_id),
        }
    }
}
