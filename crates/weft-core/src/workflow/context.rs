//! Execution contexts handed to steps and conditions, plus the shared
//! step-results accumulator they read from.

use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use weft_types::event::WorkflowEvent;
use weft_types::workflow::{StepResult, StepResults};

use super::emitter::Emitter;
use super::runtime_context::RuntimeContext;
use super::step::{StepError, StepOutcome};

// ---------------------------------------------------------------------------
// StepResultStore
// ---------------------------------------------------------------------------

/// Accumulated step results of one execution.
///
/// Shared by reference across recursive entry execution. Concurrent siblings
/// write distinct keys; the sharded map keeps those writes race-free.
#[derive(Debug, Clone)]
pub struct StepResultStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    input: Value,
    steps: DashMap<String, StepResult>,
}

impl StepResultStore {
    pub fn new(input: Value) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                input,
                steps: DashMap::new(),
            }),
        }
    }

    /// Seed the store from a previously persisted results map (resume).
    pub fn from_results(results: StepResults) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                input: results.input,
                steps: results.steps.into_iter().collect(),
            }),
        }
    }

    /// The run's original input.
    pub fn input(&self) -> &Value {
        &self.inner.input
    }

    pub fn get(&self, step_id: &str) -> Option<StepResult> {
        self.inner.steps.get(step_id).map(|r| r.value().clone())
    }

    /// Latest output recorded for a step, whatever its status.
    pub fn output(&self, step_id: &str) -> Option<Value> {
        self.inner.steps.get(step_id).and_then(|r| r.output.clone())
    }

    /// Output of a step only if its latest invocation succeeded.
    pub fn successful_output(&self, step_id: &str) -> Option<Value> {
        self.inner
            .steps
            .get(step_id)
            .filter(|r| r.is_success())
            .and_then(|r| r.output.clone())
    }

    /// Overlay `result` onto the existing record for `step_id`.
    pub fn merge(&self, step_id: &str, result: StepResult) {
        let mut entry = self
            .inner
            .steps
            .entry(step_id.to_string())
            .or_insert_with(|| StepResult::with_status(result.status));
        let merged = entry.clone().merged_with(result);
        *entry = merged;
    }

    pub fn insert(&self, step_id: &str, result: StepResult) {
        self.inner.steps.insert(step_id.to_string(), result);
    }

    /// Point-in-time copy suitable for snapshots and events.
    pub fn snapshot(&self) -> StepResults {
        StepResults {
            input: self.inner.input.clone(),
            steps: self
                .inner
                .steps
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// Resume information handed to the step being resumed.
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeInfo {
    /// Remaining path below this step (non-empty only for nested workflows).
    pub steps: Vec<String>,
    pub resume_payload: Value,
    /// Run id of the nested run that suspended, if this step is a workflow.
    pub run_id: Option<String>,
}

/// Everything a step body can see and do.
#[derive(Clone)]
pub struct StepContext {
    pub(crate) workflow_id: String,
    pub(crate) run_id: String,
    pub(crate) step_id: String,
    pub(crate) input_data: Value,
    pub(crate) resume: Option<ResumeInfo>,
    pub(crate) run_count: u32,
    pub(crate) execution_path: Vec<usize>,
    pub(crate) results: StepResultStore,
    pub(crate) runtime_context: RuntimeContext,
    pub(crate) emitter: Emitter,
    pub(crate) cancel: CancellationToken,
}

impl StepContext {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// Output of the previous entry (or the run input for the first entry).
    pub fn input_data(&self) -> &Value {
        &self.input_data
    }

    /// Deserialize the input into a concrete type.
    pub fn input_as<T: DeserializeOwned>(&self) -> Result<T, StepError> {
        Ok(serde_json::from_value(self.input_data.clone())?)
    }

    /// Data passed to `resume` (or the awaited event), only for the step
    /// being resumed.
    pub fn resume_data(&self) -> Option<&Value> {
        self.resume.as_ref().map(|r| &r.resume_payload)
    }

    pub fn resume_info(&self) -> Option<&ResumeInfo> {
        self.resume.as_ref()
    }

    /// Number of earlier invocations of this step id within the run.
    pub fn run_count(&self) -> u32 {
        self.run_count
    }

    pub fn execution_path(&self) -> &[usize] {
        &self.execution_path
    }

    /// The run's original input.
    pub fn get_init_data(&self) -> &Value {
        self.results.input()
    }

    /// Output of an earlier step, if it completed successfully.
    pub fn get_step_result(&self, step_id: &str) -> Option<Value> {
        self.results.successful_output(step_id)
    }

    pub fn runtime_context(&self) -> &RuntimeContext {
        &self.runtime_context
    }

    /// Build the outcome that pauses the run with `payload`.
    pub fn suspend(&self, payload: Value) -> StepOutcome {
        StepOutcome::Suspended(payload)
    }

    /// Build the outcome that ends the run early with `value` as its result.
    pub fn bail(&self, value: Value) -> StepOutcome {
        StepOutcome::Bailed(value)
    }

    /// Cancel the whole run.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Token that fires when the run is cancelled.
    pub fn abort_signal(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Publish a custom event on the run's discrete event channel.
    pub fn emit(&self, event: WorkflowEvent) {
        self.emitter.emit_event(event);
    }

    pub(crate) fn emitter(&self) -> &Emitter {
        &self.emitter
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("workflow_id", &self.workflow_id)
            .field("run_id", &self.run_id)
            .field("step_id", &self.step_id)
            .field("run_count", &self.run_count)
            .field("execution_path", &self.execution_path)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ConditionContext
// ---------------------------------------------------------------------------

/// What branch and loop conditions can see.
#[derive(Clone)]
pub struct ConditionContext {
    pub(crate) workflow_id: String,
    pub(crate) run_id: String,
    pub(crate) input_data: Value,
    pub(crate) iteration_count: u32,
    pub(crate) results: StepResultStore,
    pub(crate) runtime_context: RuntimeContext,
}

impl ConditionContext {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Output of the previous entry (for loops: the latest iteration's output).
    pub fn input_data(&self) -> &Value {
        &self.input_data
    }

    pub fn input_as<T: DeserializeOwned>(&self) -> Result<T, StepError> {
        Ok(serde_json::from_value(self.input_data.clone())?)
    }

    /// Completed loop iterations before this evaluation (0 for branches).
    pub fn iteration_count(&self) -> u32 {
        self.iteration_count
    }

    pub fn get_init_data(&self) -> &Value {
        self.results.input()
    }

    pub fn get_step_result(&self, step_id: &str) -> Option<Value> {
        self.results.successful_output(step_id)
    }

    pub fn runtime_context(&self) -> &RuntimeContext {
        &self.runtime_context
    }
}
