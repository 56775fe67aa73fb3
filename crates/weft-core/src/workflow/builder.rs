//! Workflow builder and run registry.
//!
//! A [`Workflow`] accumulates graph entries through chained calls. `commit`
//! validates and freezes the graph; runs are then created against the
//! frozen copy and tracked in a registry until they settle.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;
use weft_types::config::{EngineConfig, RetryConfig};
use weft_types::workflow::{
    ForeachOptions, LoopType, SerializedStepFlowEntry, StepSchemas, WorkflowRunExecutionResult,
    WorkflowRunRecord, WorkflowRunSnapshot, WorkflowRuns, WorkflowRunsQuery,
};

use crate::repository::box_store::BoxWorkflowStore;
use crate::repository::in_memory::InMemoryWorkflowStore;

use super::WorkflowError;
use super::context::StepContext;
use super::engine::ExecutionEngine;
use super::graph::{Condition, GraphEntry};
use super::mapping::{MapField, MapStep};
use super::run::Run;
use super::step::{StepError, StepOutcome, StepRef, create_step};

/// Step id reserved for the run input in the step-results map.
pub const RESERVED_INPUT_ID: &str = "input";

/// Options for [`Workflow::create_run`].
#[derive(Debug, Clone, Default)]
pub struct CreateRunOptions {
    /// Reuse this run id instead of allocating one.
    pub run_id: Option<String>,
    pub resource_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

pub struct Workflow {
    pub(crate) id: String,
    pub(crate) description: Option<String>,
    pub(crate) schemas: StepSchemas,
    config: EngineConfig,
    store: BoxWorkflowStore,
    step_flow: Vec<GraphEntry>,
    execution_graph: Option<Arc<Vec<GraphEntry>>>,
    pub(crate) serialized_step_flow: Vec<SerializedStepFlowEntry>,
    /// `(mapping step id, referenced step ids)` for every `map_fields` entry.
    map_references: Vec<(String, Vec<String>)>,
    runs: Arc<DashMap<String, Arc<Run>>>,
}

impl Workflow {
    /// A new, empty workflow backed by an in-memory snapshot store.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            schemas: StepSchemas::default(),
            config: EngineConfig::default(),
            store: BoxWorkflowStore::new(InMemoryWorkflowStore::new()),
            step_flow: Vec::new(),
            execution_graph: None,
            serialized_step_flow: Vec::new(),
            map_references: Vec::new(),
            runs: Arc::new(DashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Structural description of the committed graph.
    pub fn serialized_step_graph(&self) -> &[SerializedStepFlowEntry] {
        &self.serialized_step_flow
    }

    pub fn is_committed(&self) -> bool {
        self.execution_graph.is_some()
    }

    // -- configuration ------------------------------------------------------

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_store(mut self, store: BoxWorkflowStore) -> Self {
        self.store = store;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.schemas.input_schema = Some(schema);
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.schemas.output_schema = Some(schema);
        self
    }

    // -- graph construction -------------------------------------------------

    fn push(mut self, entry: GraphEntry) -> Self {
        self.step_flow.push(entry);
        self
    }

    pub fn then(self, step: StepRef) -> Self {
        self.push(GraphEntry::Step { step })
    }

    pub fn parallel(self, steps: Vec<StepRef>) -> Self {
        let steps = steps.into_iter().map(|step| GraphEntry::Step { step }).collect();
        self.push(GraphEntry::Parallel { steps })
    }

    /// Run every step whose condition holds, concurrently.
    pub fn branch(self, branches: Vec<(Condition, StepRef)>) -> Self {
        let (conditions, steps): (Vec<_>, Vec<_>) = branches
            .into_iter()
            .map(|(condition, step)| (condition, GraphEntry::Step { step }))
            .unzip();
        self.push(GraphEntry::Conditional { steps, conditions })
    }

    /// Run `step`, then repeat while `condition` holds.
    pub fn dowhile(self, step: StepRef, condition: Condition) -> Self {
        self.push(GraphEntry::Loop {
            step,
            condition,
            loop_type: LoopType::DoWhile,
        })
    }

    /// Run `step`, then repeat until `condition` holds.
    pub fn dountil(self, step: StepRef, condition: Condition) -> Self {
        self.push(GraphEntry::Loop {
            step,
            condition,
            loop_type: LoopType::DoUntil,
        })
    }

    /// Run `step` over every item of the previous output, using the
    /// configured default concurrency.
    pub fn foreach(self, step: StepRef) -> Self {
        let opts = ForeachOptions {
            concurrency: self.config.foreach_concurrency,
        };
        self.foreach_with(step, opts)
    }

    pub fn foreach_with(self, step: StepRef, opts: ForeachOptions) -> Self {
        self.push(GraphEntry::Foreach { step, opts })
    }

    pub fn sleep(self, duration: Duration) -> Self {
        self.push(GraphEntry::Sleep {
            id: format!("sleep_{}", Uuid::now_v7()),
            duration,
        })
    }

    pub fn sleep_until(self, date: DateTime<Utc>) -> Self {
        self.push(GraphEntry::SleepUntil {
            id: format!("sleep_{}", Uuid::now_v7()),
            date,
        })
    }

    /// Block until `event` is sent to the run, then run `step` with the
    /// event data as its resume data. A timeout fails the entry.
    pub fn wait_for_event(
        self,
        event: impl Into<String>,
        step: StepRef,
        timeout: Option<Duration>,
    ) -> Self {
        self.push(GraphEntry::WaitForEvent {
            event: event.into(),
            step,
            timeout,
        })
    }

    /// Transform the previous output with a closure.
    pub fn map<F, Fut>(self, f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        let step = create_step(format!("mapping_{}", Uuid::now_v7()), move |ctx| {
            let output = f(ctx);
            async move { output.await.map(StepOutcome::Success) }
        })
        .with_map_config("<function>");
        self.then(Arc::new(step))
    }

    /// Build an object from per-field mappings.
    pub fn map_fields<K: Into<String>>(mut self, fields: Vec<(K, MapField)>) -> Self {
        let id = format!("mapping_{}", Uuid::now_v7());
        let step = MapStep::new(
            id.clone(),
            fields.into_iter().map(|(name, field)| (name.into(), field)).collect(),
        );
        self.map_references.push((id, step.step_refs()));
        self.then(Arc::new(step))
    }

    /// Validate and freeze the graph built so far.
    pub fn commit(mut self) -> Result<Self, WorkflowError> {
        let step_ids: HashSet<String> = self.step_flow.iter().flat_map(GraphEntry::step_ids).collect();

        if step_ids.contains(RESERVED_INPUT_ID) {
            return Err(WorkflowError::ReservedStepId);
        }

        for (mapping, references) in &self.map_references {
            if let Some(missing) = references.iter().find(|id| !step_ids.contains(*id)) {
                return Err(WorkflowError::InvalidStepReference {
                    workflow: self.id.clone(),
                    mapping: mapping.clone(),
                    step: missing.clone(),
                });
            }
        }

        self.serialized_step_flow = self.step_flow.iter().map(GraphEntry::serialize).collect();
        self.execution_graph = Some(Arc::new(self.step_flow.clone()));
        tracing::debug!(
            workflow_id = %self.id,
            entries = self.step_flow.len(),
            "workflow committed"
        );
        Ok(self)
    }

    // -- runs ---------------------------------------------------------------

    fn engine(&self) -> ExecutionEngine {
        ExecutionEngine::new(self.store.clone(), self.config.persistence)
    }

    /// Create (or fetch the live) run for a run id.
    ///
    /// A `pending` snapshot is written unless one already exists for the id.
    pub async fn create_run(&self, options: CreateRunOptions) -> Result<Arc<Run>, WorkflowError> {
        let graph = self
            .execution_graph
            .clone()
            .ok_or_else(|| WorkflowError::Uncommitted(self.id.clone()))?;
        if graph.is_empty() {
            return Err(WorkflowError::EmptyGraph(self.id.clone()));
        }

        let run_id = options.run_id.unwrap_or_else(|| Uuid::now_v7().to_string());
        if let Some(run) = self.get_run(&run_id) {
            return Ok(run);
        }

        let engine = self.engine();
        let placeholder = WorkflowRunSnapshot::pending(&run_id, self.serialized_step_flow.clone());
        engine
            .checkpoint()
            .register_pending(&self.id, options.resource_id.as_deref(), &placeholder)
            .await?;

        let registry = Arc::downgrade(&self.runs);
        let cleanup = Box::new(move |run_id: &str| {
            if let Some(runs) = registry.upgrade() {
                runs.remove(run_id);
            }
        });
        let run = Arc::new(Run::new(
            self.id.clone(),
            run_id.clone(),
            options.resource_id,
            graph,
            engine,
            &self.config,
            cleanup,
        ));

        tracing::debug!(workflow_id = %self.id, run_id = %run_id, "run created");
        let run = self.runs.entry(run_id).or_insert(run).value().clone();
        Ok(run)
    }

    /// The live run for `run_id`, if it is still registered.
    pub fn get_run(&self, run_id: &str) -> Option<Arc<Run>> {
        self.runs.get(run_id).map(|run| Arc::clone(run.value()))
    }

    /// Cancel a live run by id.
    pub fn cancel_run(&self, run_id: &str) -> Result<(), WorkflowError> {
        let run = self
            .get_run(run_id)
            .ok_or_else(|| WorkflowError::RunNotFound(run_id.to_string()))?;
        run.cancel();
        Ok(())
    }

    /// Number of live (running or suspended) runs.
    pub fn active_runs(&self) -> usize {
        self.runs.len()
    }

    /// Stored runs of this workflow, newest first.
    pub async fn get_workflow_runs(
        &self,
        query: WorkflowRunsQuery,
    ) -> Result<WorkflowRuns, WorkflowError> {
        let query = WorkflowRunsQuery {
            workflow_name: Some(self.id.clone()),
            ..query
        };
        self.store
            .get_workflow_runs(&query)
            .await
            .map_err(|e| WorkflowError::Persistence(e.to_string()))
    }

    /// Look a run up in storage, falling back to the live registry when the
    /// store misses or fails.
    pub async fn get_workflow_run_by_id(
        &self,
        run_id: &str,
    ) -> Result<Option<WorkflowRunRecord>, WorkflowError> {
        let stored = self.store.get_workflow_run_by_id(run_id, Some(&self.id)).await;
        let store_error = match stored {
            Ok(Some(record)) => return Ok(Some(record)),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(
                    workflow_id = %self.id,
                    run_id,
                    error = %e,
                    "run lookup failed, falling back to live runs"
                );
                Some(e)
            }
        };

        match (self.get_run(run_id), store_error) {
            (Some(run), _) => Ok(Some(WorkflowRunRecord {
                workflow_name: self.id.clone(),
                run_id: run.run_id().to_string(),
                snapshot: WorkflowRunSnapshot::pending(run.run_id(), run.serialized_step_graph().to_vec()),
                resource_id: run.resource_id().map(str::to_string),
                created_at: run.created_at(),
                updated_at: run.created_at(),
            })),
            (None, Some(e)) => Err(WorkflowError::Persistence(e.to_string())),
            (None, None) => Ok(None),
        }
    }

    /// Summary of a stored run's outcome.
    pub async fn get_workflow_run_execution_result(
        &self,
        run_id: &str,
    ) -> Result<Option<WorkflowRunExecutionResult>, WorkflowError> {
        let snapshot = self.engine().checkpoint().load(&self.id, run_id).await?;
        Ok(snapshot.as_ref().map(WorkflowRunExecutionResult::from))
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.id)
            .field("entries", &self.step_flow.len())
            .field("committed", &self.is_committed())
            .field("active_runs", &self.runs.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
