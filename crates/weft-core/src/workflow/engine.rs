//! Execution engine: interprets a committed execution graph.
//!
//! The top level walks graph entries strictly in order. Composite entries
//! (parallel, conditional, foreach) recurse into their children and run them
//! concurrently with `join_all`. Every step invocation updates the shared
//! [`StepResultStore`], emits watch and watch-v2 events, and is checkpointed
//! through the [`CheckpointManager`] as soon as it settles, as is every
//! top-level entry completion.
//!
//! # Resume
//!
//! A resume carries the id path of the suspended step (outer to inner) and the
//! execution path recorded when it suspended. Execution restarts at the
//! top-level index `resume_path[0]`; parallel and conditional entries on the
//! way down jump straight to the recorded child so siblings are not re-run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::future::{BoxFuture, FutureExt, join_all};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use weft_types::config::{DEFAULT_EVENT_CAPACITY, PersistencePolicy, RetryConfig};
use weft_types::event::{
    CurrentStep, StepEventPayload, StepFinishPayload, WatchEvent, WatchPayload, WorkflowEvent,
    WorkflowStateView,
};
use weft_types::workflow::{
    LoopType, SerializedStepFlowEntry, StepResult, StepResults, StepStatus, WorkflowRunSnapshot,
    WorkflowRunStatus,
};

use crate::repository::box_store::BoxWorkflowStore;

use super::WorkflowError;
use super::checkpoint::CheckpointManager;
use super::context::{ConditionContext, ResumeInfo, StepContext, StepResultStore};
use super::emitter::Emitter;
use super::graph::GraphEntry;
use super::retry::RetryHandler;
use super::runtime_context::RuntimeContext;
use super::step::{StepError, StepOutcome, StepRef};

/// Key under which a nested workflow records its run id and suspended path
/// inside the parent step's suspend payload.
pub const WORKFLOW_META_KEY: &str = "__workflow_meta";

// ---------------------------------------------------------------------------
// Parameters & result
// ---------------------------------------------------------------------------

/// Resume request handed to the engine by `Run::resume`.
#[derive(Debug, Clone)]
pub struct ResumeParams {
    /// Step ids of the suspended step, outermost first.
    pub steps: Vec<String>,
    /// Step results restored from the last snapshot.
    pub step_results: StepResults,
    pub resume_payload: Value,
    /// Execution path recorded when `steps[0]` suspended.
    pub resume_path: Vec<usize>,
    /// Every suspended path in the snapshot, including the one being resumed.
    pub suspended_paths: BTreeMap<String, Vec<usize>>,
}

/// Everything one engine invocation needs.
#[derive(Debug, Clone)]
pub struct ExecuteParams {
    pub workflow_id: String,
    pub run_id: String,
    pub resource_id: Option<String>,
    pub graph: Arc<Vec<GraphEntry>>,
    pub serialized_step_graph: Vec<SerializedStepFlowEntry>,
    pub input: Value,
    pub resume: Option<ResumeParams>,
    pub retry_config: RetryConfig,
    pub emitter: Emitter,
    pub cancel: CancellationToken,
    pub runtime_context: RuntimeContext,
    /// Invocation counter per step id, shared by every execution of one run.
    pub run_counts: Arc<DashMap<String, u32>>,
}

impl ExecuteParams {
    /// Parameters for a fresh execution with default retry settings, a new
    /// emitter and a new cancellation token.
    pub fn new(
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
        graph: Arc<Vec<GraphEntry>>,
        input: Value,
    ) -> Self {
        let serialized_step_graph = graph.iter().map(GraphEntry::serialize).collect();
        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
            resource_id: None,
            graph,
            serialized_step_graph,
            input,
            resume: None,
            retry_config: RetryConfig::default(),
            emitter: Emitter::new(DEFAULT_EVENT_CAPACITY),
            cancel: CancellationToken::new(),
            runtime_context: RuntimeContext::new(),
            run_counts: Arc::new(DashMap::new()),
        }
    }
}

/// Terminal outcome of one execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkflowResult {
    Success {
        steps: StepResults,
        result: Value,
    },
    Failed {
        steps: StepResults,
        error: String,
    },
    /// `suspended` lists the id path (outer to inner) of every suspended step.
    Suspended {
        steps: StepResults,
        suspended: Vec<Vec<String>>,
    },
    Canceled {
        steps: StepResults,
    },
}

impl WorkflowResult {
    pub fn status(&self) -> WorkflowRunStatus {
        match self {
            WorkflowResult::Success { .. } => WorkflowRunStatus::Success,
            WorkflowResult::Failed { .. } => WorkflowRunStatus::Failed,
            WorkflowResult::Suspended { .. } => WorkflowRunStatus::Suspended,
            WorkflowResult::Canceled { .. } => WorkflowRunStatus::Canceled,
        }
    }

    pub fn steps(&self) -> &StepResults {
        match self {
            WorkflowResult::Success { steps, .. }
            | WorkflowResult::Failed { steps, .. }
            | WorkflowResult::Suspended { steps, .. }
            | WorkflowResult::Canceled { steps } => steps,
        }
    }

    pub fn result(&self) -> Option<&Value> {
        match self {
            WorkflowResult::Success { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            WorkflowResult::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn suspended(&self) -> &[Vec<String>] {
        match self {
            WorkflowResult::Suspended { suspended, .. } => suspended,
            _ => &[],
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutionEngine
// ---------------------------------------------------------------------------

/// Graph interpreter. Stateless apart from its checkpoint store, so one
/// engine serves every run of a workflow.
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    checkpoint: CheckpointManager,
}

impl ExecutionEngine {
    pub fn new(store: BoxWorkflowStore, policy: PersistencePolicy) -> Self {
        Self {
            checkpoint: CheckpointManager::new(store, policy),
        }
    }

    pub fn checkpoint(&self) -> &CheckpointManager {
        &self.checkpoint
    }

    /// Run (or resume) a graph to a terminal or suspended state.
    ///
    /// Step failures are reported through [`WorkflowResult::Failed`]; only
    /// user errors and fail-closed persistence errors return `Err`.
    pub async fn execute(&self, params: ExecuteParams) -> Result<WorkflowResult, WorkflowError> {
        let span = tracing::info_span!(
            "workflow.execute",
            workflow_id = %params.workflow_id,
            run_id = %params.run_id,
            resumed = params.resume.is_some(),
        );
        self.execute_graph(params).instrument(span).await
    }

    async fn execute_graph(&self, params: ExecuteParams) -> Result<WorkflowResult, WorkflowError> {
        if params.graph.is_empty() {
            return Err(WorkflowError::EmptyGraph(params.workflow_id));
        }

        let (results, start_idx) = match &params.resume {
            Some(resume) => {
                let start = resume.resume_path.first().copied().filter(|idx| *idx < params.graph.len());
                let Some(start) = start else {
                    return Err(WorkflowError::InvalidResumePath {
                        path: format!("{:?}", resume.resume_path),
                    });
                };
                (StepResultStore::from_results(resume.step_results.clone()), start)
            }
            None => (StepResultStore::new(params.input.clone()), 0),
        };

        let suspended_paths = DashMap::new();
        if let Some(resume) = &params.resume {
            let resumed = resume.steps.first();
            for (step_id, path) in &resume.suspended_paths {
                if Some(step_id) != resumed {
                    suspended_paths.insert(step_id.clone(), path.clone());
                }
            }
        }

        let scope = Scope {
            params,
            results,
            suspended_paths,
            checkpoint: self.checkpoint.clone(),
        };

        tracing::info!(start_entry = start_idx, "workflow run started");

        let mut prev_output = match start_idx {
            0 => scope.results.input().clone(),
            idx => scope.params.graph[idx - 1].output(&scope.results),
        };
        let cursor = scope.params.resume.as_ref().map(|resume| ResumeCursor {
            steps: &resume.steps,
            payload: &resume.resume_payload,
            path: resume.resume_path.get(1..).unwrap_or(&[]),
        });

        let mut last: Option<StepResult> = None;
        for (idx, entry) in scope.params.graph.iter().enumerate().skip(start_idx) {
            if scope.params.cancel.is_cancelled() {
                last = Some(StepResult::with_status(StepStatus::Canceled));
                break;
            }

            tracing::debug!(entry = idx, id = entry.entry_id(), "executing entry");
            let resume = if idx == start_idx { cursor } else { None };
            let mut result = execute_entry(&scope, entry, vec![idx], prev_output.clone(), resume).await?;

            if result.status == StepStatus::Success && scope.params.cancel.is_cancelled() {
                result.status = StepStatus::Canceled;
            }

            if result.status != StepStatus::Success {
                last = Some(result);
                break;
            }

            prev_output = result.output.clone().unwrap_or(Value::Null);
            scope.persist(WorkflowRunStatus::Running, vec![idx], None, None).await?;
            last = Some(result);
        }

        let last = last.unwrap_or_else(|| StepResult::success(prev_output));
        scope.finish(last).await
    }
}

// ---------------------------------------------------------------------------
// Execution scope
// ---------------------------------------------------------------------------

/// State shared by every entry of one execution.
struct Scope {
    params: ExecuteParams,
    results: StepResultStore,
    /// Execution path of every currently suspended step.
    suspended_paths: DashMap<String, Vec<usize>>,
    checkpoint: CheckpointManager,
}

/// Borrowed view of the part of a resume request still to be consumed.
#[derive(Debug, Clone, Copy)]
struct ResumeCursor<'a> {
    steps: &'a [String],
    payload: &'a Value,
    path: &'a [usize],
}

impl<'a> ResumeCursor<'a> {
    fn targets(&self, step_id: &str) -> bool {
        self.steps.first().is_some_and(|id| id == step_id)
    }

    fn descend(self, path: &'a [usize]) -> Self {
        Self { path, ..self }
    }
}

impl Scope {
    fn workflow_id(&self) -> &str {
        &self.params.workflow_id
    }

    fn run_id(&self) -> &str {
        &self.params.run_id
    }

    fn is_cancelled(&self) -> bool {
        self.params.cancel.is_cancelled()
    }

    fn suspended_paths(&self) -> BTreeMap<String, Vec<usize>> {
        self.suspended_paths
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    fn condition_context(&self, input_data: Value, iteration_count: u32) -> ConditionContext {
        ConditionContext {
            workflow_id: self.params.workflow_id.clone(),
            run_id: self.params.run_id.clone(),
            input_data,
            iteration_count,
            results: self.results.clone(),
            runtime_context: self.params.runtime_context.clone(),
        }
    }

    fn emit_watch(
        &self,
        current: Option<(&str, &StepResult)>,
        status: WorkflowRunStatus,
        result: Option<Value>,
        error: Option<String>,
    ) {
        let payload = WatchPayload {
            current_step: current.map(|(id, r)| CurrentStep {
                id: id.to_string(),
                result: r.clone(),
            }),
            workflow_state: WorkflowStateView {
                status,
                steps: self.results.snapshot().steps,
                result,
                error,
            },
        };
        self.params.emitter.emit_watch(WatchEvent::new(&payload));
    }

    /// Emit the watch-v2 events that close a step invocation.
    fn emit_step_settled(&self, step_id: &str, result: &StepResult) {
        let payload = StepEventPayload {
            id: step_id.to_string(),
            result: result.clone(),
        };
        match result.status {
            StepStatus::Suspended => {
                self.params.emitter.emit_event(WorkflowEvent::StepSuspended { payload });
            }
            StepStatus::Waiting => {
                self.params.emitter.emit_event(WorkflowEvent::StepWaiting { payload });
            }
            _ => {
                self.params.emitter.emit_event(WorkflowEvent::StepResult { payload });
                self.params.emitter.emit_event(WorkflowEvent::StepFinish {
                    payload: StepFinishPayload {
                        id: step_id.to_string(),
                        metadata: Value::Object(Map::new()),
                    },
                });
            }
        }
        self.emit_watch(Some((step_id, result)), WorkflowRunStatus::Running, None, None);
    }

    async fn persist(
        &self,
        status: WorkflowRunStatus,
        active_paths: Vec<usize>,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<(), WorkflowError> {
        let snapshot = WorkflowRunSnapshot {
            run_id: self.params.run_id.clone(),
            status,
            context: self.results.snapshot(),
            active_paths,
            serialized_step_graph: self.params.serialized_step_graph.clone(),
            suspended_paths: self.suspended_paths(),
            result,
            error,
            timestamp: Utc::now(),
        };
        self.checkpoint
            .persist_step_update(
                self.workflow_id(),
                self.params.resource_id.as_deref(),
                &snapshot,
            )
            .await?;
        Ok(())
    }

    /// Format the terminal result, emit the final watch event and persist it.
    async fn finish(&self, last: StepResult) -> Result<WorkflowResult, WorkflowError> {
        let steps = self.results.snapshot();
        let result = match last.status {
            StepStatus::Success | StepStatus::Bailed => WorkflowResult::Success {
                steps,
                result: last.output.unwrap_or(Value::Null),
            },
            StepStatus::Failed => WorkflowResult::Failed {
                steps,
                error: last.error.unwrap_or_else(|| "step failed".to_string()),
            },
            StepStatus::Suspended => WorkflowResult::Suspended {
                steps,
                suspended: self.suspended_id_paths(),
            },
            StepStatus::Canceled | StepStatus::Running | StepStatus::Waiting => {
                WorkflowResult::Canceled { steps }
            }
        };

        let status = result.status();
        let output = result.result().cloned();
        let error = result.error().map(str::to_string);
        self.emit_watch(None, status, output.clone(), error.clone());
        self.persist(status, Vec::new(), output, error).await?;

        tracing::info!(status = ?status, "workflow run finished");
        Ok(result)
    }

    /// `[stepId, ...nestedPath]` for every suspended step.
    fn suspended_id_paths(&self) -> Vec<Vec<String>> {
        let mut ids: Vec<String> = self.suspended_paths.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids.into_iter()
            .map(|step_id| {
                let nested = self
                    .results
                    .get(&step_id)
                    .and_then(|r| r.suspend_payload)
                    .and_then(|p| p.get(WORKFLOW_META_KEY)?.get("path").cloned())
                    .and_then(|p| serde_json::from_value::<Vec<String>>(p).ok())
                    .unwrap_or_default();
                std::iter::once(step_id).chain(nested).collect()
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

fn execute_entry<'a>(
    scope: &'a Scope,
    entry: &'a GraphEntry,
    path: Vec<usize>,
    prev_output: Value,
    resume: Option<ResumeCursor<'a>>,
) -> BoxFuture<'a, Result<StepResult, WorkflowError>> {
    async move {
        match entry {
            GraphEntry::Step { step } => execute_step(scope, step, path, prev_output, resume).await,
            GraphEntry::Parallel { steps } => {
                if let Some(result) = resume_child(scope, entry, steps, &path, &prev_output, resume).await? {
                    return Ok(result);
                }
                let runs = steps.iter().enumerate().map(|(i, child)| {
                    execute_entry(scope, child, child_path(&path, i), prev_output.clone(), resume)
                });
                let outcomes = join_all(runs).await;
                let children = steps.iter().zip(collect(outcomes)?).collect();
                Ok(aggregate(children, scope.is_cancelled()))
            }
            GraphEntry::Conditional { steps, conditions } => {
                if let Some(result) = resume_child(scope, entry, steps, &path, &prev_output, resume).await? {
                    return Ok(result);
                }
                let evaluations = join_all(conditions.iter().map(|condition| {
                    condition.evaluate(scope.condition_context(prev_output.clone(), 0))
                }))
                .await;

                let chosen: Vec<(usize, &GraphEntry)> = evaluations
                    .into_iter()
                    .zip(steps.iter())
                    .enumerate()
                    .filter_map(|(i, (holds, child))| match holds {
                        Ok(true) => Some((i, child)),
                        Ok(false) => None,
                        Err(e) => {
                            tracing::warn!(
                                branch = i,
                                step_id = child.entry_id(),
                                error = %e,
                                "branch condition failed, treating as false"
                            );
                            None
                        }
                    })
                    .collect();

                tracing::debug!(branches = chosen.len(), "conditional branches selected");
                let runs = chosen.iter().map(|&(i, child)| {
                    execute_entry(scope, child, child_path(&path, i), prev_output.clone(), resume)
                });
                let outcomes = join_all(runs).await;
                let children = chosen.iter().map(|(_, child)| *child).zip(collect(outcomes)?).collect();
                Ok(aggregate(children, scope.is_cancelled()))
            }
            GraphEntry::Loop {
                step,
                condition,
                loop_type,
            } => {
                // A resumed loop continues from the iteration that suspended.
                let resume = resume.filter(|cursor| cursor.targets(step.id()));
                let mut input = resume
                    .and_then(|_| scope.results.get(step.id()))
                    .and_then(|suspended| suspended.payload)
                    .unwrap_or(prev_output);
                let mut resume = resume;
                let mut iteration = 0u32;
                loop {
                    let result = execute_step(scope, step, path.clone(), input, resume.take()).await?;
                    if result.status != StepStatus::Success {
                        return Ok(result);
                    }
                    iteration += 1;
                    let output = result.output.clone().unwrap_or(Value::Null);
                    let holds = match condition
                        .evaluate(scope.condition_context(output.clone(), iteration))
                        .await
                    {
                        Ok(holds) => holds,
                        Err(e) => {
                            tracing::warn!(step_id = step.id(), error = %e, "loop condition failed");
                            return Ok(StepResult::failed(e.to_string()));
                        }
                    };
                    let again = match loop_type {
                        LoopType::DoWhile => holds,
                        LoopType::DoUntil => !holds,
                    };
                    if !again {
                        return Ok(result);
                    }
                    if scope.is_cancelled() {
                        return Ok(StepResult::with_status(StepStatus::Canceled));
                    }
                    input = output;
                }
            }
            GraphEntry::Foreach { step, opts } => {
                let Value::Array(items) = prev_output else {
                    let error = format!("foreach step {} expects an array input", step.id());
                    let result = StepResult::failed(error);
                    scope.results.merge(step.id(), result.clone());
                    return Ok(result);
                };

                let started_at = Utc::now();
                let mut outputs = Vec::with_capacity(items.len());
                for chunk in items.chunks(opts.concurrency.max(1)) {
                    let runs = chunk
                        .iter()
                        .map(|item| execute_step(scope, step, path.clone(), item.clone(), resume));
                    for result in collect(join_all(runs).await)? {
                        if result.status != StepStatus::Success {
                            return Ok(result);
                        }
                        outputs.push(result.output.unwrap_or(Value::Null));
                    }
                    if scope.is_cancelled() {
                        return Ok(StepResult::with_status(StepStatus::Canceled));
                    }
                }

                let result = StepResult {
                    payload: Some(Value::Array(items)),
                    started_at: Some(started_at),
                    ..StepResult::success(Value::Array(outputs))
                };
                scope.results.merge(step.id(), result.clone());
                scope.emit_watch(Some((step.id(), &result)), WorkflowRunStatus::Running, None, None);
                scope.persist(WorkflowRunStatus::Running, path, None, None).await?;
                Ok(result)
            }
            GraphEntry::Sleep { id, duration } => {
                sleep_entry(scope, id, path, prev_output, *duration).await
            }
            GraphEntry::SleepUntil { id, date } => {
                let duration = (*date - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                sleep_entry(scope, id, path, prev_output, duration).await
            }
            GraphEntry::WaitForEvent {
                event,
                step,
                timeout,
            } => wait_for_event(scope, event, step, *timeout, path, prev_output).await,
        }
    }
    .boxed()
}

fn child_path(path: &[usize], idx: usize) -> Vec<usize> {
    let mut child = path.to_vec();
    child.push(idx);
    child
}

fn collect(
    outcomes: Vec<Result<StepResult, WorkflowError>>,
) -> Result<Vec<StepResult>, WorkflowError> {
    outcomes.into_iter().collect()
}

/// Combine concurrently executed children: the first failure wins, then the
/// first suspension, then cancellation; otherwise success with a map of
/// child id to output.
fn aggregate(children: Vec<(&GraphEntry, StepResult)>, cancelled: bool) -> StepResult {
    if let Some((_, failed)) = children.iter().find(|(_, r)| r.status == StepStatus::Failed) {
        return failed.clone();
    }
    if let Some((_, suspended)) = children.iter().find(|(_, r)| r.status == StepStatus::Suspended) {
        return suspended.clone();
    }
    if cancelled || children.iter().any(|(_, r)| r.status == StepStatus::Canceled) {
        return StepResult::with_status(StepStatus::Canceled);
    }

    let mut outputs = Map::new();
    for (child, result) in children {
        match child.entry_id() {
            Some(id) => {
                outputs.insert(id.to_string(), result.output.unwrap_or(Value::Null));
            }
            None => {
                if let Some(Value::Object(nested)) = result.output {
                    outputs.extend(nested);
                }
            }
        }
    }
    StepResult::success(Value::Object(outputs))
}

/// On a resume path through a parallel or conditional entry, run only the
/// child the suspended step lives in.
///
/// Returns `None` when the entry is not on the resume path.
async fn resume_child<'a>(
    scope: &'a Scope,
    entry: &'a GraphEntry,
    children: &'a [GraphEntry],
    path: &[usize],
    prev_output: &Value,
    resume: Option<ResumeCursor<'a>>,
) -> Result<Option<StepResult>, WorkflowError> {
    let Some(cursor) = resume else {
        return Ok(None);
    };
    let Some((&idx, rest)) = cursor.path.split_first() else {
        return Ok(None);
    };
    let Some(child) = children.get(idx) else {
        return Err(WorkflowError::InvalidResumePath {
            path: format!("{path:?} -> {idx}"),
        });
    };

    let result = execute_entry(
        scope,
        child,
        child_path(path, idx),
        prev_output.clone(),
        Some(cursor.descend(rest)),
    )
    .await?;
    if result.status != StepStatus::Success {
        return Ok(Some(result));
    }

    // Siblings that suspended in an earlier execution keep the entry suspended.
    let still_suspended = children
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != idx)
        .flat_map(|(_, sibling)| sibling.step_ids())
        .find(|id| scope.suspended_paths.contains_key(id));
    if let Some(step_id) = still_suspended {
        let sibling = scope
            .results
            .get(&step_id)
            .unwrap_or_else(|| StepResult::with_status(StepStatus::Suspended));
        return Ok(Some(StepResult {
            status: StepStatus::Suspended,
            ..sibling
        }));
    }

    Ok(Some(StepResult::success(entry.output(&scope.results))))
}

async fn sleep_entry(
    scope: &Scope,
    id: &str,
    path: Vec<usize>,
    prev_output: Value,
    duration: Duration,
) -> Result<StepResult, WorkflowError> {
    let waiting = StepResult {
        payload: Some(prev_output.clone()),
        started_at: Some(Utc::now()),
        ..StepResult::with_status(StepStatus::Waiting)
    };
    scope.results.insert(id, waiting.clone());
    scope.emit_step_settled(id, &waiting);
    scope
        .persist(WorkflowRunStatus::Waiting, path.clone(), None, None)
        .await?;

    tracing::debug!(step_id = id, duration_ms = duration.as_millis() as u64, "sleeping");
    let slept = tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = scope.params.cancel.cancelled() => false,
    };
    if !slept {
        let canceled = StepResult::with_status(StepStatus::Canceled);
        scope.results.merge(id, canceled.clone());
        return Ok(canceled);
    }

    scope.persist(WorkflowRunStatus::Running, path, None, None).await?;
    let done = StepResult {
        payload: Some(prev_output.clone()),
        ..StepResult::success(prev_output)
    };
    scope.results.merge(id, done.clone());
    scope.emit_step_settled(id, &done);
    Ok(done)
}

async fn wait_for_event(
    scope: &Scope,
    event: &str,
    step: &StepRef,
    timeout: Option<Duration>,
    path: Vec<usize>,
    prev_output: Value,
) -> Result<StepResult, WorkflowError> {
    // Subscribe before announcing the wait so an immediate send is not lost.
    let mut events = scope.params.emitter.subscribe_user_events();
    let step_id = step.id();

    let waiting = StepResult {
        payload: Some(prev_output.clone()),
        started_at: Some(Utc::now()),
        ..StepResult::with_status(StepStatus::Waiting)
    };
    scope.results.insert(step_id, waiting.clone());
    scope.emit_step_settled(step_id, &waiting);
    scope
        .persist(WorkflowRunStatus::Waiting, path.clone(), None, None)
        .await?;

    let arrival = async {
        loop {
            match events.recv().await {
                Ok(received) if received.name == event => return Some(received.data),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    };
    let deadline = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending::<()>().await,
        }
    };

    tracing::debug!(step_id, event, "waiting for event");
    let data = tokio::select! {
        data = arrival => data,
        _ = scope.params.cancel.cancelled() => None,
        _ = deadline => {
            let error = StepError::Timeout("Timeout waiting for event".to_string());
            tracing::warn!(step_id, event, "timed out waiting for event");
            let failed = StepResult::failed(error.to_string());
            scope.results.merge(step_id, failed.clone());
            scope.emit_step_settled(step_id, &failed);
            return Ok(failed);
        }
    };
    let Some(data) = data else {
        let canceled = StepResult::with_status(StepStatus::Canceled);
        scope.results.merge(step_id, canceled.clone());
        return Ok(canceled);
    };

    scope
        .persist(WorkflowRunStatus::Running, path.clone(), None, None)
        .await?;
    let steps = [step_id.to_string()];
    let cursor = ResumeCursor {
        steps: &steps,
        payload: &data,
        path: &[],
    };
    execute_step(scope, step, path, prev_output, Some(cursor)).await
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

async fn execute_step(
    scope: &Scope,
    step: &StepRef,
    path: Vec<usize>,
    prev_output: Value,
    resume: Option<ResumeCursor<'_>>,
) -> Result<StepResult, WorkflowError> {
    let step_id = step.id().to_string();
    let resume = resume.filter(|cursor| cursor.targets(&step_id));
    let previous = scope.results.get(&step_id);

    let base = previous
        .clone()
        .unwrap_or_else(|| StepResult::with_status(StepStatus::Running));
    let info = match &resume {
        Some(cursor) => StepResult {
            status: StepStatus::Running,
            resume_payload: Some(cursor.payload.clone()),
            resumed_at: Some(Utc::now()),
            ..base
        },
        None => StepResult {
            status: StepStatus::Running,
            payload: Some(prev_output.clone()),
            started_at: Some(Utc::now()),
            ..base
        },
    };
    scope.results.insert(&step_id, info.clone());
    scope.params.emitter.emit_event(WorkflowEvent::StepStart {
        payload: StepEventPayload {
            id: step_id.clone(),
            result: info.clone(),
        },
    });
    scope.emit_watch(Some((&step_id, &info)), WorkflowRunStatus::Running, None, None);

    let run_count = {
        let mut count = scope.params.run_counts.entry(step_id.clone()).or_insert(0);
        let current = *count;
        *count += 1;
        current
    };

    let resume_info = resume.map(|cursor| ResumeInfo {
        steps: cursor.steps.get(1..).unwrap_or(&[]).to_vec(),
        resume_payload: cursor.payload.clone(),
        run_id: previous
            .as_ref()
            .and_then(|r| r.suspend_payload.as_ref())
            .and_then(|p| p.get(WORKFLOW_META_KEY)?.get("runId")?.as_str())
            .map(str::to_string),
    });

    let max_attempts = RetryHandler::max_attempts(step.retries(), &scope.params.retry_config);
    let mut attempt = 0u32;
    let outcome = loop {
        attempt += 1;
        let ctx = StepContext {
            workflow_id: scope.params.workflow_id.clone(),
            run_id: scope.params.run_id.clone(),
            step_id: step_id.clone(),
            input_data: prev_output.clone(),
            resume: resume_info.clone(),
            run_count,
            execution_path: path.clone(),
            results: scope.results.clone(),
            runtime_context: scope.params.runtime_context.clone(),
            emitter: scope.params.emitter.clone(),
            cancel: scope.params.cancel.clone(),
        };

        match step.execute_boxed(ctx).await {
            Ok(outcome) => break Ok(outcome),
            Err(e) if RetryHandler::should_retry(max_attempts, attempt) => {
                tracing::warn!(
                    step_id = step_id.as_str(),
                    attempt,
                    max_attempts,
                    error = %e,
                    "step attempt failed, retrying"
                );
                if !RetryHandler::wait_before_retry(&scope.params.retry_config, &scope.params.cancel).await {
                    break Err(e);
                }
            }
            Err(e) => {
                tracing::error!(
                    step_id = step_id.as_str(),
                    attempt,
                    error = %e,
                    "step failed"
                );
                break Err(e);
            }
        }
    };

    let settled = match outcome {
        Ok(StepOutcome::Success(output)) => StepResult::success(output),
        Ok(StepOutcome::Bailed(output)) => StepResult {
            status: StepStatus::Bailed,
            ..StepResult::success(output)
        },
        Ok(StepOutcome::Suspended(payload)) => StepResult::suspended(payload),
        Err(_) if scope.is_cancelled() => StepResult {
            ended_at: Some(Utc::now()),
            ..StepResult::with_status(StepStatus::Canceled)
        },
        Err(e) => StepResult::failed(e.to_string()),
    };

    if settled.status == StepStatus::Suspended {
        tracing::debug!(step_id = step_id.as_str(), path = ?path, "step suspended");
        scope.suspended_paths.insert(step_id.clone(), path.clone());
    } else {
        scope.suspended_paths.remove(&step_id);
    }

    scope.results.merge(&step_id, settled);
    let merged = scope
        .results
        .get(&step_id)
        .unwrap_or_else(|| StepResult::with_status(StepStatus::Failed));
    scope.emit_step_settled(&step_id, &merged);
    scope.persist(WorkflowRunStatus::Running, path, None, None).await?;
    Ok(merged)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;
    use weft_types::workflow::ForeachOptions;

    use crate::repository::in_memory::InMemoryWorkflowStore;
    use crate::workflow::graph::Condition;
    use crate::workflow::step::create_step;

    fn engine() -> ExecutionEngine {
        ExecutionEngine::new(
            BoxWorkflowStore::new(InMemoryWorkflowStore::new()),
            PersistencePolicy::FailClosed,
        )
    }

    fn params(graph: Vec<GraphEntry>, input: Value) -> ExecuteParams {
        ExecuteParams::new("wf", "run-1", Arc::new(graph), input)
    }

    fn step_entry(step: StepRef) -> GraphEntry {
        GraphEntry::Step { step }
    }

    fn double() -> StepRef {
        Arc::new(create_step("double", |ctx| async move {
            let n = ctx.input_data().as_i64().unwrap_or_default();
            Ok(StepOutcome::Success(json!(n * 2)))
        }))
    }

    #[tokio::test]
    async fn sequential_steps_read_earlier_results() {
        let step_a: StepRef = Arc::new(create_step("stepA", |_ctx| async {
            Ok(StepOutcome::Success(json!({"x": 1})))
        }));
        let step_b: StepRef = Arc::new(create_step("stepB", |ctx| async move {
            let a = ctx.get_step_result("stepA").unwrap_or_default();
            let x = a["x"].as_i64().unwrap_or_default();
            Ok(StepOutcome::Success(json!({"y": x + 1})))
        }));

        let result = engine()
            .execute(params(vec![step_entry(step_a), step_entry(step_b)], json!({})))
            .await
            .unwrap();

        assert_eq!(result.result(), Some(&json!({"y": 2})));
        assert_eq!(result.steps().steps.len(), 2);
        assert!(result.steps().steps.values().all(StepResult::is_success));
        assert_eq!(result.steps().input, json!({}));
    }

    #[tokio::test]
    async fn empty_graph_is_rejected() {
        let err = engine().execute(params(vec![], Value::Null)).await.unwrap_err();
        assert!(matches!(err, WorkflowError::EmptyGraph(_)));
    }

    #[tokio::test]
    async fn failing_step_is_attempted_retries_plus_one_times() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let flaky: StepRef = Arc::new(
            create_step("flaky", move |_ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(StepError::failed("nope"))
                }
            })
            .with_retries(2),
        );

        let result = engine().execute(params(vec![step_entry(flaky)], Value::Null)).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.error(), Some("nope"));
        assert_eq!(
            result.steps().get("flaky").map(|r| r.status),
            Some(StepStatus::Failed)
        );
    }

    #[tokio::test]
    async fn parallel_reports_first_failure_by_position() {
        let slow_fail: StepRef = Arc::new(create_step("first", |_ctx| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(StepError::failed("first broke"))
        }));
        let fast_fail: StepRef = Arc::new(create_step("second", |_ctx| async {
            Err(StepError::failed("second broke"))
        }));
        let ok: StepRef = Arc::new(create_step("third", |_ctx| async {
            Ok(StepOutcome::Success(json!(3)))
        }));

        let graph = vec![GraphEntry::Parallel {
            steps: vec![step_entry(slow_fail), step_entry(fast_fail), step_entry(ok)],
        }];
        let result = engine().execute(params(graph, Value::Null)).await.unwrap();
        assert_eq!(result.error(), Some("first broke"));
        assert!(result.steps().get("third").unwrap().is_success());
    }

    #[tokio::test]
    async fn parallel_output_maps_child_ids() {
        let a: StepRef = Arc::new(create_step("a", |_ctx| async { Ok(StepOutcome::Success(json!(1))) }));
        let b: StepRef = Arc::new(create_step("b", |_ctx| async { Ok(StepOutcome::Success(json!(2))) }));
        let graph = vec![GraphEntry::Parallel {
            steps: vec![step_entry(a), step_entry(b)],
        }];
        let result = engine().execute(params(graph, Value::Null)).await.unwrap();
        assert_eq!(result.result(), Some(&json!({"a": 1, "b": 2})));
    }

    #[tokio::test]
    async fn conditional_runs_only_matching_branches() {
        let high: StepRef = Arc::new(create_step("high", |_ctx| async { Ok(StepOutcome::Success(json!("high"))) }));
        let low: StepRef = Arc::new(create_step("low", |_ctx| async { Ok(StepOutcome::Success(json!("low"))) }));
        let broken: StepRef = Arc::new(create_step("broken", |_ctx| async { Ok(StepOutcome::Success(json!("?"))) }));

        let graph = vec![GraphEntry::Conditional {
            steps: vec![step_entry(high), step_entry(low), step_entry(broken)],
            conditions: vec![
                Condition::from_fn(|ctx| ctx.input_data()["value"].as_i64() > Some(10)),
                Condition::from_fn(|ctx| ctx.input_data()["value"].as_i64() <= Some(10)),
                Condition::new(|_ctx| async { Err(StepError::failed("bad condition")) }),
            ],
        }];
        let result = engine().execute(params(graph, json!({"value": 42}))).await.unwrap();
        assert_eq!(result.result(), Some(&json!({"high": "high"})));
        assert!(result.steps().get("low").is_none());
        assert!(result.steps().get("broken").is_none());
    }

    #[tokio::test]
    async fn dountil_stops_the_first_time_condition_holds() {
        let increment: StepRef = Arc::new(create_step("increment", |ctx| async move {
            let n = ctx.input_data().as_i64().unwrap_or_default();
            Ok(StepOutcome::Success(json!(n + 1)))
        }));
        let graph = vec![GraphEntry::Loop {
            step: increment,
            condition: Condition::from_fn(|ctx| ctx.input_data().as_i64() >= Some(3)),
            loop_type: LoopType::DoUntil,
        }];
        let result = engine().execute(params(graph, json!(0))).await.unwrap();
        assert_eq!(result.result(), Some(&json!(3)));
    }

    #[tokio::test]
    async fn dowhile_runs_at_least_once() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        let once: StepRef = Arc::new(create_step("once", move |ctx| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(ctx.run_count(), 0);
                Ok(StepOutcome::Success(json!("done")))
            }
        }));
        let graph = vec![GraphEntry::Loop {
            step: once,
            condition: Condition::from_fn(|_| false),
            loop_type: LoopType::DoWhile,
        }];
        let result = engine().execute(params(graph, Value::Null)).await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(result.status(), WorkflowRunStatus::Success);
    }

    #[tokio::test]
    async fn loop_condition_error_fails_the_run() {
        let graph = vec![GraphEntry::Loop {
            step: double(),
            condition: Condition::new(|_ctx| async { Err(StepError::failed("cannot decide")) }),
            loop_type: LoopType::DoWhile,
        }];
        let result = engine().execute(params(graph, json!(1))).await.unwrap();
        assert_eq!(result.error(), Some("cannot decide"));
    }

    #[tokio::test]
    async fn foreach_preserves_input_order() {
        let graph = vec![GraphEntry::Foreach {
            step: double(),
            opts: ForeachOptions { concurrency: 2 },
        }];
        let result = engine().execute(params(graph, json!([1, 2, 3, 4]))).await.unwrap();
        assert_eq!(result.result(), Some(&json!([2, 4, 6, 8])));
    }

    #[tokio::test]
    async fn foreach_requires_array_input() {
        let graph = vec![GraphEntry::Foreach {
            step: double(),
            opts: ForeachOptions::default(),
        }];
        let result = engine().execute(params(graph, json!({"not": "array"}))).await.unwrap();
        assert_eq!(result.status(), WorkflowRunStatus::Failed);
    }

    #[tokio::test]
    async fn bail_short_circuits_with_success() {
        let bail: StepRef = Arc::new(create_step("bail", |ctx| async move { Ok(ctx.bail(json!("early"))) }));
        let graph = vec![step_entry(bail), step_entry(double())];
        let result = engine().execute(params(graph, Value::Null)).await.unwrap();
        assert_eq!(result.result(), Some(&json!("early")));
        assert!(result.steps().get("double").is_none());
    }

    #[tokio::test]
    async fn suspend_records_step_path() {
        let ask: StepRef = Arc::new(create_step("stepA", |ctx| async move {
            Ok(ctx.suspend(json!({"q": "confirm?"})))
        }));
        let result = engine().execute(params(vec![step_entry(ask)], Value::Null)).await.unwrap();
        assert_eq!(result.suspended(), &[vec!["stepA".to_string()]]);
        assert_eq!(
            result.steps().get("stepA").unwrap().suspend_payload,
            Some(json!({"q": "confirm?"}))
        );
    }

    #[tokio::test]
    async fn sleep_passes_previous_output_through() {
        let graph = vec![
            step_entry(double()),
            GraphEntry::Sleep {
                id: "sleep_1".to_string(),
                duration: Duration::from_millis(5),
            },
        ];
        let result = engine().execute(params(graph, json!(4))).await.unwrap();
        assert_eq!(result.result(), Some(&json!(8)));
        assert!(result.steps().get("sleep_1").unwrap().is_success());
    }

    #[tokio::test]
    async fn sleep_until_a_past_date_does_not_wait() {
        let graph = vec![GraphEntry::SleepUntil {
            id: "sleep_until_1".to_string(),
            date: Utc::now() - chrono::Duration::hours(1),
        }];
        let result = tokio::time::timeout(
            Duration::from_millis(200),
            engine().execute(params(graph, json!("kept"))),
        )
        .await
        .expect("past deadline must not block")
        .unwrap();
        assert_eq!(result.result(), Some(&json!("kept")));
        assert!(result.steps().get("sleep_until_1").unwrap().is_success());
    }

    #[tokio::test]
    async fn sleep_until_waits_for_a_future_date() {
        let graph = vec![GraphEntry::SleepUntil {
            id: "sleep_until_1".to_string(),
            date: Utc::now() + chrono::Duration::milliseconds(60),
        }];
        let started = std::time::Instant::now();
        let result = engine().execute(params(graph, json!(1))).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(result.status(), WorkflowRunStatus::Success);
    }

    #[tokio::test]
    async fn wait_for_event_times_out() {
        let graph = vec![GraphEntry::WaitForEvent {
            event: "go".to_string(),
            step: double(),
            timeout: Some(Duration::from_millis(50)),
        }];
        let result = engine().execute(params(graph, json!(1))).await.unwrap();
        assert_eq!(result.status(), WorkflowRunStatus::Failed);
        assert_eq!(result.error(), Some("Timeout waiting for event"));
    }

    #[tokio::test]
    async fn wait_for_event_resumes_step_with_event_data() {
        let approve: StepRef = Arc::new(create_step("approve", |ctx| async move {
            Ok(StepOutcome::Success(ctx.resume_data().cloned().unwrap_or_default()))
        }));
        let p = params(
            vec![GraphEntry::WaitForEvent {
                event: "approved".to_string(),
                step: approve,
                timeout: None,
            }],
            Value::Null,
        );
        let emitter = p.emitter.clone();
        let mut watch = emitter.subscribe_events();
        let handle = tokio::spawn(async move { engine().execute(p).await });

        // Wait until the entry announces it is waiting.
        loop {
            if let WorkflowEvent::StepWaiting { .. } = watch.recv().await.unwrap() {
                break;
            }
        }
        emitter.send_user_event("approved", json!({"by": "ops"}));

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.result(), Some(&json!({"by": "ops"})));
    }

    #[tokio::test]
    async fn cancellation_stops_at_entry_boundary() {
        let abort: StepRef = Arc::new(create_step("abort", |ctx| async move {
            ctx.abort();
            Ok(StepOutcome::Success(json!(1)))
        }));
        let graph = vec![step_entry(abort), step_entry(double())];
        let result = engine().execute(params(graph, Value::Null)).await.unwrap();
        assert_eq!(result.status(), WorkflowRunStatus::Canceled);
        assert!(result.steps().get("double").is_none());
    }

    #[tokio::test]
    async fn snapshot_is_persisted_on_finish() {
        let engine = engine();
        engine.execute(params(vec![step_entry(double())], json!(2))).await.unwrap();
        let snapshot = engine.checkpoint().restore("wf", "run-1").await.unwrap();
        assert_eq!(snapshot.status, WorkflowRunStatus::Success);
        assert_eq!(snapshot.result, Some(json!(4)));
        assert_eq!(snapshot.context.input, json!(2));
    }

    #[tokio::test]
    async fn settled_children_are_checkpointed_before_the_entry_completes() {
        let fast: StepRef = Arc::new(create_step("fast", |_ctx| async {
            Ok(StepOutcome::Success(json!("quick")))
        }));
        let slow: StepRef = Arc::new(create_step("slow", |_ctx| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(StepOutcome::Success(json!("late")))
        }));
        let graph = vec![GraphEntry::Parallel {
            steps: vec![step_entry(fast), step_entry(slow)],
        }];

        let engine = engine();
        let background = engine.clone();
        let handle = tokio::spawn(async move { background.execute(params(graph, Value::Null)).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshot = engine.checkpoint().restore("wf", "run-1").await.unwrap();
        assert_eq!(snapshot.status, WorkflowRunStatus::Running);
        assert_eq!(
            snapshot.context.steps.get("fast").and_then(|r| r.output.clone()),
            Some(json!("quick"))
        );
        assert!(snapshot.context.steps.get("slow").is_none_or(|r| r.status != StepStatus::Success));

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.result(), Some(&json!({"fast": "quick", "slow": "late"})));
    }

    #[tokio::test]
    async fn every_loop_iteration_is_checkpointed() {
        let engine = engine();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let observed = seen.clone();
        let checkpoint = engine.checkpoint().clone();
        let tick: StepRef = Arc::new(create_step("tick", move |ctx| {
            let observed = observed.clone();
            let checkpoint = checkpoint.clone();
            async move {
                let n = ctx.input_data().as_i64().unwrap_or_default();
                // The previous iteration's output is already durable.
                let stored = checkpoint
                    .restore("wf", "run-1")
                    .await
                    .ok()
                    .and_then(|s| s.context.steps.get("tick").and_then(|r| r.output.clone()));
                observed.lock().unwrap().push(stored);
                Ok(StepOutcome::Success(json!(n + 1)))
            }
        }));
        let graph = vec![GraphEntry::Loop {
            step: tick,
            condition: Condition::from_fn(|ctx| ctx.input_data().as_i64() >= Some(3)),
            loop_type: LoopType::DoUntil,
        }];

        let result = engine.execute(params(graph, json!(0))).await.unwrap();
        assert_eq!(result.result(), Some(&json!(3)));
        assert_eq!(*seen.lock().unwrap(), vec![None, Some(json!(1)), Some(json!(2))]);
    }
}
