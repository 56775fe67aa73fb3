//! One invocation of a workflow graph.
//!
//! A [`Run`] owns the cancellation token, the emitter and the cumulative
//! watch state of a run id. It drives the [`ExecutionEngine`] for `start`
//! and `resume`, and exposes the observation channels as streams.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::Stream;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use weft_types::config::{EngineConfig, RetryConfig};
use weft_types::event::{RunEventPayload, WatchEvent, WorkflowEvent};
use weft_types::workflow::{SerializedStepFlowEntry, WorkflowRunStatus};

use super::WorkflowError;
use super::emitter::Emitter;
use super::engine::{ExecuteParams, ExecutionEngine, ResumeParams, WorkflowResult};
use super::graph::GraphEntry;
use super::runtime_context::RuntimeContext;
use super::state::WatchState;

/// Boxed stream type returned by the observation methods.
pub type EventStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

type Cleanup = Box<dyn Fn(&str) + Send + Sync>;

// ---------------------------------------------------------------------------
// ResumeOptions
// ---------------------------------------------------------------------------

/// Arguments of [`Run::resume`].
#[derive(Debug, Clone, Default)]
pub struct ResumeOptions {
    pub resume_data: Value,
    /// Id path of the step to resume, outermost first. May be left empty
    /// when exactly one step is suspended.
    pub step: Vec<String>,
    pub runtime_context: Option<RuntimeContext>,
}

impl ResumeOptions {
    pub fn new(resume_data: Value) -> Self {
        Self {
            resume_data,
            ..Self::default()
        }
    }

    /// Target a step by dotted id path, e.g. `"child.approve"`.
    pub fn step(mut self, path: &str) -> Self {
        self.step = path.split('.').map(str::to_string).collect();
        self
    }

    pub fn steps<I, S>(mut self, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.step = steps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_runtime_context(mut self, runtime_context: RuntimeContext) -> Self {
        self.runtime_context = Some(runtime_context);
        self
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub struct Run {
    workflow_id: String,
    run_id: String,
    resource_id: Option<String>,
    graph: Arc<Vec<GraphEntry>>,
    serialized_step_graph: Vec<SerializedStepFlowEntry>,
    engine: ExecutionEngine,
    retry_config: RetryConfig,
    emitter: Emitter,
    cancel: CancellationToken,
    /// Watch events not yet folded into the state, plus the state itself.
    state: Mutex<(broadcast::Receiver<WatchEvent>, WatchState)>,
    run_counts: Arc<DashMap<String, u32>>,
    streaming: AtomicBool,
    created_at: DateTime<Utc>,
    cleanup: Cleanup,
}

impl Run {
    pub(crate) fn new(
        workflow_id: String,
        run_id: String,
        resource_id: Option<String>,
        graph: Arc<Vec<GraphEntry>>,
        engine: ExecutionEngine,
        config: &EngineConfig,
        cleanup: Cleanup,
    ) -> Self {
        let emitter = Emitter::new(config.event_capacity);
        let watch = emitter.subscribe_watch();
        let serialized_step_graph = graph.iter().map(GraphEntry::serialize).collect();
        Self {
            workflow_id,
            run_id,
            resource_id,
            graph,
            serialized_step_graph,
            engine,
            retry_config: config.retry,
            emitter,
            cancel: CancellationToken::new(),
            state: Mutex::new((watch, WatchState::new())),
            run_counts: Arc::new(DashMap::new()),
            streaming: AtomicBool::new(false),
            created_at: Utc::now(),
            cleanup,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn resource_id(&self) -> Option<&str> {
        self.resource_id.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn serialized_step_graph(&self) -> &[SerializedStepFlowEntry] {
        &self.serialized_step_graph
    }

    pub(crate) fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    fn params(&self, input: Value, runtime_context: Option<RuntimeContext>) -> ExecuteParams {
        ExecuteParams {
            workflow_id: self.workflow_id.clone(),
            run_id: self.run_id.clone(),
            resource_id: self.resource_id.clone(),
            graph: Arc::clone(&self.graph),
            serialized_step_graph: self.serialized_step_graph.clone(),
            input,
            resume: None,
            retry_config: self.retry_config,
            emitter: self.emitter.clone(),
            cancel: self.cancel.clone(),
            runtime_context: runtime_context.unwrap_or_default(),
            run_counts: Arc::clone(&self.run_counts),
        }
    }

    /// Execute the graph from the beginning.
    pub async fn start(
        &self,
        input: Value,
        runtime_context: Option<RuntimeContext>,
    ) -> Result<WorkflowResult, WorkflowError> {
        tracing::debug!(
            workflow_id = %self.workflow_id,
            run_id = %self.run_id,
            "starting run"
        );
        let result = self.engine.execute(self.params(input, runtime_context)).await;
        self.settle(&result);
        result
    }

    /// Continue a suspended run from the step named in `options`.
    pub async fn resume(&self, options: ResumeOptions) -> Result<WorkflowResult, WorkflowError> {
        let snapshot = self
            .engine
            .checkpoint()
            .load(&self.workflow_id, &self.run_id)
            .await?
            .ok_or_else(|| WorkflowError::SnapshotNotFound(self.run_id.clone()))?;

        if snapshot.status != WorkflowRunStatus::Suspended {
            return Err(WorkflowError::NotSuspended {
                run_id: self.run_id.clone(),
                status: snapshot.status,
            });
        }

        let available: Vec<String> = snapshot.suspended_paths.keys().cloned().collect();
        let steps = if !options.step.is_empty() {
            options.step
        } else if available.len() == 1 {
            available.clone()
        } else {
            return Err(WorkflowError::StepNotSuspended {
                step: String::new(),
                available,
            });
        };
        let Some(resume_path) = snapshot.suspended_paths.get(&steps[0]).cloned() else {
            return Err(WorkflowError::StepNotSuspended {
                step: steps.join("."),
                available,
            });
        };

        tracing::debug!(
            workflow_id = %self.workflow_id,
            run_id = %self.run_id,
            step = %steps.join("."),
            "resuming run"
        );

        let mut params = self.params(snapshot.context.input.clone(), options.runtime_context);
        params.resume = Some(ResumeParams {
            steps,
            step_results: snapshot.context,
            resume_payload: options.resume_data,
            resume_path,
            suspended_paths: snapshot.suspended_paths,
        });
        let result = self.engine.execute(params).await;
        self.settle(&result);
        result
    }

    /// Close out an execution: finish the event stream and leave the
    /// registry unless the run is suspended.
    fn settle(&self, result: &Result<WorkflowResult, WorkflowError>) {
        if matches!(result, Ok(r) if r.status() == WorkflowRunStatus::Suspended) {
            return;
        }
        if self.streaming.swap(false, Ordering::SeqCst) {
            self.emitter.emit_event(WorkflowEvent::Finish {
                payload: RunEventPayload {
                    run_id: self.run_id.clone(),
                },
            });
        }
        (self.cleanup)(&self.run_id);
    }

    /// Start the run in the background and stream its watch-v2 events.
    ///
    /// The stream opens with `start` and ends after `finish`. A run that
    /// suspends keeps the stream open until a later resume settles it.
    pub fn stream(
        self: &Arc<Self>,
        input: Value,
        runtime_context: Option<RuntimeContext>,
    ) -> WorkflowStream {
        let mut rx = self.emitter.subscribe_events();
        self.streaming.store(true, Ordering::SeqCst);
        self.emitter.emit_event(WorkflowEvent::Start {
            payload: RunEventPayload {
                run_id: self.run_id.clone(),
            },
        });

        let run = Arc::clone(self);
        let handle = tokio::spawn(async move { run.start(input, runtime_context).await });

        let events = Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let finished = matches!(event, WorkflowEvent::Finish { .. });
                        yield event;
                        if finished {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "stream subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        WorkflowStream { events, handle }
    }

    /// Cumulative state updates: each item is the deep-merge of every watch
    /// payload seen so far by this subscriber.
    pub fn watch(&self) -> EventStream<WatchEvent> {
        let mut rx = self.emitter.subscribe_watch();
        Box::pin(async_stream::stream! {
            let mut state = WatchState::new();
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        state.apply(&event.payload);
                        yield WatchEvent {
                            payload: state.to_value(),
                            event_timestamp: event.event_timestamp,
                        };
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Raw discrete lifecycle events.
    pub fn watch_v2(&self) -> EventStream<WorkflowEvent> {
        let mut rx = self.emitter.subscribe_events();
        Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// The cumulative watch state observed so far.
    pub fn get_state(&self) -> Value {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (rx, state) = &mut *guard;
        loop {
            match rx.try_recv() {
                Ok(event) => state.apply(&event.payload),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        state.to_value()
    }

    /// Cancel the run. In-flight entries observe the token and settle as
    /// `canceled`.
    pub fn cancel(&self) {
        tracing::info!(run_id = %self.run_id, "cancelling run");
        self.cancel.cancel();
    }

    /// Deliver a named event to a waiting `wait_for_event` entry.
    pub fn send_event(&self, event: &str, data: Value) {
        self.emitter.send_user_event(event, data);
    }
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("workflow_id", &self.workflow_id)
            .field("run_id", &self.run_id)
            .field("resource_id", &self.resource_id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// WorkflowStream
// ---------------------------------------------------------------------------

/// Event stream of a run started with [`Run::stream`].
pub struct WorkflowStream {
    events: EventStream<WorkflowEvent>,
    handle: JoinHandle<Result<WorkflowResult, WorkflowError>>,
}

impl WorkflowStream {
    /// Wait for the underlying execution and return its result.
    pub async fn result(self) -> Result<WorkflowResult, WorkflowError> {
        self.handle
            .await
            .map_err(|e| WorkflowError::Execution(e.to_string()))?
    }
}

impl Stream for WorkflowStream {
    type Item = WorkflowEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.as_mut().poll_next(cx)
    }
}
