//! A committed [`Workflow`] used as a step of another workflow.
//!
//! The child run's watch and watch-v2 events are re-published on the parent
//! emitter with ids prefixed `"{workflow_id}."`. A suspended child suspends
//! the parent step; its suspend payload carries the child run id and path
//! under `__workflow_meta` so a later resume can find the child run again.
//!
//! The child run checkpoints into the child workflow's own store, not the
//! parent's. A child left on the default in-memory store cannot be resumed
//! after a restart even when the parent is durable; give both workflows the
//! same store with [`Workflow::with_store`] when that matters.

use serde_json::{Map, Value, json};
use tokio::sync::broadcast;
use weft_types::event::{WatchEvent, WorkflowEvent};
use weft_types::workflow::{SerializedStepFlowEntry, StepSchemas};

use super::builder::{CreateRunOptions, Workflow};
use super::context::StepContext;
use super::emitter::Emitter;
use super::engine::{WORKFLOW_META_KEY, WorkflowResult};
use super::run::ResumeOptions;
use super::step::{Step, StepError, StepOutcome};

impl Step for Workflow {
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn schemas(&self) -> StepSchemas {
        self.schemas.clone()
    }

    fn serialized_step_flow(&self) -> Option<Vec<SerializedStepFlowEntry>> {
        Some(self.serialized_step_flow.clone())
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutcome, StepError> {
        let nested_error = |message: String| StepError::Nested {
            workflow_id: self.id.clone(),
            message,
        };

        let resume = ctx.resume_info().cloned();
        let run = self
            .create_run(CreateRunOptions {
                run_id: resume.as_ref().and_then(|r| r.run_id.clone()),
                resource_id: None,
            })
            .await
            .map_err(|e| nested_error(e.to_string()))?;

        let parent = ctx.emitter().clone();
        let mut watch = run.emitter().subscribe_watch();
        let mut events = run.emitter().subscribe_events();
        let cancel = ctx.abort_signal();
        let runtime_context = ctx.runtime_context().clone();

        let execution = async {
            match resume {
                Some(info) => {
                    tracing::debug!(
                        workflow_id = %self.id,
                        run_id = run.run_id(),
                        "resuming nested workflow"
                    );
                    run.resume(ResumeOptions {
                        resume_data: info.resume_payload,
                        step: info.steps,
                        runtime_context: Some(runtime_context),
                    })
                    .await
                }
                None => run.start(ctx.input_data().clone(), Some(runtime_context)).await,
            }
        };
        tokio::pin!(execution);

        let mut cancel_forwarded = false;
        let result = loop {
            tokio::select! {
                result = &mut execution => break result,
                Ok(event) = watch.recv() => forward_watch(&parent, event, &self.id),
                Ok(event) = events.recv() => forward_event(&parent, event, &self.id),
                _ = cancel.cancelled(), if !cancel_forwarded => {
                    cancel_forwarded = true;
                    run.cancel();
                }
            }
        };

        loop {
            match watch.try_recv() {
                Ok(event) => forward_watch(&parent, event, &self.id),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        loop {
            match events.try_recv() {
                Ok(event) => forward_event(&parent, event, &self.id),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }

        match result.map_err(|e| nested_error(e.to_string()))? {
            WorkflowResult::Success { result, .. } => Ok(StepOutcome::Success(result)),
            WorkflowResult::Failed { error, .. } => Err(nested_error(error)),
            WorkflowResult::Suspended { steps, suspended } => {
                let path = suspended.into_iter().next().unwrap_or_default();
                let payload = path
                    .first()
                    .and_then(|id| steps.get(id))
                    .and_then(|r| r.suspend_payload.clone());
                let mut payload = match payload {
                    Some(Value::Object(map)) => map,
                    Some(other) => Map::from_iter([("value".to_string(), other)]),
                    None => Map::new(),
                };
                payload.insert(
                    WORKFLOW_META_KEY.to_string(),
                    json!({ "runId": run.run_id(), "path": path }),
                );
                Ok(StepOutcome::Suspended(Value::Object(payload)))
            }
            WorkflowResult::Canceled { .. } => Ok(StepOutcome::Success(Value::Null)),
        }
    }
}

/// Re-publish a child watch event under the parent's ids. The child's own
/// run status is not forwarded; the parent is still running.
fn forward_watch(parent: &Emitter, event: WatchEvent, prefix: &str) {
    let mut payload = Map::new();
    if let Some(Value::Object(mut current)) = event.payload.get("currentStep").cloned() {
        if let Some(id) = current.get("id").and_then(Value::as_str) {
            let prefixed = format!("{prefix}.{id}");
            current.insert("id".to_string(), Value::String(prefixed));
        }
        payload.insert("currentStep".to_string(), Value::Object(current));
    }

    let steps: Map<String, Value> = event
        .payload
        .pointer("/workflowState/steps")
        .and_then(Value::as_object)
        .map(|steps| {
            steps
                .iter()
                .map(|(id, result)| (format!("{prefix}.{id}"), result.clone()))
                .collect()
        })
        .unwrap_or_default();
    payload.insert(
        "workflowState".to_string(),
        json!({ "status": "running", "steps": steps }),
    );

    parent.emit_watch(WatchEvent {
        payload: Value::Object(payload),
        event_timestamp: event.event_timestamp,
    });
}

fn forward_event(parent: &Emitter, event: WorkflowEvent, prefix: &str) {
    match event {
        WorkflowEvent::Start { .. } | WorkflowEvent::Finish { .. } => {}
        other => parent.emit_event(other.with_prefixed_id(prefix)),
    }
}
