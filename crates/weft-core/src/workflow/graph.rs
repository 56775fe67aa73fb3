//! The execution graph: a closed set of entry types interpreted by the engine.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use weft_types::workflow::{
    ForeachOptions, LoopType, SerializedCondition, SerializedStepFlowEntry,
};

use super::context::{ConditionContext, StepResultStore};
use super::step::{StepError, StepRef, serialize_step};

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

type ConditionFn = dyn Fn(ConditionContext) -> Pin<Box<dyn Future<Output = Result<bool, StepError>> + Send>>
    + Send
    + Sync;

/// Predicate used by branches and loops.
///
/// Conditions are opaque closures; only their label is serialized.
#[derive(Clone)]
pub struct Condition {
    label: String,
    eval: Arc<ConditionFn>,
}

impl Condition {
    /// Build a condition from an async predicate.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(ConditionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, StepError>> + Send + 'static,
    {
        Self {
            label: "condition".to_string(),
            eval: Arc::new(move |ctx| Box::pin(f(ctx))),
        }
    }

    /// Build a condition from a synchronous, infallible predicate.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&ConditionContext) -> bool + Send + Sync + 'static,
    {
        Self::new(move |ctx| {
            let holds = f(&ctx);
            async move { Ok(holds) }
        })
    }

    /// Attach a human-readable label shown in the serialized graph.
    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) async fn evaluate(&self, ctx: ConditionContext) -> Result<bool, StepError> {
        (self.eval)(ctx).await
    }
}

impl std::fmt::Debug for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condition").field("label", &self.label).finish()
    }
}

// ---------------------------------------------------------------------------
// GraphEntry
// ---------------------------------------------------------------------------

/// One node of the execution graph.
#[derive(Clone)]
pub enum GraphEntry {
    Step {
        step: StepRef,
    },
    Sleep {
        id: String,
        duration: Duration,
    },
    SleepUntil {
        id: String,
        date: DateTime<Utc>,
    },
    WaitForEvent {
        event: String,
        step: StepRef,
        timeout: Option<Duration>,
    },
    Parallel {
        steps: Vec<GraphEntry>,
    },
    /// `steps[i]` runs when `conditions[i]` holds.
    Conditional {
        steps: Vec<GraphEntry>,
        conditions: Vec<Condition>,
    },
    Loop {
        step: StepRef,
        condition: Condition,
        loop_type: LoopType,
    },
    Foreach {
        step: StepRef,
        opts: ForeachOptions,
    },
}

impl GraphEntry {
    /// Key under which this entry's result is recorded, if it has one.
    ///
    /// Parallel and conditional entries record only their children.
    pub fn entry_id(&self) -> Option<&str> {
        match self {
            GraphEntry::Step { step }
            | GraphEntry::WaitForEvent { step, .. }
            | GraphEntry::Loop { step, .. }
            | GraphEntry::Foreach { step, .. } => Some(step.id()),
            GraphEntry::Sleep { id, .. } | GraphEntry::SleepUntil { id, .. } => Some(id.as_str()),
            GraphEntry::Parallel { .. } | GraphEntry::Conditional { .. } => None,
        }
    }

    /// Every step id this entry can record, including nested children.
    pub fn step_ids(&self) -> Vec<String> {
        match self {
            GraphEntry::Parallel { steps } | GraphEntry::Conditional { steps, .. } => {
                steps.iter().flat_map(GraphEntry::step_ids).collect()
            }
            other => other.entry_id().map(str::to_string).into_iter().collect(),
        }
    }

    /// The output this entry left behind in `results`, as seen by the next entry.
    pub fn output(&self, results: &StepResultStore) -> Value {
        match self {
            GraphEntry::Parallel { steps } | GraphEntry::Conditional { steps, .. } => {
                let mut outputs = Map::new();
                for child in steps {
                    match child {
                        GraphEntry::Parallel { .. } | GraphEntry::Conditional { .. } => {
                            if let Value::Object(nested) = child.output(results) {
                                outputs.extend(nested);
                            }
                        }
                        _ => {
                            if let Some(id) = child.entry_id() {
                                if let Some(output) = results.output(id) {
                                    outputs.insert(id.to_string(), output);
                                }
                            }
                        }
                    }
                }
                Value::Object(outputs)
            }
            other => other
                .entry_id()
                .and_then(|id| results.output(id))
                .unwrap_or(Value::Null),
        }
    }

    /// Structural description of this entry for snapshots and introspection.
    pub fn serialize(&self) -> SerializedStepFlowEntry {
        match self {
            GraphEntry::Step { step } => SerializedStepFlowEntry::Step {
                step: serialize_step(step.as_ref()),
            },
            GraphEntry::Sleep { id, duration } => SerializedStepFlowEntry::Sleep {
                id: id.clone(),
                duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            },
            GraphEntry::SleepUntil { id, date } => SerializedStepFlowEntry::SleepUntil {
                id: id.clone(),
                date: *date,
            },
            GraphEntry::WaitForEvent {
                event,
                step,
                timeout,
            } => SerializedStepFlowEntry::WaitForEvent {
                event: event.clone(),
                step: serialize_step(step.as_ref()),
                timeout_ms: timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            },
            GraphEntry::Parallel { steps } => SerializedStepFlowEntry::Parallel {
                steps: steps.iter().map(GraphEntry::serialize).collect(),
            },
            GraphEntry::Conditional { steps, conditions } => SerializedStepFlowEntry::Conditional {
                steps: steps.iter().map(GraphEntry::serialize).collect(),
                serialized_conditions: steps
                    .iter()
                    .zip(conditions)
                    .map(|(step, condition)| serialize_condition(step.entry_id(), condition))
                    .collect(),
            },
            GraphEntry::Loop {
                step,
                condition,
                loop_type,
            } => SerializedStepFlowEntry::Loop {
                step: serialize_step(step.as_ref()),
                serialized_condition: serialize_condition(Some(step.id()), condition),
                loop_type: *loop_type,
            },
            GraphEntry::Foreach { step, opts } => SerializedStepFlowEntry::Foreach {
                step: serialize_step(step.as_ref()),
                opts: *opts,
            },
        }
    }
}

fn serialize_condition(step_id: Option<&str>, condition: &Condition) -> SerializedCondition {
    SerializedCondition {
        id: format!("{}-condition", step_id.unwrap_or("branch")),
        label: condition.label().to_string(),
    }
}

impl std::fmt::Debug for GraphEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphEntry::Step { step } => f.debug_struct("Step").field("id", &step.id()).finish(),
            GraphEntry::Sleep { id, duration } => f
                .debug_struct("Sleep")
                .field("id", id)
                .field("duration", duration)
                .finish(),
            GraphEntry::SleepUntil { id, date } => f
                .debug_struct("SleepUntil")
                .field("id", id)
                .field("date", date)
                .finish(),
            GraphEntry::WaitForEvent { event, step, timeout } => f
                .debug_struct("WaitForEvent")
                .field("event", event)
                .field("step", &step.id())
                .field("timeout", timeout)
                .finish(),
            GraphEntry::Parallel { steps } => f.debug_struct("Parallel").field("steps", steps).finish(),
            GraphEntry::Conditional { steps, conditions } => f
                .debug_struct("Conditional")
                .field("steps", steps)
                .field("conditions", conditions)
                .finish(),
            GraphEntry::Loop {
                step,
                condition,
                loop_type,
            } => f
                .debug_struct("Loop")
                .field("step", &step.id())
                .field("condition", condition)
                .field("loop_type", loop_type)
                .finish(),
            GraphEntry::Foreach { step, opts } => f
                .debug_struct("Foreach")
                .field("step", &step.id())
                .field("opts", opts)
                .finish(),
        }
    }
}
