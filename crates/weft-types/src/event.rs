//! Event types for the two workflow observation channels.
//!
//! `WorkflowEvent` is the discrete "watch-v2" event: one per lifecycle
//! transition of a step or run. `WatchEvent` is the aggregated "watch" event
//! whose payload is a partial workflow-state view that subscribers merge into
//! a cumulative state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::{StepResult, WorkflowRunStatus};

// ---------------------------------------------------------------------------
// watch-v2
// ---------------------------------------------------------------------------

/// Payload of step lifecycle events: the step id plus the fields of its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEventPayload {
    pub id: String,
    #[serde(flatten)]
    pub result: StepResult,
}

/// Payload of `step-finish`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFinishPayload {
    pub id: String,
    #[serde(default)]
    pub metadata: Value,
}

/// Payload of run-level `start`/`finish`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEventPayload {
    pub run_id: String,
}

/// Discrete lifecycle events published on the watch-v2 channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkflowEvent {
    Start {
        payload: RunEventPayload,
    },
    StepStart {
        payload: StepEventPayload,
    },
    StepResult {
        payload: StepEventPayload,
    },
    StepSuspended {
        payload: StepEventPayload,
    },
    StepWaiting {
        payload: StepEventPayload,
    },
    StepFinish {
        payload: StepFinishPayload,
    },
    /// An agent-like step began streaming a tool call.
    #[serde(rename_all = "camelCase")]
    ToolCallStreamingStart {
        name: String,
        args: Value,
    },
    /// Incremental text produced by an agent-like step.
    #[serde(rename_all = "camelCase")]
    ToolCallDelta {
        name: String,
        args: Value,
        args_text_delta: String,
    },
    Finish {
        payload: RunEventPayload,
    },
}

impl WorkflowEvent {
    /// The step id this event refers to, if it is a step event.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            WorkflowEvent::StepStart { payload }
            | WorkflowEvent::StepResult { payload }
            | WorkflowEvent::StepSuspended { payload }
            | WorkflowEvent::StepWaiting { payload } => Some(&payload.id),
            WorkflowEvent::StepFinish { payload } => Some(&payload.id),
            WorkflowEvent::Start { .. }
            | WorkflowEvent::Finish { .. }
            | WorkflowEvent::ToolCallStreamingStart { .. }
            | WorkflowEvent::ToolCallDelta { .. } => None,
        }
    }

    /// Re-label a nested workflow's step event as `"{prefix}.{id}"`.
    ///
    /// Events without a step id are returned unchanged.
    pub fn with_prefixed_id(mut self, prefix: &str) -> Self {
        match &mut self {
            WorkflowEvent::StepStart { payload }
            | WorkflowEvent::StepResult { payload }
            | WorkflowEvent::StepSuspended { payload }
            | WorkflowEvent::StepWaiting { payload } => {
                payload.id = format!("{prefix}.{}", payload.id);
            }
            WorkflowEvent::StepFinish { payload } => {
                payload.id = format!("{prefix}.{}", payload.id);
            }
            WorkflowEvent::Start { .. }
            | WorkflowEvent::Finish { .. }
            | WorkflowEvent::ToolCallStreamingStart { .. }
            | WorkflowEvent::ToolCallDelta { .. } => {}
        }
        self
    }
}

// ---------------------------------------------------------------------------
// watch
// ---------------------------------------------------------------------------

/// The step currently being reported by a watch event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentStep {
    pub id: String,
    #[serde(flatten)]
    pub result: StepResult,
}

/// Partial or cumulative view of a run's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStateView {
    pub status: WorkflowRunStatus,
    pub steps: BTreeMap<String, StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of a watch event as produced by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<CurrentStep>,
    pub workflow_state: WorkflowStateView,
}

/// An event on the aggregated watch channel.
///
/// The payload is kept as JSON: subscribers deep-merge it into their own
/// cumulative state, and nested-workflow bubbling rewrites its keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchEvent {
    pub payload: Value,
    pub event_timestamp: DateTime<Utc>,
}

impl WatchEvent {
    pub fn new(payload: &WatchPayload) -> Self {
        Self {
            payload: serde_json::to_value(payload).unwrap_or(Value::Null),
            event_timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::StepStatus;
    use serde_json::json;

    fn step_start(id: &str) -> WorkflowEvent {
        WorkflowEvent::StepStart {
            payload: StepEventPayload {
                id: id.to_string(),
                result: StepResult::with_status(StepStatus::Running),
            },
        }
    }

    #[test]
    fn step_event_serializes_with_kebab_tag_and_flat_payload() {
        let json = serde_json::to_value(step_start("fetch")).unwrap();
        assert_eq!(json["type"], "step-start");
        assert_eq!(json["payload"]["id"], "fetch");
        assert_eq!(json["payload"]["status"], "running");
    }

    #[test]
    fn prefixing_rewrites_step_ids_only() {
        let event = step_start("inner").with_prefixed_id("child");
        assert_eq!(event.step_id(), Some("child.inner"));

        let start = WorkflowEvent::Start {
            payload: RunEventPayload {
                run_id: "r".to_string(),
            },
        };
        assert_eq!(start.clone().with_prefixed_id("child"), start);
    }

    #[test]
    fn tool_call_delta_uses_camel_case_fields() {
        let event = WorkflowEvent::ToolCallDelta {
            name: "writer".to_string(),
            args: json!({"prompt": "hi"}),
            args_text_delta: "Hel".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool-call-delta");
        assert_eq!(json["argsTextDelta"], "Hel");
    }

    #[test]
    fn watch_event_payload_omits_missing_current_step() {
        let payload = WatchPayload {
            current_step: None,
            workflow_state: WorkflowStateView {
                status: WorkflowRunStatus::Success,
                steps: BTreeMap::new(),
                result: Some(json!(1)),
                error: None,
            },
        };
        let event = WatchEvent::new(&payload);
        assert!(event.payload.get("currentStep").is_none());
        assert_eq!(event.payload["workflowState"]["status"], "success");
        assert_eq!(event.payload["workflowState"]["result"], json!(1));
    }
}
