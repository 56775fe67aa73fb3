//! Workflow domain types for weft.
//!
//! Defines the execution-tracking types shared by the engine and the snapshot
//! stores: per-step results, the accumulated step-results map, the persisted
//! run snapshot, run records returned by history queries, and the structural
//! description of a workflow graph used for introspection.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Status of a single step invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Waiting,
    Success,
    Failed,
    Suspended,
    Bailed,
    Canceled,
}

/// Overall status of a workflow run, as persisted in its snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    /// Run registered but nothing has executed yet.
    Pending,
    Running,
    /// Blocked on a sleep or an external event.
    Waiting,
    Success,
    Failed,
    Suspended,
    Canceled,
}

impl WorkflowRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowRunStatus::Pending => "pending",
            WorkflowRunStatus::Running => "running",
            WorkflowRunStatus::Waiting => "waiting",
            WorkflowRunStatus::Success => "success",
            WorkflowRunStatus::Failed => "failed",
            WorkflowRunStatus::Suspended => "suspended",
            WorkflowRunStatus::Canceled => "canceled",
        }
    }

    /// Whether the run has settled and will not make further progress on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowRunStatus::Success | WorkflowRunStatus::Failed | WorkflowRunStatus::Canceled
        )
    }
}

impl std::fmt::Display for WorkflowRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<StepStatus> for WorkflowRunStatus {
    fn from(status: StepStatus) -> Self {
        match status {
            StepStatus::Running => WorkflowRunStatus::Running,
            StepStatus::Waiting => WorkflowRunStatus::Waiting,
            StepStatus::Success | StepStatus::Bailed => WorkflowRunStatus::Success,
            StepStatus::Failed => WorkflowRunStatus::Failed,
            StepStatus::Suspended => WorkflowRunStatus::Suspended,
            StepStatus::Canceled => WorkflowRunStatus::Canceled,
        }
    }
}

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

/// Record of the latest invocation of one step id.
///
/// Absent fields are omitted from the JSON form so that watch-state merges
/// never overwrite a known value with an unknown one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub status: StepStatus,
    /// Input the step received (previous entry's output).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Data supplied by `resume` (or the awaited event) for this invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<DateTime<Utc>>,
}

impl StepResult {
    /// A bare result carrying only a status.
    pub fn with_status(status: StepStatus) -> Self {
        Self {
            status,
            payload: None,
            resume_payload: None,
            output: None,
            error: None,
            suspend_payload: None,
            started_at: None,
            ended_at: None,
            suspended_at: None,
            resumed_at: None,
        }
    }

    pub fn success(output: Value) -> Self {
        Self {
            output: Some(output),
            ended_at: Some(Utc::now()),
            ..Self::with_status(StepStatus::Success)
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ended_at: Some(Utc::now()),
            ..Self::with_status(StepStatus::Failed)
        }
    }

    pub fn suspended(payload: Value) -> Self {
        Self {
            suspend_payload: Some(payload),
            suspended_at: Some(Utc::now()),
            ..Self::with_status(StepStatus::Suspended)
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }

    /// Overlay `other` onto `self`: fields present in `other` win.
    pub fn merged_with(mut self, other: StepResult) -> Self {
        self.status = other.status;
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        overlay!(
            payload,
            resume_payload,
            output,
            error,
            suspend_payload,
            started_at,
            ended_at,
            suspended_at,
            resumed_at
        );
        self
    }
}

/// The accumulated results of a run: the original input under the reserved
/// `input` key, plus one entry per step id that has begun executing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepResults {
    #[serde(default)]
    pub input: Value,
    #[serde(flatten)]
    pub steps: BTreeMap<String, StepResult>,
}

impl StepResults {
    pub fn new(input: Value) -> Self {
        Self {
            input,
            steps: BTreeMap::new(),
        }
    }

    pub fn get(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.get(step_id)
    }
}

// ---------------------------------------------------------------------------
// Snapshot & run records
// ---------------------------------------------------------------------------

/// Durable checkpoint of a run, overwritten after every entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunSnapshot {
    pub run_id: String,
    pub status: WorkflowRunStatus,
    pub context: StepResults,
    #[serde(default)]
    pub active_paths: Vec<usize>,
    #[serde(default)]
    pub serialized_step_graph: Vec<SerializedStepFlowEntry>,
    /// Execution path of every step that suspended, keyed by step id.
    #[serde(default)]
    pub suspended_paths: BTreeMap<String, Vec<usize>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowRunSnapshot {
    /// Placeholder written when a run is registered before anything executes.
    pub fn pending(run_id: impl Into<String>, graph: Vec<SerializedStepFlowEntry>) -> Self {
        Self {
            run_id: run_id.into(),
            status: WorkflowRunStatus::Pending,
            context: StepResults::default(),
            active_paths: Vec::new(),
            serialized_step_graph: graph,
            suspended_paths: BTreeMap::new(),
            result: None,
            error: None,
            timestamp: Utc::now(),
        }
    }
}

/// One stored run, as returned by history queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunRecord {
    pub workflow_name: String,
    pub run_id: String,
    pub snapshot: WorkflowRunSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Filter for run history queries. Every field is optional.
#[derive(Debug, Clone, Default)]
pub struct WorkflowRunsQuery {
    pub workflow_name: Option<String>,
    pub resource_id: Option<String>,
    pub from_date: Option<DateTime<Utc>>,
    pub to_date: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// A page of run records plus the total matching count.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowRuns {
    pub runs: Vec<WorkflowRunRecord>,
    pub total: u64,
}

/// Summary of a run's outcome derived from its stored snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRunExecutionResult {
    pub status: WorkflowRunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The run's original input.
    pub payload: Value,
    pub steps: BTreeMap<String, StepResult>,
}

impl From<&WorkflowRunSnapshot> for WorkflowRunExecutionResult {
    fn from(snapshot: &WorkflowRunSnapshot) -> Self {
        Self {
            status: snapshot.status,
            result: snapshot.result.clone(),
            error: snapshot.error.clone(),
            payload: snapshot.context.input.clone(),
            steps: snapshot.context.steps.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Serialized step graph
// ---------------------------------------------------------------------------

/// Descriptive JSON schemas attached to a step. Carried for introspection
/// only; the engine never validates payloads against them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSchemas {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend_schema: Option<Value>,
}

/// Introspection view of a step referenced by the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedStep {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Graph of a nested workflow used as this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serialized_step_flow: Option<Vec<SerializedStepFlowEntry>>,
    /// Human-readable description of a `map` entry's mapping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_config: Option<String>,
    #[serde(flatten)]
    pub schemas: StepSchemas,
}

/// Structural description of a condition (no source serialization).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedCondition {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopType {
    DoWhile,
    DoUntil,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeachOptions {
    pub concurrency: usize,
}

impl Default for ForeachOptions {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

/// Serializable mirror of an execution-graph entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SerializedStepFlowEntry {
    Step {
        step: SerializedStep,
    },
    Sleep {
        id: String,
        duration_ms: u64,
    },
    SleepUntil {
        id: String,
        date: DateTime<Utc>,
    },
    WaitForEvent {
        event: String,
        step: SerializedStep,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Parallel {
        steps: Vec<SerializedStepFlowEntry>,
    },
    Conditional {
        steps: Vec<SerializedStepFlowEntry>,
        serialized_conditions: Vec<SerializedCondition>,
    },
    Loop {
        step: SerializedStep,
        serialized_condition: SerializedCondition,
        loop_type: LoopType,
    },
    Foreach {
        step: SerializedStep,
        opts: ForeachOptions,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_results_serialize_input_alongside_steps() {
        let mut results = StepResults::new(json!({"n": 1}));
        results
            .steps
            .insert("double".to_string(), StepResult::success(json!({"n": 2})));

        let value = serde_json::to_value(&results).unwrap();
        assert_eq!(value["input"], json!({"n": 1}));
        assert_eq!(value["double"]["status"], "success");
        assert_eq!(value["double"]["output"], json!({"n": 2}));

        let parsed: StepResults = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.input, json!({"n": 1}));
        assert!(parsed.get("double").unwrap().is_success());
        assert!(parsed.get("input").is_none());
    }

    #[test]
    fn step_result_omits_absent_fields() {
        let value = serde_json::to_value(StepResult::with_status(StepStatus::Running)).unwrap();
        assert_eq!(value, json!({"status": "running"}));
    }

    #[test]
    fn merged_with_keeps_existing_fields() {
        let base = StepResult {
            payload: Some(json!(1)),
            started_at: Some(Utc::now()),
            ..StepResult::with_status(StepStatus::Running)
        };
        let merged = base.merged_with(StepResult::success(json!(2)));
        assert_eq!(merged.status, StepStatus::Success);
        assert_eq!(merged.payload, Some(json!(1)));
        assert_eq!(merged.output, Some(json!(2)));
        assert!(merged.started_at.is_some());
    }

    #[test]
    fn run_status_from_step_status_normalizes_bailed() {
        assert_eq!(
            WorkflowRunStatus::from(StepStatus::Bailed),
            WorkflowRunStatus::Success
        );
        assert!(WorkflowRunStatus::Canceled.is_terminal());
        assert!(!WorkflowRunStatus::Suspended.is_terminal());
    }

    #[test]
    fn serialized_entry_is_tagged() {
        let entry = SerializedStepFlowEntry::Loop {
            step: SerializedStep {
                id: "poll".to_string(),
                description: None,
                serialized_step_flow: None,
                map_config: None,
                schemas: StepSchemas {
                    input_schema: Some(json!({"type": "object"})),
                    ..StepSchemas::default()
                },
            },
            serialized_condition: SerializedCondition {
                id: "poll-condition".to_string(),
                label: "until ready".to_string(),
            },
            loop_type: LoopType::DoUntil,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"type\":\"loop\""));
        assert!(json.contains("\"loopType\":\"dountil\""));
        assert!(json.contains("\"inputSchema\":{\"type\":\"object\"}"));
    }

    #[test]
    fn pending_snapshot_has_no_steps() {
        let snapshot = WorkflowRunSnapshot::pending("run-1", vec![]);
        assert_eq!(snapshot.status, WorkflowRunStatus::Pending);
        assert!(snapshot.context.steps.is_empty());
        let summary = WorkflowRunExecutionResult::from(&snapshot);
        assert_eq!(summary.payload, Value::Null);
    }
}
