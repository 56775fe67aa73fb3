//! Field mappings used by `Workflow::map_fields`.
//!
//! A mapping step builds its output object field by field, each field drawn
//! from a constant, a closure, an earlier step's output, the run input, or
//! the runtime context.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value, json};

use super::context::StepContext;
use super::step::{Step, StepError, StepOutcome};

type MapFn =
    dyn Fn(StepContext) -> Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send>> + Send + Sync;

/// Source of one output field.
#[derive(Clone)]
pub enum MapField {
    /// A constant.
    Value(Value),
    /// Computed from the step context.
    Fn(Arc<MapFn>),
    /// Read from the output of the first listed step that has succeeded.
    StepPath { steps: Vec<String>, path: String },
    /// Read from the run's original input.
    InitPath { path: String },
    /// Read from the runtime context.
    RuntimeContextPath { path: String },
}

impl MapField {
    pub fn value(value: Value) -> Self {
        Self::Value(value)
    }

    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        Self::Fn(Arc::new(move |ctx| Box::pin(f(ctx))))
    }

    /// `path` is dot-separated; `"."` selects the whole output.
    pub fn step(step_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self::StepPath {
            steps: vec![step_id.into()],
            path: path.into(),
        }
    }

    /// Like [`MapField::step`], falling back through `step_ids` in order.
    pub fn first_of<I, S>(step_ids: I, path: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::StepPath {
            steps: step_ids.into_iter().map(Into::into).collect(),
            path: path.into(),
        }
    }

    pub fn init(path: impl Into<String>) -> Self {
        Self::InitPath { path: path.into() }
    }

    pub fn runtime_context(path: impl Into<String>) -> Self {
        Self::RuntimeContextPath { path: path.into() }
    }

    /// Step ids this field reads from.
    pub fn step_refs(&self) -> &[String] {
        match self {
            MapField::StepPath { steps, .. } => steps,
            _ => &[],
        }
    }

    fn describe(&self) -> Value {
        match self {
            MapField::Value(value) => json!({ "value": value }),
            MapField::Fn(_) => json!({ "fn": "<function>" }),
            MapField::StepPath { steps, path } => json!({ "step": steps, "path": path }),
            MapField::InitPath { path } => json!({ "initData": path }),
            MapField::RuntimeContextPath { path } => json!({ "runtimeContextPath": path }),
        }
    }

    async fn resolve(&self, ctx: &StepContext) -> Result<Value, StepError> {
        match self {
            MapField::Value(value) => Ok(value.clone()),
            MapField::Fn(f) => f(ctx.clone()).await,
            MapField::StepPath { steps, path } => {
                let Some((step_id, output)) = steps
                    .iter()
                    .find_map(|id| ctx.get_step_result(id).map(|output| (id, output)))
                else {
                    return Ok(Value::Null);
                };
                select_path(&output, path, step_id)
            }
            MapField::InitPath { path } => select_path(ctx.get_init_data(), path, ctx.step_id()),
            MapField::RuntimeContextPath { path } => {
                if let Some(value) = ctx.runtime_context().get(path) {
                    return Ok(value);
                }
                let (key, rest) = path.split_once('.').unwrap_or((path.as_str(), "."));
                match ctx.runtime_context().get(key) {
                    Some(value) => select_path(&value, rest, ctx.step_id()),
                    None => Ok(Value::Null),
                }
            }
        }
    }
}

impl std::fmt::Debug for MapField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MapField({})", self.describe())
    }
}

/// Walk a dot-separated path. A missing final key yields null; descending
/// through a non-container is an error.
pub fn select_path(value: &Value, path: &str, step_id: &str) -> Result<Value, StepError> {
    if path == "." || path.is_empty() {
        return Ok(value.clone());
    }

    let mut current = value;
    for part in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(part).unwrap_or(&Value::Null),
            Value::Array(items) => part
                .parse::<usize>()
                .ok()
                .and_then(|idx| items.get(idx))
                .unwrap_or(&Value::Null),
            _ => {
                return Err(StepError::InvalidPath {
                    step_id: step_id.to_string(),
                    path: path.to_string(),
                });
            }
        };
    }
    Ok(current.clone())
}

// ---------------------------------------------------------------------------
// MapStep
// ---------------------------------------------------------------------------

/// Step synthesized by `map_fields`; outputs an object of resolved fields.
#[derive(Debug, Clone)]
pub struct MapStep {
    id: String,
    fields: Vec<(String, MapField)>,
}

impl MapStep {
    pub fn new(id: impl Into<String>, fields: Vec<(String, MapField)>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Every step id referenced by a `StepPath` field.
    pub fn step_refs(&self) -> Vec<String> {
        self.fields
            .iter()
            .flat_map(|(_, field)| field.step_refs().iter().cloned())
            .collect()
    }
}

impl Step for MapStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn map_config(&self) -> Option<String> {
        let described: Map<String, Value> = self
            .fields
            .iter()
            .map(|(name, field)| (name.clone(), field.describe()))
            .collect();
        serde_json::to_string_pretty(&described).ok()
    }

    async fn execute(&self, ctx: StepContext) -> Result<StepOutcome, StepError> {
        let mut output = Map::new();
        for (name, field) in &self.fields {
            output.insert(name.clone(), field.resolve(&ctx).await?);
        }
        Ok(StepOutcome::Success(Value::Object(output)))
    }
}
