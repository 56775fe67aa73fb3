//! Step definition: the unit of work referenced by graph entries.
//!
//! `Step` uses RPITIT for its async `execute`. Graph entries hold steps as
//! [`StepRef`] (`Arc<dyn StepDyn>`), following the usual blanket-impl
//! pattern:
//! 1. `Step` is the ergonomic trait implementors write against
//! 2. `StepDyn` is object-safe with a boxed future
//! 3. Every `T: Step` is automatically a `StepDyn`

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use weft_types::workflow::{SerializedStep, SerializedStepFlowEntry, StepSchemas};

use super::context::StepContext;

// ---------------------------------------------------------------------------
// Outcome & error
// ---------------------------------------------------------------------------

/// What a step produced when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Normal completion with an output value.
    Success(Value),
    /// Pause the run; the payload is stored as the step's `suspend_payload`.
    Suspended(Value),
    /// Finish the whole run early, successfully, with this value as its result.
    Bailed(Value),
}

/// Errors raised from inside a step body.
///
/// Any error counts as a failed attempt; after the last attempt the step is
/// recorded as `failed` with the error's display text.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid path {path} in step {step_id}")]
    InvalidPath { step_id: String, path: String },

    #[error("{0}")]
    Timeout(String),

    #[error("nested workflow {workflow_id} failed: {message}")]
    Nested { workflow_id: String, message: String },
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        Self::Failed(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Step traits
// ---------------------------------------------------------------------------

/// A named unit of work.
///
/// Only `id` and `execute` are required. The remaining methods describe the
/// step for introspection and retry resolution.
pub trait Step: Send + Sync {
    /// Identifier, unique within a workflow. `input` is reserved.
    fn id(&self) -> &str;

    fn description(&self) -> Option<&str> {
        None
    }

    /// Retry count overriding the workflow default.
    fn retries(&self) -> Option<u32> {
        None
    }

    fn schemas(&self) -> StepSchemas {
        StepSchemas::default()
    }

    /// Human-readable mapping description for `map` steps.
    fn map_config(&self) -> Option<String> {
        None
    }

    /// Graph of a workflow used as a step.
    fn serialized_step_flow(&self) -> Option<Vec<SerializedStepFlowEntry>> {
        None
    }

    fn execute(
        &self,
        ctx: StepContext,
    ) -> impl Future<Output = Result<StepOutcome, StepError>> + Send;
}

/// Object-safe version of [`Step`] with a boxed future.
pub trait StepDyn: Send + Sync {
    fn id(&self) -> &str;

    fn description(&self) -> Option<&str>;

    fn retries(&self) -> Option<u32>;

    fn schemas(&self) -> StepSchemas;

    fn map_config(&self) -> Option<String>;

    fn serialized_step_flow(&self) -> Option<Vec<SerializedStepFlowEntry>>;

    fn execute_boxed(
        &self,
        ctx: StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutcome, StepError>> + Send + '_>>;
}

impl<T: Step> StepDyn for T {
    fn id(&self) -> &str {
        Step::id(self)
    }

    fn description(&self) -> Option<&str> {
        Step::description(self)
    }

    fn retries(&self) -> Option<u32> {
        Step::retries(self)
    }

    fn schemas(&self) -> StepSchemas {
        Step::schemas(self)
    }

    fn map_config(&self) -> Option<String> {
        Step::map_config(self)
    }

    fn serialized_step_flow(&self) -> Option<Vec<SerializedStepFlowEntry>> {
        Step::serialized_step_flow(self)
    }

    fn execute_boxed(
        &self,
        ctx: StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<StepOutcome, StepError>> + Send + '_>> {
        Box::pin(self.execute(ctx))
    }
}

/// Shared handle to a step. Several graph entries may hold the same step.
pub type StepRef = Arc<dyn StepDyn>;

/// Introspection view of a step.
pub fn serialize_step(step: &dyn StepDyn) -> SerializedStep {
    SerializedStep {
        id: step.id().to_string(),
        description: step.description().map(str::to_string),
        serialized_step_flow: step.serialized_step_flow(),
        map_config: step.map_config(),
        schemas: step.schemas(),
    }
}

// ---------------------------------------------------------------------------
// FnStep
// ---------------------------------------------------------------------------

/// A step whose body is an async closure. Built with [`create_step`].
pub struct FnStep<F> {
    id: String,
    description: Option<String>,
    retries: Option<u32>,
    schemas: StepSchemas,
    map_config: Option<String>,
    f: F,
}

/// Build a step from an id and an async closure over its context.
pub fn create_step<F, Fut>(id: impl Into<String>, f: F) -> FnStep<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepOutcome, StepError>> + Send + 'static,
{
    FnStep {
        id: id.into(),
        description: None,
        retries: None,
        schemas: StepSchemas::default(),
        map_config: None,
        f,
    }
}

impl<F> FnStep<F> {
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
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

    pub fn with_resume_schema(mut self, schema: Value) -> Self {
        self.schemas.resume_schema = Some(schema);
        self
    }

    pub fn with_suspend_schema(mut self, schema: Value) -> Self {
        self.schemas.suspend_schema = Some(schema);
        self
    }

    pub(crate) fn with_map_config(mut self, map_config: impl Into<String>) -> Self {
        self.map_config = Some(map_config.into());
        self
    }
}

impl<F, Fut> Step for FnStep<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepOutcome, StepError>> + Send + 'static,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn retries(&self) -> Option<u32> {
        self.retries
    }

    fn schemas(&self) -> StepSchemas {
        self.schemas.clone()
    }

    fn map_config(&self) -> Option<String> {
        self.map_config.clone()
    }

    fn execute(
        &self,
        ctx: StepContext,
    ) -> impl Future<Output = Result<StepOutcome, StepError>> + Send {
        (self.f)(ctx)
    }
}

impl<F> std::fmt::Debug for FnStep<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStep")
            .field("id", &self.id)
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}
