//! BoxWorkflowStore -- object-safe dynamic dispatch wrapper for WorkflowStore.
//!
//! Same blanket-impl pattern as `StepDyn`:
//! 1. Define an object-safe `WorkflowStoreDyn` trait with boxed futures
//! 2. Blanket-impl `WorkflowStoreDyn` for all `T: WorkflowStore`
//! 3. `BoxWorkflowStore` wraps `Arc<dyn WorkflowStoreDyn>` and delegates
//!
//! The wrapper is cheaply cloneable so a workflow, its runs, and any nested
//! workflows can share one backing store.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use weft_types::error::RepositoryError;
use weft_types::workflow::{WorkflowRunRecord, WorkflowRunSnapshot, WorkflowRuns, WorkflowRunsQuery};

use super::workflow::WorkflowStore;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`WorkflowStore`] with boxed futures.
///
/// This trait exists solely to enable dynamic dispatch (`dyn WorkflowStoreDyn`).
/// A blanket implementation is provided for all types implementing `WorkflowStore`.
pub trait WorkflowStoreDyn: Send + Sync {
    fn persist_boxed<'a>(
        &'a self,
        workflow_name: &'a str,
        run_id: &'a str,
        resource_id: Option<&'a str>,
        snapshot: &'a WorkflowRunSnapshot,
    ) -> BoxFuture<'a, Result<(), RepositoryError>>;

    fn load_boxed<'a>(
        &'a self,
        workflow_name: &'a str,
        run_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<WorkflowRunSnapshot>, RepositoryError>>;

    fn runs_boxed<'a>(
        &'a self,
        query: &'a WorkflowRunsQuery,
    ) -> BoxFuture<'a, Result<WorkflowRuns, RepositoryError>>;

    fn run_by_id_boxed<'a>(
        &'a self,
        run_id: &'a str,
        workflow_name: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<WorkflowRunRecord>, RepositoryError>>;
}

/// Blanket implementation: any `WorkflowStore` automatically implements `WorkflowStoreDyn`.
impl<T: WorkflowStore> WorkflowStoreDyn for T {
    fn persist_boxed<'a>(
        &'a self,
        workflow_name: &'a str,
        run_id: &'a str,
        resource_id: Option<&'a str>,
        snapshot: &'a WorkflowRunSnapshot,
    ) -> BoxFuture<'a, Result<(), RepositoryError>> {
        Box::pin(self.persist_workflow_snapshot(workflow_name, run_id, resource_id, snapshot))
    }

    fn load_boxed<'a>(
        &'a self,
        workflow_name: &'a str,
        run_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<WorkflowRunSnapshot>, RepositoryError>> {
        Box::pin(self.load_workflow_snapshot(workflow_name, run_id))
    }

    fn runs_boxed<'a>(
        &'a self,
        query: &'a WorkflowRunsQuery,
    ) -> BoxFuture<'a, Result<WorkflowRuns, RepositoryError>> {
        Box::pin(self.get_workflow_runs(query))
    }

    fn run_by_id_boxed<'a>(
        &'a self,
        run_id: &'a str,
        workflow_name: Option<&'a str>,
    ) -> BoxFuture<'a, Result<Option<WorkflowRunRecord>, RepositoryError>> {
        Box::pin(self.get_workflow_run_by_id(run_id, workflow_name))
    }
}

/// Type-erased snapshot store for runtime backend selection.
///
/// Since `WorkflowStore` uses RPITIT, it cannot be used as a trait object
/// directly. `BoxWorkflowStore` provides equivalent methods that delegate to
/// the inner `WorkflowStoreDyn` trait object.
#[derive(Clone)]
pub struct BoxWorkflowStore {
    inner: Arc<dyn WorkflowStoreDyn>,
}

impl BoxWorkflowStore {
    /// Wrap a concrete `WorkflowStore` in a type-erased handle.
    pub fn new<T: WorkflowStore + 'static>(store: T) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    pub async fn persist_workflow_snapshot(
        &self,
        workflow_name: &str,
        run_id: &str,
        resource_id: Option<&str>,
        snapshot: &WorkflowRunSnapshot,
    ) -> Result<(), RepositoryError> {
        self.inner
            .persist_boxed(workflow_name, run_id, resource_id, snapshot)
            .await
    }

    pub async fn load_workflow_snapshot(
        &self,
        workflow_name: &str,
        run_id: &str,
    ) -> Result<Option<WorkflowRunSnapshot>, RepositoryError> {
        self.inner.load_boxed(workflow_name, run_id).await
    }

    pub async fn get_workflow_runs(
        &self,
        query: &WorkflowRunsQuery,
    ) -> Result<WorkflowRuns, RepositoryError> {
        self.inner.runs_boxed(query).await
    }

    pub async fn get_workflow_run_by_id(
        &self,
        run_id: &str,
        workflow_name: Option<&str>,
    ) -> Result<Option<WorkflowRunRecord>, RepositoryError> {
        self.inner.run_by_id_boxed(run_id, workflow_name).await
    }
}

impl std::fmt::Debug for BoxWorkflowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxWorkflowStore").finish_non_exhaustive()
    }
}
