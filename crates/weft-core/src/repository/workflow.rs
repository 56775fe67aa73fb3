//! Workflow snapshot store trait definition.
//!
//! Defines the durable storage interface for run snapshots. The engine writes
//! a full snapshot after every graph entry and reads it back on resume. The
//! infrastructure layer (weft-infra) implements this trait with SQLite; an
//! in-memory implementation lives in [`super::in_memory`].

use weft_types::error::RepositoryError;
use weft_types::workflow::{WorkflowRunRecord, WorkflowRunSnapshot, WorkflowRuns, WorkflowRunsQuery};

/// Snapshot store keyed by `(workflow_name, run_id)`.
///
/// Writes are upserts: the latest snapshot for a run replaces the previous
/// one, while the record's creation time is preserved.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowStore: Send + Sync {
    /// Insert or replace the snapshot of a run.
    ///
    /// A `None` resource id leaves any previously stored resource id intact.
    fn persist_workflow_snapshot(
        &self,
        workflow_name: &str,
        run_id: &str,
        resource_id: Option<&str>,
        snapshot: &WorkflowRunSnapshot,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Load the latest snapshot of a run, if one was ever written.
    fn load_workflow_snapshot(
        &self,
        workflow_name: &str,
        run_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRunSnapshot>, RepositoryError>> + Send;

    /// List stored runs, newest first.
    ///
    /// Pagination applies only when both `limit` and `offset` are set; `total`
    /// is always the number of runs matching the filters.
    fn get_workflow_runs(
        &self,
        query: &WorkflowRunsQuery,
    ) -> impl std::future::Future<Output = Result<WorkflowRuns, RepositoryError>> + Send;

    /// Fetch one run record, optionally scoped to a workflow name.
    fn get_workflow_run_by_id(
        &self,
        run_id: &str,
        workflow_name: Option<&str>,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRunRecord>, RepositoryError>> + Send;
}
