//! Durable checkpoint manager for run snapshots.
//!
//! Wraps a [`BoxWorkflowStore`] to provide the engine's persistence API. The
//! engine writes the full snapshot (step results, suspended paths, status)
//! whenever a step settles and after every top-level entry, so a crash loses
//! at most the steps still in flight.
//! Write failures are handled according to the configured
//! [`PersistencePolicy`].

use weft_types::config::PersistencePolicy;
use weft_types::workflow::{WorkflowRunSnapshot, WorkflowRunStatus};

use crate::repository::box_store::BoxWorkflowStore;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable execution checkpoints for workflow runs.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    store: BoxWorkflowStore,
    policy: PersistencePolicy,
}

impl CheckpointManager {
    /// Create a new checkpoint manager backed by the given store.
    pub fn new(store: BoxWorkflowStore, policy: PersistencePolicy) -> Self {
        Self { store, policy }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &BoxWorkflowStore {
        &self.store
    }

    pub fn policy(&self) -> PersistencePolicy {
        self.policy
    }

    /// Write the latest snapshot of a run.
    ///
    /// Under `BestEffort` a failed write is logged and reported as success.
    pub async fn persist_step_update(
        &self,
        workflow_id: &str,
        resource_id: Option<&str>,
        snapshot: &WorkflowRunSnapshot,
    ) -> Result<(), CheckpointError> {
        let result = self
            .store
            .persist_workflow_snapshot(workflow_id, &snapshot.run_id, resource_id, snapshot)
            .await;

        match result {
            Ok(()) => {
                tracing::debug!(
                    workflow_id,
                    run_id = %snapshot.run_id,
                    status = ?snapshot.status,
                    "checkpointed run snapshot"
                );
                Ok(())
            }
            Err(e) => match self.policy {
                PersistencePolicy::FailClosed => Err(CheckpointError::Repository(e.to_string())),
                PersistencePolicy::BestEffort => {
                    tracing::warn!(
                        workflow_id,
                        run_id = %snapshot.run_id,
                        error = %e,
                        "snapshot write failed, continuing"
                    );
                    Ok(())
                }
            },
        }
    }

    /// Write the placeholder snapshot of a freshly registered run, unless one
    /// already exists.
    pub async fn register_pending(
        &self,
        workflow_id: &str,
        resource_id: Option<&str>,
        snapshot: &WorkflowRunSnapshot,
    ) -> Result<bool, CheckpointError> {
        if self.load(workflow_id, &snapshot.run_id).await?.is_some() {
            return Ok(false);
        }
        debug_assert_eq!(snapshot.status, WorkflowRunStatus::Pending);
        self.persist_step_update(workflow_id, resource_id, snapshot).await?;
        Ok(true)
    }

    pub async fn load(
        &self,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<Option<WorkflowRunSnapshot>, CheckpointError> {
        self.store
            .load_workflow_snapshot(workflow_id, run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))
    }

    /// Load the snapshot a resume must start from.
    pub async fn restore(
        &self,
        workflow_id: &str,
        run_id: &str,
    ) -> Result<WorkflowRunSnapshot, CheckpointError> {
        self.load(workflow_id, run_id)
            .await?
            .ok_or_else(|| CheckpointError::RunNotFound(run_id.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying store operation failed.
    #[error("checkpoint repository error: {0}")]
    Repository(String),

    /// No snapshot exists for the run.
    #[error("no snapshot found for workflow run {0}")]
    RunNotFound(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
