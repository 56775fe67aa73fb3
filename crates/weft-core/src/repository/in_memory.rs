//! In-memory snapshot store backed by a sharded concurrent map.
//!
//! Used by default when a workflow is built without an explicit store, and
//! by engine tests. Nothing survives process exit.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use weft_types::error::RepositoryError;
use weft_types::workflow::{WorkflowRunRecord, WorkflowRunSnapshot, WorkflowRuns, WorkflowRunsQuery};

use super::workflow::WorkflowStore;

/// `WorkflowStore` that keeps every run record in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWorkflowStore {
    records: Arc<DashMap<(String, String), WorkflowRunRecord>>,
}

impl InMemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored runs across all workflows.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl WorkflowStore for InMemoryWorkflowStore {
    async fn persist_workflow_snapshot(
        &self,
        workflow_name: &str,
        run_id: &str,
        resource_id: Option<&str>,
        snapshot: &WorkflowRunSnapshot,
    ) -> Result<(), RepositoryError> {
        let now = Utc::now();
        self.records
            .entry((workflow_name.to_string(), run_id.to_string()))
            .and_modify(|record| {
                record.snapshot = snapshot.clone();
                record.updated_at = now;
                if let Some(resource_id) = resource_id {
                    record.resource_id = Some(resource_id.to_string());
                }
            })
            .or_insert_with(|| WorkflowRunRecord {
                workflow_name: workflow_name.to_string(),
                run_id: run_id.to_string(),
                snapshot: snapshot.clone(),
                resource_id: resource_id.map(str::to_string),
                created_at: now,
                updated_at: now,
            });
        Ok(())
    }

    async fn load_workflow_snapshot(
        &self,
        workflow_name: &str,
        run_id: &str,
    ) -> Result<Option<WorkflowRunSnapshot>, RepositoryError> {
        Ok(self
            .records
            .get(&(workflow_name.to_string(), run_id.to_string()))
            .map(|record| record.snapshot.clone()))
    }

    async fn get_workflow_runs(
        &self,
        query: &WorkflowRunsQuery,
    ) -> Result<WorkflowRuns, RepositoryError> {
        let mut runs: Vec<WorkflowRunRecord> = self
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|record| {
                query
                    .workflow_name
                    .as_ref()
                    .is_none_or(|name| &record.workflow_name == name)
                    && query
                        .resource_id
                        .as_ref()
                        .is_none_or(|id| record.resource_id.as_ref() == Some(id))
                    && query.from_date.is_none_or(|from| record.created_at >= from)
                    && query.to_date.is_none_or(|to| record.created_at <= to)
            })
            .collect();

        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = runs.len() as u64;

        if let (Some(limit), Some(offset)) = (query.limit, query.offset) {
            runs = runs
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .collect();
        }

        Ok(WorkflowRuns { runs, total })
    }

    async fn get_workflow_run_by_id(
        &self,
        run_id: &str,
        workflow_name: Option<&str>,
    ) -> Result<Option<WorkflowRunRecord>, RepositoryError> {
        Ok(self
            .records
            .iter()
            .find(|entry| {
                entry.run_id == run_id && workflow_name.is_none_or(|name| entry.workflow_name == name)
            })
            .map(|entry| entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::workflow::WorkflowRunStatus;

    fn snapshot(run_id: &str, status: WorkflowRunStatus) -> WorkflowRunSnapshot {
        WorkflowRunSnapshot {
            status,
            ..WorkflowRunSnapshot::pending(run_id, vec![])
        }
    }

    #[tokio::test]
    async fn persist_overwrites_and_keeps_created_at() {
        let store = InMemoryWorkflowStore::new();
        store
            .persist_workflow_snapshot("wf", "r1", Some("res"), &snapshot("r1", WorkflowRunStatus::Pending))
            .await
            .unwrap();
        let first = store.get_workflow_run_by_id("r1", Some("wf")).await.unwrap().unwrap();

        store
            .persist_workflow_snapshot("wf", "r1", None, &snapshot("r1", WorkflowRunStatus::Success))
            .await
            .unwrap();
        let second = store.get_workflow_run_by_id("r1", Some("wf")).await.unwrap().unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.snapshot.status, WorkflowRunStatus::Success);
        assert_eq!(second.resource_id.as_deref(), Some("res"));
    }

    #[tokio::test]
    async fn load_missing_snapshot_returns_none() {
        let store = InMemoryWorkflowStore::new();
        assert!(store.load_workflow_snapshot("wf", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn runs_are_filtered_sorted_and_paginated() {
        let store = InMemoryWorkflowStore::new();
        for (i, resource) in ["a", "b", "a"].iter().enumerate() {
            let run_id = format!("r{i}");
            store
                .persist_workflow_snapshot("wf", &run_id, Some(resource), &snapshot(&run_id, WorkflowRunStatus::Success))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        store
            .persist_workflow_snapshot("other", "x", None, &snapshot("x", WorkflowRunStatus::Success))
            .await
            .unwrap();

        let all = store
            .get_workflow_runs(&WorkflowRunsQuery {
                workflow_name: Some("wf".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.total, 3);
        let ids: Vec<&str> = all.runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, vec!["r2", "r1", "r0"]);

        let by_resource = store
            .get_workflow_runs(&WorkflowRunsQuery {
                resource_id: Some("a".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_resource.total, 2);

        let page = store
            .get_workflow_runs(&WorkflowRunsQuery {
                workflow_name: Some("wf".to_string()),
                limit: Some(1),
                offset: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.runs.len(), 1);
        assert_eq!(page.runs[0].run_id, "r1");

        let limit_only = store
            .get_workflow_runs(&WorkflowRunsQuery {
                workflow_name: Some("wf".to_string()),
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limit_only.runs.len(), 3);
    }

    #[tokio::test]
    async fn run_by_id_respects_workflow_scope() {
        let store = InMemoryWorkflowStore::new();
        store
            .persist_workflow_snapshot("wf", "r1", None, &snapshot("r1", WorkflowRunStatus::Pending))
            .await
            .unwrap();

        assert!(store.get_workflow_run_by_id("r1", None).await.unwrap().is_some());
        assert!(store.get_workflow_run_by_id("r1", Some("other")).await.unwrap().is_none());
    }
}
