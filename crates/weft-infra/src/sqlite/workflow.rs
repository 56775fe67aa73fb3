//! SQLite snapshot store.
//!
//! Implements `WorkflowStore` from `weft-core` using sqlx with split
//! read/write pools. One row per `(workflow_name, run_id)`; the snapshot is
//! stored as a JSON blob and overwritten on every persist.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use weft_core::repository::workflow::WorkflowStore;
use weft_types::error::RepositoryError;
use weft_types::workflow::{WorkflowRunRecord, WorkflowRunSnapshot, WorkflowRuns, WorkflowRunsQuery};

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowStore`.
#[derive(Clone)]
pub struct SqliteWorkflowStore {
    pool: DatabasePool,
}

impl SqliteWorkflowStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

impl std::fmt::Debug for SqliteWorkflowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteWorkflowStore").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct SnapshotRow {
    workflow_name: String,
    run_id: String,
    resource_id: Option<String>,
    snapshot: String,
    created_at: String,
    updated_at: String,
}

impl SnapshotRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            workflow_name: row.try_get("workflow_name")?,
            run_id: row.try_get("run_id")?,
            resource_id: row.try_get("resource_id")?,
            snapshot: row.try_get("snapshot")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_record(self) -> Result<WorkflowRunRecord, RepositoryError> {
        Ok(WorkflowRunRecord {
            snapshot: parse_snapshot(&self.snapshot)?,
            workflow_name: self.workflow_name,
            run_id: self.run_id,
            resource_id: self.resource_id,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_snapshot(s: &str) -> Result<WorkflowRunSnapshot, RepositoryError> {
    serde_json::from_str(s)
        .map_err(|e| RepositoryError::Query(format!("invalid snapshot JSON: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width UTC timestamps so that text comparison orders chronologically.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn rows_to_records(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<WorkflowRunRecord>, RepositoryError> {
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let r = SnapshotRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
        records.push(r.into_record()?);
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// WorkflowStore impl
// ---------------------------------------------------------------------------

impl WorkflowStore for SqliteWorkflowStore {
    async fn persist_workflow_snapshot(
        &self,
        workflow_name: &str,
        run_id: &str,
        resource_id: Option<&str>,
        snapshot: &WorkflowRunSnapshot,
    ) -> Result<(), RepositoryError> {
        let snapshot_json = serde_json::to_string(snapshot)
            .map_err(|e| RepositoryError::Query(format!("serialize snapshot: {e}")))?;
        let now = format_datetime(&Utc::now());

        sqlx::query(
            r#"INSERT INTO workflow_snapshots
               (workflow_name, run_id, resource_id, status, snapshot, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(workflow_name, run_id) DO UPDATE SET
                 resource_id = COALESCE(excluded.resource_id, workflow_snapshots.resource_id),
                 status = excluded.status,
                 snapshot = excluded.snapshot,
                 updated_at = excluded.updated_at"#,
        )
        .bind(workflow_name)
        .bind(run_id)
        .bind(resource_id)
        .bind(snapshot.status.as_str())
        .bind(&snapshot_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tracing::debug!(
            workflow_name,
            run_id,
            status = %snapshot.status,
            "persisted workflow snapshot"
        );
        Ok(())
    }

    async fn load_workflow_snapshot(
        &self,
        workflow_name: &str,
        run_id: &str,
    ) -> Result<Option<WorkflowRunSnapshot>, RepositoryError> {
        let row = sqlx::query(
            "SELECT snapshot FROM workflow_snapshots WHERE workflow_name = ? AND run_id = ?",
        )
        .bind(workflow_name)
        .bind(run_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let snapshot: String = row
                    .try_get("snapshot")
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(parse_snapshot(&snapshot)?))
            }
            None => Ok(None),
        }
    }

    async fn get_workflow_runs(
        &self,
        query: &WorkflowRunsQuery,
    ) -> Result<WorkflowRuns, RepositoryError> {
        let mut conditions: Vec<&str> = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        if let Some(ref name) = query.workflow_name {
            conditions.push("workflow_name = ?");
            binds.push(name.clone());
        }
        if let Some(ref resource_id) = query.resource_id {
            conditions.push("resource_id = ?");
            binds.push(resource_id.clone());
        }
        if let Some(ref from) = query.from_date {
            conditions.push("created_at >= ?");
            binds.push(format_datetime(from));
        }
        if let Some(ref to) = query.to_date {
            conditions.push("created_at <= ?");
            binds.push(format_datetime(to));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let count_sql = format!("SELECT COUNT(*) FROM workflow_snapshots{where_clause}");
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        for value in &binds {
            count_query = count_query.bind(value);
        }
        let total = count_query
            .fetch_one(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut sql = format!(
            "SELECT * FROM workflow_snapshots{where_clause} ORDER BY created_at DESC, run_id DESC"
        );
        if let (Some(limit), Some(offset)) = (query.limit, query.offset) {
            sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}"));
        }

        let mut select = sqlx::query(&sql);
        for value in &binds {
            select = select.bind(value);
        }
        let rows = select
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(WorkflowRuns {
            runs: rows_to_records(&rows)?,
            total: total.max(0) as u64,
        })
    }

    async fn get_workflow_run_by_id(
        &self,
        run_id: &str,
        workflow_name: Option<&str>,
    ) -> Result<Option<WorkflowRunRecord>, RepositoryError> {
        let row = match workflow_name {
            Some(name) => {
                sqlx::query(
                    "SELECT * FROM workflow_snapshots WHERE run_id = ? AND workflow_name = ?",
                )
                .bind(run_id)
                .bind(name)
                .fetch_optional(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT * FROM workflow_snapshots WHERE run_id = ? ORDER BY updated_at DESC LIMIT 1",
                )
                .bind(run_id)
                .fetch_optional(&self.pool.reader)
                .await
            }
        }
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let r = SnapshotRow::from_row(&row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(r.into_record()?))
            }
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::DatabasePool;
    use serde_json::json;
    use weft_types::workflow::{StepResult, WorkflowRunStatus};

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    fn snapshot(run_id: &str, status: WorkflowRunStatus) -> WorkflowRunSnapshot {
        WorkflowRunSnapshot {
            status,
            ..WorkflowRunSnapshot::pending(run_id, vec![])
        }
    }

    #[tokio::test]
    async fn test_persist_and_load_snapshot() {
        let store = SqliteWorkflowStore::new(test_pool().await);
        let mut snap = snapshot("run-1", WorkflowRunStatus::Suspended);
        snap.context
            .steps
            .insert("approve".to_string(), StepResult::suspended(json!({"why": "review"})));
        snap.suspended_paths.insert("approve".to_string(), vec![0]);

        store
            .persist_workflow_snapshot("approval", "run-1", None, &snap)
            .await
            .unwrap();

        let loaded = store
            .load_workflow_snapshot("approval", "run-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, snap);
        assert!(
            store
                .load_workflow_snapshot("approval", "missing")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_persist_upsert_keeps_created_at_and_resource_id() {
        let store = SqliteWorkflowStore::new(test_pool().await);

        store
            .persist_workflow_snapshot(
                "wf",
                "run-1",
                Some("user-7"),
                &snapshot("run-1", WorkflowRunStatus::Pending),
            )
            .await
            .unwrap();
        let first = store.get_workflow_run_by_id("run-1", Some("wf")).await.unwrap().unwrap();

        store
            .persist_workflow_snapshot("wf", "run-1", None, &snapshot("run-1", WorkflowRunStatus::Success))
            .await
            .unwrap();
        let second = store.get_workflow_run_by_id("run-1", None).await.unwrap().unwrap();

        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(second.resource_id.as_deref(), Some("user-7"));
        assert_eq!(second.snapshot.status, WorkflowRunStatus::Success);

        let runs = store.get_workflow_runs(&WorkflowRunsQuery::default()).await.unwrap();
        assert_eq!(runs.total, 1);
    }

    #[tokio::test]
    async fn test_get_workflow_runs_filters_and_paginates() {
        let store = SqliteWorkflowStore::new(test_pool().await);
        for (name, run_id, resource) in [
            ("wf", "run-1", Some("a")),
            ("wf", "run-2", Some("b")),
            ("wf", "run-3", Some("a")),
            ("other", "run-4", None),
        ] {
            store
                .persist_workflow_snapshot(name, run_id, resource, &snapshot(run_id, WorkflowRunStatus::Success))
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let all = store
            .get_workflow_runs(&WorkflowRunsQuery {
                workflow_name: Some("wf".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.total, 3);
        let ids: Vec<&str> = all.runs.iter().map(|r| r.run_id.as_str()).collect();
        assert_eq!(ids, ["run-3", "run-2", "run-1"]);

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
        assert_eq!(page.runs[0].run_id, "run-2");

        // limit without offset does not paginate
        let unpaged = store
            .get_workflow_runs(&WorkflowRunsQuery {
                limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(unpaged.runs.len(), 4);

        let future = store
            .get_workflow_runs(&WorkflowRunsQuery {
                from_date: Some(Utc::now() + chrono::Duration::hours(1)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(future.total, 0);
    }

    #[tokio::test]
    async fn test_get_workflow_run_by_id_scoped_by_name() {
        let store = SqliteWorkflowStore::new(test_pool().await);
        store
            .persist_workflow_snapshot("wf", "run-1", None, &snapshot("run-1", WorkflowRunStatus::Failed))
            .await
            .unwrap();

        assert!(store.get_workflow_run_by_id("run-1", Some("other")).await.unwrap().is_none());
        let record = store.get_workflow_run_by_id("run-1", Some("wf")).await.unwrap().unwrap();
        assert_eq!(record.workflow_name, "wf");
        assert_eq!(record.snapshot.status, WorkflowRunStatus::Failed);
    }

    #[tokio::test]
    async fn test_store_backs_a_workflow_run() {
        use std::sync::Arc;
        use weft_core::repository::BoxWorkflowStore;
        use weft_core::workflow::{CreateRunOptions, StepOutcome, Workflow, create_step};

        let store = SqliteWorkflowStore::new(test_pool().await);
        let workflow = Workflow::new("sqlite-backed")
            .with_store(BoxWorkflowStore::new(store.clone()))
            .then(Arc::new(create_step("double", |ctx| async move {
                let n = ctx.input_data().as_i64().unwrap_or_default();
                Ok(StepOutcome::Success(json!(n * 2)))
            })))
            .commit()
            .unwrap();

        let run = workflow.create_run(CreateRunOptions::default()).await.unwrap();
        let result = run.start(json!(21), None).await.unwrap();
        assert_eq!(result.result(), Some(&json!(42)));

        let stored = store
            .load_workflow_snapshot("sqlite-backed", run.run_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, WorkflowRunStatus::Success);
        assert_eq!(stored.result, Some(json!(42)));
    }
}
