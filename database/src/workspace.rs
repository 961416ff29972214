use caw_core::error::{Error, Result};
use caw_core::models::{NewWorkspace, Task, Workspace, WorkspaceStatus, WorkspaceUpdate};
use caw_core::{ids, IdKind, Validate};
use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite};

use crate::common::{
    db_err, ensure_repository, fetch_repository, fetch_task, fetch_workflow, fetch_workspace,
    json_map_to_string, merge_json, row_to_workspace, WORKSPACE_COLUMNS,
};
use crate::store::Store;

/// Branch-scoped working areas tasks check their changes into.
#[derive(Clone)]
pub struct WorkspaceService {
    store: Store,
}

impl WorkspaceService {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }

    /// Create an active workspace, optionally assigning tasks to it. A
    /// repository may be referenced by id or registered idempotently by
    /// path. A missing task aborts the whole creation.
    pub async fn create(&self, input: NewWorkspace) -> Result<Workspace> {
        Validate::non_empty("path", &input.path)?;
        Validate::non_empty("branch", &input.branch)?;

        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        fetch_workflow(&mut tx, &input.workflow_id).await?;

        let repository_id = match (&input.repository_id, &input.repository_path) {
            (Some(repository_id), _) => {
                Some(fetch_repository(&mut tx, repository_id).await?.id)
            }
            (None, Some(path)) => Some(ensure_repository(&mut tx, path).await?.id),
            (None, None) => None,
        };

        let now = Utc::now();
        let workspace = Workspace {
            id: ids::generate(IdKind::Workspace),
            workflow_id: input.workflow_id.clone(),
            repository_id,
            path: input.path.clone(),
            branch: input.branch.clone(),
            base_branch: input.base_branch.clone().unwrap_or_else(|| "main".to_string()),
            status: WorkspaceStatus::Active,
            merge_commit: None,
            pr_url: None,
            config: input.config.clone().unwrap_or_default(),
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO workspaces (id, workflow_id, repository_id, path, branch, base_branch, \
             status, config, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&workspace.id)
        .bind(&workspace.workflow_id)
        .bind(&workspace.repository_id)
        .bind(&workspace.path)
        .bind(&workspace.branch)
        .bind(&workspace.base_branch)
        .bind(workspace.status.as_str())
        .bind(json_map_to_string(&workspace.config))
        .bind(workspace.created_at)
        .bind(workspace.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for task_id in &input.task_ids {
            let task = fetch_task(&mut tx, task_id).await?;
            if task.workflow_id != input.workflow_id {
                return Err(Error::Validation(format!(
                    "task '{task_id}' belongs to a different workflow"
                )));
            }
            assign_workspace_tx(&mut tx, &task, &workspace.id).await?;
        }
        tx.commit().await.map_err(db_err)?;

        tracing::info!(
            workspace_id = %workspace.id,
            workflow_id = %workspace.workflow_id,
            branch = %workspace.branch,
            "workspace created"
        );
        Ok(workspace)
    }

    /// Partial update. Transitioning to `merged` requires a merge commit,
    /// either already recorded or supplied in the same call.
    pub async fn update(&self, workspace_id: &str, update: WorkspaceUpdate) -> Result<Workspace> {
        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        let mut workspace = fetch_workspace(&mut tx, workspace_id).await?;

        if let Some(merge_commit) = &update.merge_commit {
            workspace.merge_commit = Some(merge_commit.clone());
        }
        if let Some(pr_url) = &update.pr_url {
            workspace.pr_url = Some(pr_url.clone());
        }
        if let Some(patch) = &update.config {
            merge_json(&mut workspace.config, patch);
        }
        if let Some(status) = update.status {
            if !workspace.status.can_transition_to(status) {
                return Err(Error::invalid_transition(
                    "workspace",
                    workspace.status.as_str(),
                    status.as_str(),
                ));
            }
            if status == WorkspaceStatus::Merged && workspace.merge_commit.is_none() {
                return Err(Error::Validation(
                    "a merge commit is required to mark a workspace merged".to_string(),
                ));
            }
            workspace.status = status;
        }

        let now = Utc::now();
        sqlx::query(
            "UPDATE workspaces SET status = ?, merge_commit = ?, pr_url = ?, config = ?, \
             updated_at = ? WHERE id = ?",
        )
        .bind(workspace.status.as_str())
        .bind(&workspace.merge_commit)
        .bind(&workspace.pr_url)
        .bind(json_map_to_string(&workspace.config))
        .bind(now)
        .bind(workspace_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        workspace.updated_at = now;
        Ok(workspace)
    }

    /// Point a task at an active workspace
    pub async fn assign_task(&self, task_id: &str, workspace_id: &str) -> Result<Task> {
        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        let workspace = fetch_workspace(&mut tx, workspace_id).await?;
        if workspace.status != WorkspaceStatus::Active {
            return Err(Error::InvalidState(format!(
                "cannot assign tasks to a {} workspace",
                workspace.status.as_str()
            )));
        }
        let mut task = fetch_task(&mut tx, task_id).await?;
        assign_workspace_tx(&mut tx, &task, workspace_id).await?;
        tx.commit().await.map_err(db_err)?;

        task.workspace_id = Some(workspace_id.to_string());
        Ok(task)
    }

    /// Workspaces of a workflow, oldest first; status may be one value or a
    /// set (an explicit empty set matches nothing).
    pub async fn list(
        &self,
        workflow_id: &str,
        status: Option<&[WorkspaceStatus]>,
    ) -> Result<Vec<Workspace>> {
        if matches!(status, Some(statuses) if statuses.is_empty()) {
            return Ok(Vec::new());
        }

        let mut conn = self.store.pool().acquire().await.map_err(db_err)?;
        fetch_workflow(&mut conn, workflow_id).await?;

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {WORKSPACE_COLUMNS} FROM workspaces WHERE workflow_id = "
        ));
        builder.push_bind(workflow_id);
        if let Some(statuses) = status {
            builder.push(" AND status IN (");
            let mut separated = builder.separated(", ");
            for workspace_status in statuses {
                separated.push_bind(workspace_status.as_str());
            }
            builder.push(")");
        }
        builder.push(" ORDER BY created_at, id");

        let rows = builder
            .build()
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_workspace).collect()
    }
}

async fn assign_workspace_tx(
    conn: &mut sqlx::SqliteConnection,
    task: &Task,
    workspace_id: &str,
) -> Result<()> {
    sqlx::query("UPDATE tasks SET workspace_id = ?, updated_at = ? WHERE id = ?")
        .bind(workspace_id)
        .bind(Utc::now())
        .bind(&task.id)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    Ok(())
}
