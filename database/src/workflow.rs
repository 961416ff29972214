use std::collections::{HashMap, HashSet};

use caw_core::error::{Error, Result};
use caw_core::events::{Event, EventType};
use caw_core::models::{
    AddTaskInput, CreateWorkflow, PlanApplied, RemoveTaskOutcome, ReplanOutcome, Repository,
    SummaryFormat, Task, TaskStatus, Workflow, WorkflowDetail, WorkflowFilter, WorkflowList,
    WorkflowStatus, WorkflowSummary, WorkflowSummaryDoc,
};
use caw_core::plan::{PlanInput, ReplanInput};
use caw_core::{ids, tokens, DependencyType, IdKind, Validate};
use chrono::Utc;
use serde_json::json;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};

use crate::common::{
    db_err, db_parse, ensure_repository, fetch_repository, fetch_workflow, insert_dependency,
    json_map_to_string, load_blocking_edges, load_workflow_tasks, resolve_task_ref,
    row_to_repository, REPOSITORY_COLUMNS,
};
use crate::store::Store;

/// Workflow CRUD, planning, re-planning, and summarising.
#[derive(Clone)]
pub struct WorkflowService {
    store: Store,
}

impl WorkflowService {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }

    /// Create a workflow in `planning`. Supplied repository paths are
    /// registered idempotently and joined to the workflow.
    pub async fn create(&self, input: CreateWorkflow) -> Result<Workflow> {
        Validate::non_empty("name", &input.name)?;
        Validate::non_empty("source_type", &input.source_type)?;
        Validate::max_parallel(input.max_parallel_tasks.unwrap_or(1))?;

        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        let workflow = create_workflow_tx(&mut tx, &input).await?;
        tx.commit().await.map_err(db_err)?;

        tracing::info!(workflow_id = %workflow.id, name = %workflow.name, "workflow created");
        Ok(workflow)
    }

    pub async fn get(&self, workflow_id: &str, include_tasks: bool) -> Result<WorkflowDetail> {
        let mut conn = self.store.pool().acquire().await.map_err(db_err)?;
        let workflow = fetch_workflow(&mut conn, workflow_id).await?;
        let tasks = if include_tasks {
            Some(load_workflow_tasks(&mut conn, workflow_id).await?)
        } else {
            None
        };
        Ok(WorkflowDetail { workflow, tasks })
    }

    /// Summary listing with a pre-pagination total. An explicit empty
    /// status set matches nothing.
    pub async fn list(&self, filter: WorkflowFilter) -> Result<WorkflowList> {
        if matches!(&filter.statuses, Some(statuses) if statuses.is_empty()) {
            return Ok(WorkflowList {
                workflows: Vec::new(),
                total: 0,
            });
        }
        let limit = filter.limit.unwrap_or(20).max(0);
        let offset = filter.offset.unwrap_or(0).max(0);

        let mut conn = self.store.pool().acquire().await.map_err(db_err)?;

        let mut count_builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) AS total FROM workflows w");
        push_workflow_filter(&mut count_builder, &filter);
        let total: i64 = count_builder
            .build()
            .fetch_one(&mut *conn)
            .await
            .map_err(db_err)?
            .get("total");

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT w.id, w.name, w.source_type, w.status, w.plan_summary, \
             w.max_parallel_tasks, w.created_at, w.updated_at, \
             (SELECT COUNT(*) FROM tasks t WHERE t.workflow_id = w.id) AS task_count, \
             (SELECT COUNT(*) FROM tasks t WHERE t.workflow_id = w.id \
              AND t.status IN ('completed', 'skipped')) AS completed_task_count \
             FROM workflows w",
        );
        push_workflow_filter(&mut builder, &filter);
        builder.push(" ORDER BY w.created_at DESC, w.id LIMIT ");
        builder.push_bind(limit);
        builder.push(" OFFSET ");
        builder.push_bind(offset);

        let rows = builder
            .build()
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)?;
        let workflows = rows
            .iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(WorkflowSummary {
                    id: row.get("id"),
                    name: row.get("name"),
                    source_type: row.get("source_type"),
                    status: db_parse(&status, "workflow status")?,
                    plan_summary: row.get("plan_summary"),
                    max_parallel_tasks: row.get("max_parallel_tasks"),
                    task_count: row.get("task_count"),
                    completed_task_count: row.get("completed_task_count"),
                    created_at: row.get("created_at"),
                    updated_at: row.get("updated_at"),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(WorkflowList { workflows, total })
    }

    /// Apply the initial plan and move the workflow to `ready`.
    pub async fn set_plan(&self, workflow_id: &str, plan: PlanInput) -> Result<PlanApplied> {
        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        let workflow = fetch_workflow(&mut tx, workflow_id).await?;
        let applied = apply_plan_tx(&mut tx, &workflow, &plan).await?;
        tx.commit().await.map_err(db_err)?;

        self.store.events().emit(Event::new(
            EventType::WorkflowStatus,
            json!({ "workflow_id": workflow_id, "status": WorkflowStatus::Ready.as_str() }),
        ));
        tracing::info!(
            workflow_id,
            tasks_created = applied.tasks_created,
            "plan applied"
        );
        Ok(applied)
    }

    /// Explicit status transition per the workflow lifecycle table.
    pub async fn update_status(
        &self,
        workflow_id: &str,
        status: WorkflowStatus,
        reason: Option<String>,
    ) -> Result<Workflow> {
        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        let mut workflow = fetch_workflow(&mut tx, workflow_id).await?;
        if !workflow.status.can_transition_to(status) {
            return Err(Error::invalid_transition(
                "workflow",
                workflow.status.as_str(),
                status.as_str(),
            ));
        }

        let now = Utc::now();
        if let Some(reason_text) = &reason {
            workflow
                .config
                .insert("last_status_reason".to_string(), json!(reason_text));
        }
        sqlx::query("UPDATE workflows SET status = ?, config = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(json_map_to_string(&workflow.config))
            .bind(now)
            .bind(workflow_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        workflow.status = status;
        workflow.updated_at = now;
        self.store.events().emit(Event::new(
            EventType::WorkflowStatus,
            json!({ "workflow_id": workflow_id, "status": status.as_str(), "reason": reason }),
        ));
        Ok(workflow)
    }

    /// Adjust the parallelism cap and optionally the workspace auto-create
    /// flag. No status restriction.
    pub async fn set_parallelism(
        &self,
        workflow_id: &str,
        max_parallel_tasks: i64,
        auto_create_workspaces: Option<bool>,
    ) -> Result<Workflow> {
        Validate::max_parallel(max_parallel_tasks)?;

        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        let mut workflow = fetch_workflow(&mut tx, workflow_id).await?;
        let now = Utc::now();
        workflow.max_parallel_tasks = max_parallel_tasks;
        if let Some(auto) = auto_create_workspaces {
            workflow.auto_create_workspaces = auto;
        }
        sqlx::query(
            "UPDATE workflows SET max_parallel_tasks = ?, auto_create_workspaces = ?, updated_at = ? WHERE id = ?",
        )
        .bind(workflow.max_parallel_tasks)
        .bind(workflow.auto_create_workspaces)
        .bind(now)
        .bind(workflow_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        workflow.updated_at = now;
        Ok(workflow)
    }

    /// Render a JSON or Markdown digest of the workflow for agent
    /// consumption, with its token estimate.
    pub async fn get_summary(
        &self,
        workflow_id: &str,
        format: SummaryFormat,
    ) -> Result<WorkflowSummaryDoc> {
        let mut conn = self.store.pool().acquire().await.map_err(db_err)?;
        let workflow = fetch_workflow(&mut conn, workflow_id).await?;
        let tasks = load_workflow_tasks(&mut conn, workflow_id).await?;
        let edges = load_blocking_edges(&mut conn, workflow_id).await?;

        let names: HashMap<&str, &str> = tasks
            .iter()
            .map(|t| (t.id.as_str(), t.name.as_str()))
            .collect();
        let depends_on = |task: &Task| -> Vec<&str> {
            edges
                .iter()
                .filter(|(task_id, _)| task_id == &task.id)
                .filter_map(|(_, dep_id)| names.get(dep_id.as_str()).copied())
                .collect()
        };

        let summary = match format {
            SummaryFormat::Json => {
                let doc = json!({
                    "id": workflow.id,
                    "name": workflow.name,
                    "status": workflow.status.as_str(),
                    "plan_summary": workflow.plan_summary,
                    "max_parallel_tasks": workflow.max_parallel_tasks,
                    "tasks": tasks.iter().map(|t| json!({
                        "name": t.name,
                        "sequence": t.sequence,
                        "status": t.status.as_str(),
                        "parallel_group": t.parallel_group,
                        "depends_on": depends_on(t),
                        "outcome": t.outcome,
                    })).collect::<Vec<_>>(),
                });
                serde_json::to_string_pretty(&doc)
                    .map_err(|e| Error::Database(format!("failed to render summary: {e}")))?
            }
            SummaryFormat::Markdown => {
                let mut out = format!("# Workflow: {}\n\n", workflow.name);
                out.push_str(&format!("Status: {}\n", workflow.status));
                if let Some(plan_summary) = &workflow.plan_summary {
                    out.push_str(&format!("\n{plan_summary}\n"));
                }
                out.push_str("\n## Tasks\n\n");
                for task in &tasks {
                    let mark = if task.status.is_terminal() { "x" } else { " " };
                    out.push_str(&format!(
                        "{}. [{}] {} ({})",
                        task.sequence, mark, task.name, task.status
                    ));
                    let deps = depends_on(task);
                    if !deps.is_empty() {
                        out.push_str(&format!(" [after: {}]", deps.join(", ")));
                    }
                    if let Some(group) = &task.parallel_group {
                        out.push_str(&format!(" [group: {group}]"));
                    }
                    out.push('\n');
                }
                out
            }
        };

        let token_estimate = tokens::estimate(&summary);
        Ok(WorkflowSummaryDoc {
            summary,
            token_estimate,
        })
    }

    /// Insert a task into an in-flight plan, rippling sequences when placed
    /// after an existing task.
    pub async fn add_task(&self, workflow_id: &str, input: AddTaskInput) -> Result<Task> {
        Validate::non_empty("task name", &input.name)?;

        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        let workflow = fetch_workflow(&mut tx, workflow_id).await?;
        if !matches!(
            workflow.status,
            WorkflowStatus::Ready | WorkflowStatus::InProgress | WorkflowStatus::Paused
        ) {
            return Err(Error::InvalidState(format!(
                "cannot add a task while the workflow is {}",
                workflow.status
            )));
        }

        let duplicate: bool = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM tasks WHERE workflow_id = ? AND name = ?) AS dup",
        )
        .bind(workflow_id)
        .bind(&input.name)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?
        .get("dup");
        if duplicate {
            return Err(Error::Validation(format!(
                "duplicate task name: '{}'",
                input.name
            )));
        }

        let now = Utc::now();
        let sequence = match &input.after_task {
            Some(reference) => {
                let after = resolve_task_ref(&mut tx, workflow_id, reference).await?;
                sqlx::query(
                    "UPDATE tasks SET sequence = sequence + 1, updated_at = ? \
                     WHERE workflow_id = ? AND sequence > ?",
                )
                .bind(now)
                .bind(workflow_id)
                .bind(after.sequence)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
                after.sequence + 1
            }
            None => {
                let max_sequence: i64 = sqlx::query(
                    "SELECT COALESCE(MAX(sequence), 0) AS max_sequence FROM tasks WHERE workflow_id = ?",
                )
                .bind(workflow_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?
                .get("max_sequence");
                max_sequence + 1
            }
        };

        let task = Task {
            id: ids::generate(IdKind::Task),
            workflow_id: workflow_id.to_string(),
            name: input.name.clone(),
            description: input.description.clone(),
            status: TaskStatus::Pending,
            sequence,
            parallel_group: input.parallel_group.clone(),
            assigned_agent_id: None,
            claimed_at: None,
            plan: None,
            outcome: None,
            outcome_detail: None,
            workspace_id: None,
            repository_id: None,
            context: input.context.clone().unwrap_or_default(),
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO tasks (id, workflow_id, name, description, status, sequence, \
             parallel_group, context, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task.id)
        .bind(&task.workflow_id)
        .bind(&task.name)
        .bind(&task.description)
        .bind(task.status.as_str())
        .bind(task.sequence)
        .bind(&task.parallel_group)
        .bind(json_map_to_string(&task.context))
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        // Dependencies may reference tasks by id or name; duplicates collapse.
        let mut seen = HashSet::new();
        for dep in &input.depends_on {
            if dep == &input.name || dep == &task.id {
                return Err(Error::Validation(format!(
                    "task '{}' cannot depend on itself",
                    input.name
                )));
            }
            let dep_task = resolve_task_ref(&mut tx, workflow_id, dep)
                .await
                .map_err(|e| match e {
                    Error::NotFound(_) => {
                        Error::Validation(format!("unknown dependency: '{dep}'"))
                    }
                    other => other,
                })?;
            if seen.insert(dep_task.id.clone()) {
                insert_dependency(&mut tx, &task.id, &dep_task.id, DependencyType::Blocks)
                    .await?;
            }
        }
        tx.commit().await.map_err(db_err)?;

        self.store.events().emit(Event::new(
            EventType::TaskUpdated,
            json!({ "workflow_id": workflow_id, "task_id": task.id, "status": task.status.as_str() }),
        ));
        Ok(task)
    }

    /// Remove an unstarted, unclaimed task, rewiring each successor onto
    /// every predecessor so the dependency chain stays intact.
    pub async fn remove_task(
        &self,
        workflow_id: &str,
        task_ref: &str,
    ) -> Result<RemoveTaskOutcome> {
        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        fetch_workflow(&mut tx, workflow_id).await?;
        let task = resolve_task_ref(&mut tx, workflow_id, task_ref).await?;

        if !matches!(
            task.status,
            TaskStatus::Pending | TaskStatus::Blocked | TaskStatus::Planning
        ) {
            return Err(Error::InvalidState(format!(
                "cannot remove task in status {}",
                task.status
            )));
        }
        if task.assigned_agent_id.is_some() {
            return Err(Error::InvalidState(
                "cannot remove a claimed task".to_string(),
            ));
        }

        let predecessors: Vec<String> = sqlx::query(
            "SELECT depends_on_id FROM task_dependencies \
             WHERE task_id = ? AND dependency_type = 'blocks'",
        )
        .bind(&task.id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?
        .iter()
        .map(|row| row.get("depends_on_id"))
        .collect();
        let successors: Vec<String> = sqlx::query(
            "SELECT task_id FROM task_dependencies \
             WHERE depends_on_id = ? AND dependency_type = 'blocks'",
        )
        .bind(&task.id)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?
        .iter()
        .map(|row| row.get("task_id"))
        .collect();

        let mut dependencies_rewired = 0usize;
        for successor in &successors {
            for predecessor in &predecessors {
                if successor != predecessor
                    && insert_dependency(&mut tx, successor, predecessor, DependencyType::Blocks)
                        .await?
                {
                    dependencies_rewired += 1;
                }
            }
        }

        // Incident edges and checkpoints go with the task row.
        sqlx::query("DELETE FROM task_dependencies WHERE task_id = ? OR depends_on_id = ?")
            .bind(&task.id)
            .bind(&task.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM checkpoints WHERE task_id = ?")
            .bind(&task.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(&task.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        let renumbered = sqlx::query(
            "UPDATE tasks SET sequence = sequence - 1, updated_at = ? \
             WHERE workflow_id = ? AND sequence > ?",
        )
        .bind(Utc::now())
        .bind(workflow_id)
        .bind(task.sequence)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();
        tx.commit().await.map_err(db_err)?;

        Ok(RemoveTaskOutcome {
            removed_task_id: task.id,
            dependencies_rewired,
            tasks_renumbered: renumbered as usize,
        })
    }

    /// Replace the removable part of an in-flight plan while preserving
    /// terminal and claimed tasks.
    ///
    /// Preserved sequences are compacted to 1..P before the new tasks are
    /// appended, keeping sequences contiguous.
    pub async fn replan(&self, workflow_id: &str, input: ReplanInput) -> Result<ReplanOutcome> {
        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        let workflow = fetch_workflow(&mut tx, workflow_id).await?;
        if workflow.status == WorkflowStatus::Planning {
            return Err(Error::InvalidState(
                "workflow is still planning; apply a plan instead of replanning".to_string(),
            ));
        }
        if workflow.status.is_terminal() {
            return Err(Error::InvalidState(format!(
                "cannot replan a {} workflow",
                workflow.status
            )));
        }
        Validate::plan_tasks(&input.tasks)?;

        let tasks = load_workflow_tasks(&mut tx, workflow_id).await?;
        let (preserved, removable): (Vec<&Task>, Vec<&Task>) = tasks.iter().partition(|t| {
            !matches!(
                t.status,
                TaskStatus::Pending | TaskStatus::Blocked | TaskStatus::Planning
            ) || t.assigned_agent_id.is_some()
        });

        let preserved_names: HashSet<&str> =
            preserved.iter().map(|t| t.name.as_str()).collect();
        for new_task in &input.tasks {
            if preserved_names.contains(new_task.name.as_str()) {
                return Err(Error::Validation(format!(
                    "task name collides with a preserved task: '{}'",
                    new_task.name
                )));
            }
        }

        for task in &removable {
            sqlx::query("DELETE FROM tasks WHERE id = ?")
                .bind(&task.id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        let now = Utc::now();
        let mut next_sequence = 0i64;
        for task in &preserved {
            next_sequence += 1;
            if task.sequence != next_sequence {
                sqlx::query("UPDATE tasks SET sequence = ?, updated_at = ? WHERE id = ?")
                    .bind(next_sequence)
                    .bind(now)
                    .bind(&task.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?;
            }
        }

        let mut name_to_id: HashMap<String, String> = preserved
            .iter()
            .map(|t| (t.name.clone(), t.id.clone()))
            .collect();
        let preserved_ids: HashSet<&str> = preserved.iter().map(|t| t.id.as_str()).collect();

        for new_task in &input.tasks {
            next_sequence += 1;
            let task_id = ids::generate(IdKind::Task);
            sqlx::query(
                "INSERT INTO tasks (id, workflow_id, name, description, status, sequence, \
                 parallel_group, context, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&task_id)
            .bind(workflow_id)
            .bind(&new_task.name)
            .bind(&new_task.description)
            .bind(TaskStatus::Pending.as_str())
            .bind(next_sequence)
            .bind(&new_task.parallel_group)
            .bind(json_map_to_string(&new_task.context.clone().unwrap_or_default()))
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            name_to_id.insert(new_task.name.clone(), task_id);
        }

        // Dependency names resolve against preserved plus new tasks; a bare
        // task id is accepted when it names a preserved task.
        for new_task in &input.tasks {
            let task_id = name_to_id[&new_task.name].clone();
            let mut seen = HashSet::new();
            for dep in &new_task.depends_on {
                let dep_id = if let Some(id) = name_to_id.get(dep) {
                    id.clone()
                } else if preserved_ids.contains(dep.as_str()) {
                    dep.clone()
                } else {
                    return Err(Error::Validation(format!("unknown dependency: '{dep}'")));
                };
                if dep_id == task_id {
                    return Err(Error::Validation(format!(
                        "task '{}' cannot depend on itself",
                        new_task.name
                    )));
                }
                if seen.insert(dep_id.clone()) {
                    insert_dependency(&mut tx, &task_id, &dep_id, DependencyType::Blocks)
                        .await?;
                }
            }
        }
        let edges = load_blocking_edges(&mut tx, workflow_id).await?;
        Validate::acyclic(&edges)?;

        let mut config = workflow.config.clone();
        let history = config
            .entry("replan_history".to_string())
            .or_insert_with(|| json!([]));
        if let Some(entries) = history.as_array_mut() {
            entries.push(json!({
                "summary": input.summary,
                "reason": input.reason,
                "timestamp": now.to_rfc3339(),
            }));
        }
        sqlx::query("UPDATE workflows SET plan_summary = ?, config = ?, updated_at = ? WHERE id = ?")
            .bind(&input.summary)
            .bind(json_map_to_string(&config))
            .bind(now)
            .bind(workflow_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        tracing::info!(
            workflow_id,
            added = input.tasks.len(),
            removed = removable.len(),
            preserved = preserved.len(),
            reason = %input.reason,
            "workflow replanned"
        );
        Ok(ReplanOutcome {
            tasks_added: input.tasks.len(),
            tasks_removed: removable.len(),
            tasks_preserved: preserved.len(),
            new_status: workflow.status,
        })
    }

    /// Join a repository (registered idempotently by path) to the workflow.
    pub async fn add_repository(&self, workflow_id: &str, path: &str) -> Result<Repository> {
        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        fetch_workflow(&mut tx, workflow_id).await?;
        let repository = ensure_repository(&mut tx, path).await?;
        sqlx::query(
            "INSERT OR IGNORE INTO workflow_repositories (workflow_id, repository_id, added_at) \
             VALUES (?, ?, ?)",
        )
        .bind(workflow_id)
        .bind(&repository.id)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(repository)
    }

    /// Detach a repository. Fails while any task or workspace of the
    /// workflow still references it.
    pub async fn remove_repository(&self, workflow_id: &str, repository_id: &str) -> Result<()> {
        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        fetch_workflow(&mut tx, workflow_id).await?;
        fetch_repository(&mut tx, repository_id).await?;

        let in_use: bool = sqlx::query(
            "SELECT EXISTS(
                 SELECT 1 FROM tasks WHERE workflow_id = ? AND repository_id = ?
                 UNION ALL
                 SELECT 1 FROM workspaces WHERE workflow_id = ? AND repository_id = ?
             ) AS in_use",
        )
        .bind(workflow_id)
        .bind(repository_id)
        .bind(workflow_id)
        .bind(repository_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?
        .get("in_use");
        if in_use {
            return Err(Error::InvalidState(
                "repository is still referenced by tasks or workspaces".to_string(),
            ));
        }

        let removed = sqlx::query(
            "DELETE FROM workflow_repositories WHERE workflow_id = ? AND repository_id = ?",
        )
        .bind(workflow_id)
        .bind(repository_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();
        if removed == 0 {
            return Err(Error::NotFound(format!(
                "repository '{repository_id}' is not joined to workflow '{workflow_id}'"
            )));
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    pub async fn list_repositories(&self, workflow_id: &str) -> Result<Vec<Repository>> {
        let mut conn = self.store.pool().acquire().await.map_err(db_err)?;
        fetch_workflow(&mut conn, workflow_id).await?;
        let sql = format!(
            "SELECT {REPOSITORY_COLUMNS} FROM repositories r \
             JOIN workflow_repositories wr ON wr.repository_id = r.id \
             WHERE wr.workflow_id = ? ORDER BY wr.added_at"
        );
        let rows = sqlx::query(&sql)
            .bind(workflow_id)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_repository).collect()
    }
}

fn push_workflow_filter(builder: &mut QueryBuilder<Sqlite>, filter: &WorkflowFilter) {
    if let Some(repository_id) = &filter.repository_id {
        builder.push(
            " JOIN workflow_repositories wr ON wr.workflow_id = w.id AND wr.repository_id = ",
        );
        builder.push_bind(repository_id.clone());
    }
    if let Some(statuses) = &filter.statuses {
        if !statuses.is_empty() {
            builder.push(" WHERE w.status IN (");
            let mut separated = builder.separated(", ");
            for status in statuses {
                separated.push_bind(status.as_str());
            }
            builder.push(")");
        }
    }
}

/// Insert a workflow row (plus repository joins) inside an open transaction.
/// Shared with the template engine's apply.
pub(crate) async fn create_workflow_tx(
    conn: &mut SqliteConnection,
    input: &CreateWorkflow,
) -> Result<Workflow> {
    let now = Utc::now();
    let workflow = Workflow {
        id: ids::generate(IdKind::Workflow),
        name: input.name.clone(),
        source_type: input.source_type.clone(),
        source_ref: input.source_ref.clone(),
        source_content: input.source_content.clone(),
        status: WorkflowStatus::Planning,
        plan_summary: None,
        initial_plan: None,
        max_parallel_tasks: input.max_parallel_tasks.unwrap_or(1),
        auto_create_workspaces: input.auto_create_workspaces.unwrap_or(false),
        config: input.config.clone().unwrap_or_default(),
        locked_by_session_id: None,
        locked_at: None,
        created_at: now,
        updated_at: now,
    };

    sqlx::query(
        "INSERT INTO workflows (id, name, source_type, source_ref, source_content, status, \
         max_parallel_tasks, auto_create_workspaces, config, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&workflow.id)
    .bind(&workflow.name)
    .bind(&workflow.source_type)
    .bind(&workflow.source_ref)
    .bind(&workflow.source_content)
    .bind(workflow.status.as_str())
    .bind(workflow.max_parallel_tasks)
    .bind(workflow.auto_create_workspaces)
    .bind(json_map_to_string(&workflow.config))
    .bind(workflow.created_at)
    .bind(workflow.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    for path in &input.repository_paths {
        let repository = ensure_repository(conn, path).await?;
        sqlx::query(
            "INSERT OR IGNORE INTO workflow_repositories (workflow_id, repository_id, added_at) \
             VALUES (?, ?, ?)",
        )
        .bind(&workflow.id)
        .bind(&repository.id)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;
    }

    Ok(workflow)
}

/// Apply a plan to a `planning` workflow inside an open transaction:
/// insert tasks at sequence 1..N, bind `depends_on` names to `blocks`
/// edges, snapshot the plan, and move the workflow to `ready`. Shared with
/// the template engine's apply.
pub(crate) async fn apply_plan_tx(
    conn: &mut SqliteConnection,
    workflow: &Workflow,
    plan: &PlanInput,
) -> Result<PlanApplied> {
    if workflow.status != WorkflowStatus::Planning {
        return Err(Error::InvalidState(format!(
            "cannot set plan unless the workflow is planning (status: {})",
            workflow.status
        )));
    }
    Validate::plan_tasks(&plan.tasks)?;

    let now = Utc::now();
    let mut name_to_id: HashMap<String, String> = HashMap::new();
    let mut parallelizable_groups: Vec<String> = Vec::new();

    for (index, task) in plan.tasks.iter().enumerate() {
        let task_id = ids::generate(IdKind::Task);
        sqlx::query(
            "INSERT INTO tasks (id, workflow_id, name, description, status, sequence, \
             parallel_group, context, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&task_id)
        .bind(&workflow.id)
        .bind(&task.name)
        .bind(&task.description)
        .bind(TaskStatus::Pending.as_str())
        .bind((index + 1) as i64)
        .bind(&task.parallel_group)
        .bind(json_map_to_string(&task.context.clone().unwrap_or_default()))
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(db_err)?;

        if let Some(group) = &task.parallel_group {
            if !parallelizable_groups.contains(group) {
                parallelizable_groups.push(group.clone());
            }
        }
        name_to_id.insert(task.name.clone(), task_id);
    }

    let mut edges: Vec<(String, String)> = Vec::new();
    for task in &plan.tasks {
        let task_id = name_to_id[&task.name].clone();
        let mut seen = HashSet::new();
        for dep in &task.depends_on {
            let dep_id = name_to_id
                .get(dep)
                .cloned()
                .ok_or_else(|| Error::Validation(format!("unknown dependency name: '{dep}'")))?;
            if seen.insert(dep_id.clone()) {
                insert_dependency(conn, &task_id, &dep_id, DependencyType::Blocks).await?;
                edges.push((task_id.clone(), dep_id));
            }
        }
    }
    Validate::acyclic(&edges)?;

    let initial_plan = serde_json::to_string(plan)
        .map_err(|e| Error::Database(format!("failed to serialize plan: {e}")))?;
    sqlx::query(
        "UPDATE workflows SET status = ?, plan_summary = ?, initial_plan = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(WorkflowStatus::Ready.as_str())
    .bind(&plan.summary)
    .bind(&initial_plan)
    .bind(now)
    .bind(&workflow.id)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    Ok(PlanApplied {
        tasks_created: plan.tasks.len(),
        parallelizable_groups,
        status: WorkflowStatus::Ready,
    })
}
