use caw_core::error::{Error, Result};
use caw_core::events::{Event, EventType};
use caw_core::models::{
    AgentStatus, CheckpointType, ClaimOutcome, DependencyRef, JsonMap, NewCheckpoint, Task,
    TaskDependencies, TaskDetail, TaskReplanOutcome, TaskStatus,
};
use chrono::Utc;
use sqlx::{Row, SqliteConnection};

use crate::common::{
    db_err, db_parse, fetch_agent_opt, fetch_task, json_map_to_string, merge_json, row_to_task,
    task_is_blocked, TASK_COLUMNS,
};
use crate::store::Store;

/// Task-level mutations: lifecycle transitions, plans, claims, and
/// dependency queries.
#[derive(Clone)]
pub struct TaskService {
    store: Store,
}

impl TaskService {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }

    /// Fetch a task, optionally with its most recent checkpoints (returned
    /// in ascending sequence order).
    pub async fn get(
        &self,
        task_id: &str,
        include_checkpoints: bool,
        checkpoint_limit: Option<i64>,
    ) -> Result<TaskDetail> {
        let mut conn = self.store.pool().acquire().await.map_err(db_err)?;
        let task = fetch_task(&mut conn, task_id).await?;
        let checkpoints = if include_checkpoints {
            Some(
                crate::checkpoint::load_recent_checkpoints(&mut conn, task_id, checkpoint_limit)
                    .await?,
            )
        } else {
            None
        };
        Ok(TaskDetail { task, checkpoints })
    }

    /// True while any `blocks` predecessor is non-terminal
    pub async fn is_blocked(&self, task_id: &str) -> Result<bool> {
        let mut conn = self.store.pool().acquire().await.map_err(db_err)?;
        fetch_task(&mut conn, task_id).await?;
        task_is_blocked(&mut conn, task_id).await
    }

    /// Both directions of the task's dependency edges
    pub async fn get_dependencies(&self, task_id: &str) -> Result<TaskDependencies> {
        let mut conn = self.store.pool().acquire().await.map_err(db_err)?;
        fetch_task(&mut conn, task_id).await?;
        let dependencies = load_dependency_refs(
            &mut conn,
            "SELECT t.id, t.name, t.status, d.dependency_type
             FROM task_dependencies d JOIN tasks t ON t.id = d.depends_on_id
             WHERE d.task_id = ? ORDER BY t.sequence, t.name",
            task_id,
        )
        .await?;
        let dependents = load_dependency_refs(
            &mut conn,
            "SELECT t.id, t.name, t.status, d.dependency_type
             FROM task_dependencies d JOIN tasks t ON t.id = d.task_id
             WHERE d.depends_on_id = ? ORDER BY t.sequence, t.name",
            task_id,
        )
        .await?;
        Ok(TaskDependencies {
            dependencies,
            dependents,
        })
    }

    /// Transition a task per the lifecycle table with its guards: entering
    /// `planning` requires satisfied blockers, `completed` requires an
    /// outcome, `failed` requires an error. The owning agent is untouched;
    /// claim release is always explicit.
    pub async fn update_status(
        &self,
        task_id: &str,
        target: TaskStatus,
        outcome: Option<String>,
        error: Option<String>,
    ) -> Result<Task> {
        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        let mut task = fetch_task(&mut tx, task_id).await?;

        if !task.status.can_transition_to(target) {
            return Err(Error::invalid_transition(
                "task",
                task.status.as_str(),
                target.as_str(),
            ));
        }
        if target == TaskStatus::Planning
            && matches!(task.status, TaskStatus::Pending | TaskStatus::Blocked)
            && task_is_blocked(&mut tx, task_id).await?
        {
            return Err(Error::InvalidState(
                "task has incomplete blocking dependencies".to_string(),
            ));
        }
        if target == TaskStatus::Completed {
            match outcome {
                Some(outcome_text) => task.outcome = Some(outcome_text),
                None => {
                    return Err(Error::Validation(
                        "an outcome is required to complete a task".to_string(),
                    ))
                }
            }
        }
        if target == TaskStatus::Failed {
            match error {
                Some(error_text) => task.outcome_detail = Some(error_text),
                None => {
                    return Err(Error::Validation(
                        "an error is required to fail a task".to_string(),
                    ))
                }
            }
        }

        let now = Utc::now();
        sqlx::query(
            "UPDATE tasks SET status = ?, outcome = ?, outcome_detail = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(target.as_str())
        .bind(&task.outcome)
        .bind(&task.outcome_detail)
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        task.status = target;
        task.updated_at = now;
        self.emit_task_updated(&task);
        Ok(task)
    }

    /// Overwrite the task's plan; only valid while the task is `planning`.
    /// A supplied context shallow-merges into the existing one.
    pub async fn set_plan(
        &self,
        task_id: &str,
        plan: &str,
        context: Option<JsonMap>,
    ) -> Result<Task> {
        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        let mut task = fetch_task(&mut tx, task_id).await?;
        if task.status != TaskStatus::Planning {
            return Err(Error::InvalidState(format!(
                "cannot set a plan unless the task is planning (status: {})",
                task.status
            )));
        }

        task.plan = Some(plan.to_string());
        if let Some(patch) = &context {
            merge_json(&mut task.context, patch);
        }
        let now = Utc::now();
        sqlx::query("UPDATE tasks SET plan = ?, context = ?, updated_at = ? WHERE id = ?")
            .bind(&task.plan)
            .bind(json_map_to_string(&task.context))
            .bind(now)
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        task.updated_at = now;
        Ok(task)
    }

    /// Replan a failed or in-progress task: record a `replan` checkpoint,
    /// swap the plan in, clear the old outcome, and return it to `pending`.
    pub async fn replan(
        &self,
        task_id: &str,
        reason: &str,
        new_plan: &str,
    ) -> Result<TaskReplanOutcome> {
        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        let mut task = fetch_task(&mut tx, task_id).await?;
        if !matches!(task.status, TaskStatus::Failed | TaskStatus::InProgress) {
            return Err(Error::InvalidState(format!(
                "can only replan a failed or in-progress task (status: {})",
                task.status
            )));
        }

        let now = Utc::now();
        let checkpoint = crate::checkpoint::append_checkpoint_tx(
            &mut tx,
            task_id,
            &NewCheckpoint {
                checkpoint_type: CheckpointType::Replan,
                summary: reason.to_string(),
                detail: None,
                files_changed: None,
                tokens_used: None,
            },
        )
        .await?;

        sqlx::query(
            "UPDATE tasks SET status = ?, plan = ?, outcome = NULL, outcome_detail = NULL, \
             updated_at = ? WHERE id = ?",
        )
        .bind(TaskStatus::Pending.as_str())
        .bind(new_plan)
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        task.status = TaskStatus::Pending;
        task.plan = Some(new_plan.to_string());
        task.outcome = None;
        task.outcome_detail = None;
        task.updated_at = now;
        self.emit_task_updated(&task);
        Ok(TaskReplanOutcome {
            task,
            checkpoint_id: checkpoint.id,
        })
    }

    /// Claim a task exclusively for an agent.
    ///
    /// Idempotent for the current holder; a foreign holder is reported via
    /// `already_claimed_by` rather than an error so callers can pick other
    /// work. Claiming marks the agent busy on this task.
    pub async fn claim(&self, task_id: &str, agent_id: &str) -> Result<ClaimOutcome> {
        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        let mut task = fetch_task(&mut tx, task_id).await?;
        if task.status.is_terminal() {
            return Err(Error::InvalidState(format!(
                "cannot claim a task in terminal status {}",
                task.status
            )));
        }

        match task.assigned_agent_id.as_deref() {
            Some(holder) if holder == agent_id => {
                return Ok(ClaimOutcome {
                    success: true,
                    task: Some(task),
                    already_claimed_by: None,
                });
            }
            Some(holder) => {
                return Ok(ClaimOutcome {
                    success: false,
                    task: None,
                    already_claimed_by: Some(holder.to_string()),
                });
            }
            None => {}
        }

        let agent = fetch_agent_opt(&mut tx, agent_id)
            .await?
            .ok_or_else(|| Error::not_found("agent", agent_id))?;

        let now = Utc::now();
        sqlx::query("UPDATE tasks SET assigned_agent_id = ?, claimed_at = ?, updated_at = ? WHERE id = ?")
            .bind(agent_id)
            .bind(now)
            .bind(now)
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("UPDATE agents SET status = ?, current_task_id = ?, updated_at = ? WHERE id = ?")
            .bind(AgentStatus::Busy.as_str())
            .bind(task_id)
            .bind(now)
            .bind(&agent.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        task.assigned_agent_id = Some(agent_id.to_string());
        task.claimed_at = Some(now);
        task.updated_at = now;
        self.emit_task_updated(&task);
        tracing::info!(task_id, agent_id, "task claimed");
        Ok(ClaimOutcome {
            success: true,
            task: Some(task),
            already_claimed_by: None,
        })
    }

    /// Release a claim held by this agent and return the agent to `online`.
    pub async fn release(
        &self,
        task_id: &str,
        agent_id: &str,
        reason: Option<&str>,
    ) -> Result<Task> {
        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        let mut task = fetch_task(&mut tx, task_id).await?;
        match task.assigned_agent_id.as_deref() {
            Some(holder) if holder == agent_id => {}
            Some(holder) => {
                return Err(Error::InvalidState(format!(
                    "task is claimed by '{holder}', not '{agent_id}'"
                )));
            }
            None => {
                return Err(Error::InvalidState("task is not claimed".to_string()));
            }
        }

        let now = Utc::now();
        sqlx::query(
            "UPDATE tasks SET assigned_agent_id = NULL, claimed_at = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query(
            "UPDATE agents SET status = ?, current_task_id = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(AgentStatus::Online.as_str())
        .bind(now)
        .bind(agent_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        task.assigned_agent_id = None;
        task.claimed_at = None;
        task.updated_at = now;
        if let Some(reason_text) = reason {
            tracing::info!(task_id, agent_id, reason = reason_text, "task released");
        } else {
            tracing::info!(task_id, agent_id, "task released");
        }
        self.emit_task_updated(&task);
        Ok(task)
    }

    /// Pending, unclaimed, unblocked tasks ordered by (sequence, name)
    pub async fn get_available(
        &self,
        workflow_id: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<Task>> {
        let mut conn = self.store.pool().acquire().await.map_err(db_err)?;
        let mut sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks t \
             WHERE t.status = 'pending' AND t.assigned_agent_id IS NULL \
             AND NOT EXISTS (
                 SELECT 1 FROM task_dependencies d
                 JOIN tasks p ON p.id = d.depends_on_id
                 WHERE d.task_id = t.id AND d.dependency_type = 'blocks'
                   AND p.status NOT IN ('completed', 'skipped'))"
        );
        if workflow_id.is_some() {
            sql.push_str(" AND t.workflow_id = ?");
        }
        sql.push_str(" ORDER BY t.sequence, t.name");
        if limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(workflow_id) = workflow_id {
            query = query.bind(workflow_id);
        }
        if let Some(limit) = limit {
            query = query.bind(limit);
        }
        let rows = query.fetch_all(&mut *conn).await.map_err(db_err)?;
        rows.iter().map(row_to_task).collect()
    }

    fn emit_task_updated(&self, task: &Task) {
        self.store.events().emit(Event::new(
            EventType::TaskUpdated,
            serde_json::json!({
                "workflow_id": task.workflow_id,
                "task_id": task.id,
                "status": task.status.as_str(),
                "assigned_agent_id": task.assigned_agent_id,
            }),
        ));
    }
}

async fn load_dependency_refs(
    conn: &mut SqliteConnection,
    sql: &str,
    task_id: &str,
) -> Result<Vec<DependencyRef>> {
    let rows = sqlx::query(sql)
        .bind(task_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;
    rows.iter()
        .map(|row| {
            let status: String = row.get("status");
            let dependency_type: String = row.get("dependency_type");
            Ok(DependencyRef {
                task_id: row.get("id"),
                name: row.get("name"),
                status: db_parse(&status, "task status")?,
                dependency_type: db_parse(&dependency_type, "dependency type")?,
            })
        })
        .collect()
}
