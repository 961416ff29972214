use std::collections::{BTreeMap, HashMap, HashSet};

use caw_core::error::Result;
use caw_core::models::{
    BlockedTask, DependencyCheck, DependencyRef, DependencyType, NextTask, NextTasks,
    ParallelGroupProgress, Task, TaskStatus, WorkflowProgress,
};
use sqlx::Row;

use crate::common::{db_err, db_parse, fetch_task, fetch_workflow, load_blocking_edges, load_workflow_tasks};
use crate::store::Store;

/// The pull-based scheduler: agents ask "what's next?" and the service
/// answers from the current task graph. No background work is held here.
#[derive(Clone)]
pub struct OrchestrationService {
    store: Store,
}

impl OrchestrationService {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }

    /// Eligible tasks for execution, enriched for agent consumption.
    ///
    /// A task is eligible when its status matches (pending, plus failed /
    /// paused when requested), it is unclaimed, and every `blocks`
    /// predecessor is completed or skipped. Failed and paused predecessors
    /// still block their successors.
    pub async fn get_next_tasks(
        &self,
        workflow_id: &str,
        include_failed: bool,
        include_paused: bool,
    ) -> Result<NextTasks> {
        let mut conn = self.store.pool().acquire().await.map_err(db_err)?;
        let workflow = fetch_workflow(&mut conn, workflow_id).await?;
        let tasks = load_workflow_tasks(&mut conn, workflow_id).await?;
        let edges = load_blocking_edges(&mut conn, workflow_id).await?;

        let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
        let predecessors = |task: &Task| -> Vec<&Task> {
            edges
                .iter()
                .filter(|(task_id, _)| task_id == &task.id)
                .filter_map(|(_, dep_id)| by_id.get(dep_id.as_str()).copied())
                .collect()
        };

        let mut group_members: HashMap<&str, Vec<&str>> = HashMap::new();
        for task in &tasks {
            if let Some(group) = &task.parallel_group {
                group_members
                    .entry(group.as_str())
                    .or_default()
                    .push(task.id.as_str());
            }
        }

        let mut eligible_statuses: HashSet<TaskStatus> = HashSet::from([TaskStatus::Pending]);
        if include_failed {
            eligible_statuses.insert(TaskStatus::Failed);
        }
        if include_paused {
            eligible_statuses.insert(TaskStatus::Paused);
        }

        let mut next_tasks = Vec::new();
        for task in &tasks {
            if !eligible_statuses.contains(&task.status) || task.assigned_agent_id.is_some() {
                continue;
            }
            let preds = predecessors(task);
            if preds.iter().any(|p| !p.status.is_terminal()) {
                continue;
            }

            let parallel_with = task
                .parallel_group
                .as_ref()
                .and_then(|group| group_members.get(group.as_str()))
                .map(|members| {
                    members
                        .iter()
                        .filter(|id| **id != task.id)
                        .map(|id| id.to_string())
                        .collect()
                })
                .unwrap_or_default();
            let dependencies_completed = preds
                .iter()
                .filter(|p| p.status.is_terminal())
                .map(|p| p.name.clone())
                .collect();

            next_tasks.push(NextTask {
                task: task.clone(),
                can_parallelize: task.parallel_group.is_some(),
                parallel_with,
                dependencies_completed,
            });
        }

        let all_complete = tasks.iter().all(|t| t.status.is_terminal());
        let recommended_count = next_tasks.len().min(workflow.max_parallel_tasks as usize);
        Ok(NextTasks {
            tasks: next_tasks,
            max_parallel: workflow.max_parallel_tasks,
            recommended_count,
            workflow_status: workflow.status,
            all_complete,
        })
    }

    /// Aggregate progress over the workflow's task graph.
    pub async fn get_progress(&self, workflow_id: &str) -> Result<WorkflowProgress> {
        let mut conn = self.store.pool().acquire().await.map_err(db_err)?;
        fetch_workflow(&mut conn, workflow_id).await?;
        let tasks = load_workflow_tasks(&mut conn, workflow_id).await?;
        let edges = load_blocking_edges(&mut conn, workflow_id).await?;

        let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

        let mut by_status: BTreeMap<String, i64> = BTreeMap::new();
        for task in &tasks {
            *by_status.entry(task.status.as_str().to_string()).or_insert(0) += 1;
        }

        // Completed frontier: highest sequence with everything at or below
        // it in a terminal status. Tasks are already ordered by sequence.
        let mut completed_sequence = 0i64;
        for task in &tasks {
            if task.status.is_terminal() {
                completed_sequence = task.sequence;
            } else {
                break;
            }
        }

        let current_sequence = tasks
            .iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.sequence)
            .min()
            .unwrap_or(0);

        let mut blocked_tasks = Vec::new();
        for task in &tasks {
            if task.status.is_terminal() {
                continue;
            }
            let waiting_on: Vec<String> = edges
                .iter()
                .filter(|(task_id, _)| task_id == &task.id)
                .filter_map(|(_, dep_id)| by_id.get(dep_id.as_str()))
                .filter(|p| !p.status.is_terminal())
                .map(|p| p.name.clone())
                .collect();
            if !waiting_on.is_empty() {
                blocked_tasks.push(BlockedTask {
                    task_id: task.id.clone(),
                    name: task.name.clone(),
                    sequence: task.sequence,
                    waiting_on,
                });
            }
        }

        let mut parallel_groups: BTreeMap<String, ParallelGroupProgress> = BTreeMap::new();
        for task in &tasks {
            if let Some(group) = &task.parallel_group {
                let entry = parallel_groups
                    .entry(group.clone())
                    .or_insert(ParallelGroupProgress {
                        task_count: 0,
                        completed: 0,
                    });
                entry.task_count += 1;
                if task.status.is_terminal() {
                    entry.completed += 1;
                }
            }
        }

        let estimated_remaining = tasks.iter().filter(|t| !t.status.is_terminal()).count() as i64;

        Ok(WorkflowProgress {
            total_tasks: tasks.len() as i64,
            by_status,
            completed_sequence,
            current_sequence,
            blocked_tasks,
            parallel_groups,
            estimated_remaining,
        })
    }

    /// Partition a task's `blocks` predecessors into satisfied and pending.
    pub async fn check_dependencies(&self, task_id: &str) -> Result<DependencyCheck> {
        let mut conn = self.store.pool().acquire().await.map_err(db_err)?;
        fetch_task(&mut conn, task_id).await?;

        let rows = sqlx::query(
            "SELECT t.id, t.name, t.status
             FROM task_dependencies d JOIN tasks t ON t.id = d.depends_on_id
             WHERE d.task_id = ? AND d.dependency_type = 'blocks'
             ORDER BY t.sequence, t.name",
        )
        .bind(task_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;

        let mut pending = Vec::new();
        let mut completed = Vec::new();
        for row in &rows {
            let status: String = row.get("status");
            let reference = DependencyRef {
                task_id: row.get("id"),
                name: row.get("name"),
                status: db_parse(&status, "task status")?,
                dependency_type: DependencyType::Blocks,
            };
            if reference.status.is_terminal() {
                completed.push(reference);
            } else {
                pending.push(reference);
            }
        }

        Ok(DependencyCheck {
            satisfied: pending.is_empty(),
            pending,
            completed,
        })
    }

    /// The workflow's full `blocks` edge list with task names, for graph
    /// introspection over the HTTP surface.
    pub async fn get_workflow_dependencies(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<serde_json::Value>> {
        let mut conn = self.store.pool().acquire().await.map_err(db_err)?;
        fetch_workflow(&mut conn, workflow_id).await?;
        let rows = sqlx::query(
            "SELECT d.task_id, t.name AS task_name, d.depends_on_id, p.name AS depends_on_name, \
                    d.dependency_type
             FROM task_dependencies d
             JOIN tasks t ON t.id = d.task_id
             JOIN tasks p ON p.id = d.depends_on_id
             WHERE t.workflow_id = ?
             ORDER BY t.sequence, p.sequence",
        )
        .bind(workflow_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|row| {
                serde_json::json!({
                    "task_id": row.get::<String, _>("task_id"),
                    "task_name": row.get::<String, _>("task_name"),
                    "depends_on_id": row.get::<String, _>("depends_on_id"),
                    "depends_on_name": row.get::<String, _>("depends_on_name"),
                    "dependency_type": row.get::<String, _>("dependency_type"),
                })
            })
            .collect())
    }
}
