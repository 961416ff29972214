use caw_core::error::Result;
use caw_core::models::{
    ContextOptions, DependencyOutcome, PriorTaskContext, SiblingTaskContext, TaskContext,
    TaskDetail, TaskStatus, WorkflowContext,
};
use caw_core::tokens;

use crate::common::{db_err, fetch_task, fetch_workflow, load_blocking_edges, load_workflow_tasks};
use crate::store::Store;

/// How many trailing checkpoints keep their detail under compression
const DETAILED_CHECKPOINT_WINDOW: usize = 5;

/// Assembles a token-bounded context bundle for an agent opening a task.
///
/// Compression order is deliberately coarse: old checkpoint detail is
/// stripped first, then the workflow source summary is truncated.
#[derive(Clone)]
pub struct ContextLoader {
    store: Store,
}

impl ContextLoader {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn load(&self, task_id: &str, options: ContextOptions) -> Result<TaskContext> {
        let mut conn = self.store.pool().acquire().await.map_err(db_err)?;
        let task = fetch_task(&mut conn, task_id).await?;
        let workflow = fetch_workflow(&mut conn, &task.workflow_id).await?;
        let all_tasks = load_workflow_tasks(&mut conn, &task.workflow_id).await?;
        let edges = load_blocking_edges(&mut conn, &task.workflow_id).await?;
        let include = &options.include;

        let workflow_section = include.workflow.then(|| WorkflowContext {
            id: workflow.id.clone(),
            name: workflow.name.clone(),
            status: workflow.status,
            source_summary: workflow.source_content.clone(),
            plan_summary: workflow.plan_summary.clone(),
        });

        let current_task = if include.current_task {
            let checkpoints =
                crate::checkpoint::load_recent_checkpoints(&mut conn, task_id, None).await?;
            Some(TaskDetail {
                task: task.clone(),
                checkpoints: Some(checkpoints),
            })
        } else {
            None
        };

        let prior_tasks = include.prior_tasks.then(|| {
            all_tasks
                .iter()
                .filter(|t| t.id != task.id && t.status == TaskStatus::Completed)
                .map(|t| PriorTaskContext {
                    task_id: t.id.clone(),
                    name: t.name.clone(),
                    sequence: t.sequence,
                    outcome: t.outcome.clone(),
                })
                .collect::<Vec<_>>()
        });

        // Sibling section is undefined (not empty) for ungrouped tasks.
        let sibling_tasks = match (&task.parallel_group, include.siblings) {
            (Some(group), true) => Some(
                all_tasks
                    .iter()
                    .filter(|t| t.id != task.id && t.parallel_group.as_ref() == Some(group))
                    .map(|t| SiblingTaskContext {
                        task_id: t.id.clone(),
                        name: t.name.clone(),
                        status: t.status,
                        assigned_agent_id: t.assigned_agent_id.clone(),
                    })
                    .collect::<Vec<_>>(),
            ),
            _ => None,
        };

        let dependency_outcomes = include.dependencies.then(|| {
            edges
                .iter()
                .filter(|(task_edge_id, _)| task_edge_id == &task.id)
                .filter_map(|(_, dep_id)| all_tasks.iter().find(|t| &t.id == dep_id))
                .filter(|t| t.status == TaskStatus::Completed)
                .map(|t| DependencyOutcome {
                    task_id: t.id.clone(),
                    name: t.name.clone(),
                    outcome: t.outcome.clone(),
                })
                .collect::<Vec<_>>()
        });

        let mut context = TaskContext {
            workflow: workflow_section,
            current_task,
            prior_tasks,
            sibling_tasks,
            dependency_outcomes,
            token_estimate: 0,
        };

        compress_to_budget(&mut context, options.max_tokens, include.all_checkpoints);
        context.token_estimate = estimate(&context);
        Ok(context)
    }
}

fn section_estimate<T: serde::Serialize>(section: &Option<T>) -> usize {
    section
        .as_ref()
        .and_then(|value| serde_json::to_string(value).ok())
        .map(|rendered| tokens::estimate(&rendered))
        .unwrap_or(0)
}

fn estimate(context: &TaskContext) -> usize {
    section_estimate(&context.workflow)
        + section_estimate(&context.current_task)
        + section_estimate(&context.prior_tasks)
        + section_estimate(&context.sibling_tasks)
        + section_estimate(&context.dependency_outcomes)
}

/// Shrink the bundle toward `max_tokens`: first drop detail from old
/// checkpoints (all but the trailing window), then truncate the source
/// summary to whatever budget remains.
fn compress_to_budget(context: &mut TaskContext, max_tokens: usize, keep_all_checkpoints: bool) {
    if estimate(context) <= max_tokens {
        return;
    }

    if !keep_all_checkpoints {
        if let Some(current) = &mut context.current_task {
            if let Some(checkpoints) = &mut current.checkpoints {
                let total = checkpoints.len();
                let keep_from = total.saturating_sub(DETAILED_CHECKPOINT_WINDOW);
                for checkpoint in checkpoints.iter_mut().take(keep_from) {
                    checkpoint.detail = None;
                }
            }
        }
    }

    let total = estimate(context);
    if total <= max_tokens {
        return;
    }

    if let Some(workflow) = &mut context.workflow {
        if let Some(source) = &workflow.source_summary {
            let source_tokens = tokens::estimate(source);
            let rest = total.saturating_sub(source_tokens);
            let budget = max_tokens.saturating_sub(rest);
            workflow.source_summary = Some(tokens::truncate_to_tokens(source, budget));
        }
    }
}
