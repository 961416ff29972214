#![allow(dead_code)]

use caw_core::models::{CreateWorkflow, NewAgent, TaskStatus, Workflow};
use caw_core::plan::{PlanInput, PlanTask};
use caw_database::Store;

/// Fresh in-memory store with the schema applied
pub async fn test_store() -> Store {
    let store = Store::connect(":memory:").await.expect("in-memory store");
    store.migrate().await.expect("migrations apply");
    store
}

pub fn plan_task(name: &str, depends_on: &[&str]) -> PlanTask {
    PlanTask {
        name: name.to_string(),
        description: format!("{name} description"),
        parallel_group: None,
        depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        context: None,
    }
}

pub fn grouped_task(name: &str, group: &str) -> PlanTask {
    PlanTask {
        parallel_group: Some(group.to_string()),
        ..plan_task(name, &[])
    }
}

pub fn plan(summary: &str, tasks: Vec<PlanTask>) -> PlanInput {
    PlanInput {
        summary: summary.to_string(),
        tasks,
    }
}

pub async fn create_workflow(store: &Store, name: &str) -> Workflow {
    store
        .workflows()
        .create(CreateWorkflow {
            name: name.to_string(),
            source_type: "issue".to_string(),
            ..Default::default()
        })
        .await
        .expect("workflow created")
}

pub async fn register_agent(store: &Store, name: &str) -> caw_core::models::Agent {
    store
        .agents()
        .register(NewAgent {
            name: name.to_string(),
            runtime: "claude-code".to_string(),
            ..Default::default()
        })
        .await
        .expect("agent registered")
}

/// Drive a pending task through planning and in_progress to completed
pub async fn complete_task(store: &Store, task_id: &str, outcome: &str) {
    let tasks = store.tasks();
    tasks
        .update_status(task_id, TaskStatus::Planning, None, None)
        .await
        .expect("pending -> planning");
    tasks
        .update_status(task_id, TaskStatus::InProgress, None, None)
        .await
        .expect("planning -> in_progress");
    tasks
        .update_status(
            task_id,
            TaskStatus::Completed,
            Some(outcome.to_string()),
            None,
        )
        .await
        .expect("in_progress -> completed");
}

/// Task ids of a workflow keyed by name
pub async fn task_id_by_name(store: &Store, workflow_id: &str, name: &str) -> String {
    let detail = store
        .workflows()
        .get(workflow_id, true)
        .await
        .expect("workflow fetch");
    detail
        .tasks
        .expect("tasks included")
        .into_iter()
        .find(|t| t.name == name)
        .unwrap_or_else(|| panic!("no task named {name}"))
        .id
}
