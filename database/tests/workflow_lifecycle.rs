mod common;

use caw_core::error::Error;
use caw_core::models::{
    CreateWorkflow, SummaryFormat, TaskStatus, WorkflowFilter, WorkflowStatus,
};
use common::*;

#[tokio::test]
async fn test_linear_workflow_end_to_end() {
    let store = test_store().await;
    let workflow = create_workflow(&store, "L").await;

    let applied = store
        .workflows()
        .set_plan(
            &workflow.id,
            plan(
                "s",
                vec![
                    plan_task("A", &[]),
                    plan_task("B", &["A"]),
                    plan_task("C", &["B"]),
                ],
            ),
        )
        .await
        .unwrap();
    assert_eq!(applied.tasks_created, 3);
    assert_eq!(applied.status, WorkflowStatus::Ready);

    store
        .workflows()
        .update_status(&workflow.id, WorkflowStatus::InProgress, None)
        .await
        .unwrap();
    let agent = register_agent(&store, "G").await;

    for expected in ["A", "B", "C"] {
        let next = store
            .orchestration()
            .get_next_tasks(&workflow.id, false, false)
            .await
            .unwrap();
        assert_eq!(next.tasks.len(), 1, "exactly one unblocked task");
        assert_eq!(next.tasks[0].task.name, expected);
        let task_id = next.tasks[0].task.id.clone();

        let claim = store.tasks().claim(&task_id, &agent.id).await.unwrap();
        assert!(claim.success);

        complete_task(&store, &task_id, "ok").await;
        store.tasks().release(&task_id, &agent.id, None).await.unwrap();
    }

    let next = store
        .orchestration()
        .get_next_tasks(&workflow.id, false, false)
        .await
        .unwrap();
    assert!(next.tasks.is_empty());
    assert!(next.all_complete);
}

#[tokio::test]
async fn test_set_plan_with_empty_tasks_still_reaches_ready() {
    let store = test_store().await;
    let workflow = create_workflow(&store, "empty").await;

    let applied = store
        .workflows()
        .set_plan(&workflow.id, plan("nothing to do", vec![]))
        .await
        .unwrap();
    assert_eq!(applied.tasks_created, 0);
    assert_eq!(applied.status, WorkflowStatus::Ready);

    let next = store
        .orchestration()
        .get_next_tasks(&workflow.id, false, false)
        .await
        .unwrap();
    assert!(next.tasks.is_empty());
    assert!(next.all_complete);
}

#[tokio::test]
async fn test_set_plan_rejections() {
    let store = test_store().await;
    let workflow = create_workflow(&store, "invalid-plans").await;

    let duplicate = store
        .workflows()
        .set_plan(
            &workflow.id,
            plan("p", vec![plan_task("A", &[]), plan_task("A", &[])]),
        )
        .await
        .unwrap_err();
    assert!(duplicate.is_validation());

    let unknown = store
        .workflows()
        .set_plan(&workflow.id, plan("p", vec![plan_task("A", &["Missing"])]))
        .await
        .unwrap_err();
    assert!(unknown.is_validation());

    let cycle = store
        .workflows()
        .set_plan(
            &workflow.id,
            plan("p", vec![plan_task("A", &["B"]), plan_task("B", &["A"])]),
        )
        .await
        .unwrap_err();
    assert!(cycle.is_validation());

    // All attempts rolled back; the workflow is still planning and empty.
    let detail = store.workflows().get(&workflow.id, true).await.unwrap();
    assert_eq!(detail.workflow.status, WorkflowStatus::Planning);
    assert!(detail.tasks.unwrap().is_empty());

    // A valid plan still applies after the failures.
    store
        .workflows()
        .set_plan(&workflow.id, plan("p", vec![plan_task("A", &[])]))
        .await
        .unwrap();

    // And a second plan is rejected now that the workflow left planning.
    let resubmit = store
        .workflows()
        .set_plan(&workflow.id, plan("p", vec![plan_task("B", &[])]))
        .await
        .unwrap_err();
    assert!(matches!(resubmit, Error::InvalidState(_)));
}

#[tokio::test]
async fn test_workflow_status_transitions() {
    let store = test_store().await;
    let workflow = create_workflow(&store, "transitions").await;
    store
        .workflows()
        .set_plan(&workflow.id, plan("p", vec![plan_task("A", &[])]))
        .await
        .unwrap();

    // ready -> completed skips in_progress and is rejected
    let err = store
        .workflows()
        .update_status(&workflow.id, WorkflowStatus::Completed, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    let workflows = store.workflows();
    workflows
        .update_status(&workflow.id, WorkflowStatus::InProgress, None)
        .await
        .unwrap();
    workflows
        .update_status(&workflow.id, WorkflowStatus::Paused, Some("lunch".to_string()))
        .await
        .unwrap();
    let resumed = workflows
        .update_status(&workflow.id, WorkflowStatus::InProgress, None)
        .await
        .unwrap();
    assert_eq!(resumed.status, WorkflowStatus::InProgress);
    assert_eq!(
        resumed.config.get("last_status_reason").and_then(|v| v.as_str()),
        Some("lunch")
    );

    // failed -> in_progress is the retry arc
    workflows
        .update_status(&workflow.id, WorkflowStatus::Failed, Some("agent crashed".to_string()))
        .await
        .unwrap();
    let retried = workflows
        .update_status(&workflow.id, WorkflowStatus::InProgress, None)
        .await
        .unwrap();
    assert_eq!(retried.status, WorkflowStatus::InProgress);
}

#[tokio::test]
async fn test_task_completion_requires_outcome() {
    let store = test_store().await;
    let workflow = create_workflow(&store, "outcome-required").await;
    store
        .workflows()
        .set_plan(&workflow.id, plan("p", vec![plan_task("A", &[])]))
        .await
        .unwrap();
    let task_id = task_id_by_name(&store, &workflow.id, "A").await;

    let tasks = store.tasks();
    tasks
        .update_status(&task_id, TaskStatus::Planning, None, None)
        .await
        .unwrap();
    tasks
        .update_status(&task_id, TaskStatus::InProgress, None, None)
        .await
        .unwrap();

    let err = tasks
        .update_status(&task_id, TaskStatus::Completed, None, None)
        .await
        .unwrap_err();
    assert!(err.is_validation());

    // No state change happened.
    let detail = tasks.get(&task_id, false, None).await.unwrap();
    assert_eq!(detail.task.status, TaskStatus::InProgress);
    assert!(detail.task.outcome.is_none());

    // Failing similarly requires an error.
    let err = tasks
        .update_status(&task_id, TaskStatus::Failed, None, None)
        .await
        .unwrap_err();
    assert!(err.is_validation());

    tasks
        .update_status(
            &task_id,
            TaskStatus::Failed,
            None,
            Some("compile error".to_string()),
        )
        .await
        .unwrap();
    let detail = tasks.get(&task_id, false, None).await.unwrap();
    assert_eq!(detail.task.status, TaskStatus::Failed);
    assert_eq!(detail.task.outcome_detail.as_deref(), Some("compile error"));
}

#[tokio::test]
async fn test_list_workflows_with_filters_and_total() {
    let store = test_store().await;
    for i in 0..3 {
        let workflow = create_workflow(&store, &format!("wf-{i}")).await;
        store
            .workflows()
            .set_plan(&workflow.id, plan("p", vec![plan_task("A", &[])]))
            .await
            .unwrap();
    }
    create_workflow(&store, "still-planning").await;

    let all = store.workflows().list(WorkflowFilter::default()).await.unwrap();
    assert_eq!(all.total, 4);

    let ready = store
        .workflows()
        .list(WorkflowFilter {
            statuses: Some(vec![WorkflowStatus::Ready]),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(ready.total, 3);
    assert!(ready.workflows.iter().all(|w| w.status == WorkflowStatus::Ready));

    let paged = store
        .workflows()
        .list(WorkflowFilter {
            limit: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(paged.workflows.len(), 2);
    assert_eq!(paged.total, 4, "total counts matches before pagination");

    // Explicit empty status set matches nothing.
    let none = store
        .workflows()
        .list(WorkflowFilter {
            statuses: Some(vec![]),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(none.total, 0);
    assert!(none.workflows.is_empty());
}

#[tokio::test]
async fn test_repository_registration_is_idempotent() {
    let store = test_store().await;
    let first = store
        .workflows()
        .create(CreateWorkflow {
            name: "with-repos".to_string(),
            source_type: "prompt".to_string(),
            repository_paths: vec!["/work/api".to_string(), "/work/api".to_string()],
            ..Default::default()
        })
        .await
        .unwrap();
    let second = create_workflow(&store, "same-repo").await;
    store
        .workflows()
        .add_repository(&second.id, "/work/api")
        .await
        .unwrap();

    let first_repos = store.workflows().list_repositories(&first.id).await.unwrap();
    let second_repos = store.workflows().list_repositories(&second.id).await.unwrap();
    assert_eq!(first_repos.len(), 1);
    assert_eq!(second_repos.len(), 1);
    assert_eq!(first_repos[0].id, second_repos[0].id, "same path, same row");

    let filtered = store
        .workflows()
        .list(WorkflowFilter {
            repository_id: Some(first_repos[0].id.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(filtered.total, 2);
}

#[tokio::test]
async fn test_summary_formats_and_token_estimate() {
    let store = test_store().await;
    let workflow = create_workflow(&store, "summarized").await;
    store
        .workflows()
        .set_plan(
            &workflow.id,
            plan("build it", vec![plan_task("A", &[]), plan_task("B", &["A"])]),
        )
        .await
        .unwrap();

    let markdown = store
        .workflows()
        .get_summary(&workflow.id, SummaryFormat::Markdown)
        .await
        .unwrap();
    assert!(markdown.summary.contains("# Workflow: summarized"));
    assert!(markdown.summary.contains("[after: A]"));
    assert_eq!(markdown.token_estimate, markdown.summary.len().div_ceil(4));

    let json = store
        .workflows()
        .get_summary(&workflow.id, SummaryFormat::Json)
        .await
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json.summary).unwrap();
    assert_eq!(parsed["tasks"].as_array().unwrap().len(), 2);
    assert_eq!(parsed["tasks"][1]["depends_on"][0], "A");
}

#[tokio::test]
async fn test_checkpoint_ledger_sequences_and_filters() {
    let store = test_store().await;
    let workflow = create_workflow(&store, "ledger").await;
    store
        .workflows()
        .set_plan(&workflow.id, plan("p", vec![plan_task("A", &[])]))
        .await
        .unwrap();
    let task_id = task_id_by_name(&store, &workflow.id, "A").await;

    use caw_core::models::{CheckpointFilter, CheckpointType, NewCheckpoint};
    let checkpoints = store.checkpoints();
    for (kind, summary) in [
        (CheckpointType::Plan, "planned"),
        (CheckpointType::Progress, "halfway"),
        (CheckpointType::Decision, "chose sqlite"),
        (CheckpointType::Progress, "nearly done"),
    ] {
        checkpoints
            .add(
                &task_id,
                NewCheckpoint {
                    checkpoint_type: kind,
                    summary: summary.to_string(),
                    detail: None,
                    files_changed: None,
                    tokens_used: Some(42),
                },
            )
            .await
            .unwrap();
    }

    let all = checkpoints
        .list(&task_id, CheckpointFilter::default())
        .await
        .unwrap();
    let sequences: Vec<i64> = all.iter().map(|c| c.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4], "contiguous monotonic sequences");

    let progress_only = checkpoints
        .list(
            &task_id,
            CheckpointFilter {
                types: Some(vec![CheckpointType::Progress]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(progress_only.len(), 2);

    let late = checkpoints
        .list(
            &task_id,
            CheckpointFilter {
                since_sequence: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(late.len(), 2);
    assert!(late.iter().all(|c| c.sequence > 2));

    // Empty type filter matches nothing.
    let none = checkpoints
        .list(
            &task_id,
            CheckpointFilter {
                types: Some(vec![]),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(none.is_empty());
}
