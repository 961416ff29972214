mod common;

use caw_core::error::Error;
use caw_core::models::{AgentFilter, AgentStatus, AgentUpdate, NewAgent, TaskStatus};
use common::*;
use serde_json::json;

#[tokio::test]
async fn test_claim_protocol() {
    let store = test_store().await;
    let workflow = create_workflow(&store, "claims").await;
    store
        .workflows()
        .set_plan(&workflow.id, plan("p", vec![plan_task("A", &[])]))
        .await
        .unwrap();
    let task_id = task_id_by_name(&store, &workflow.id, "A").await;
    let first = register_agent(&store, "first").await;
    let second = register_agent(&store, "second").await;

    let claim = store.tasks().claim(&task_id, &first.id).await.unwrap();
    assert!(claim.success);
    let claimed = claim.task.unwrap();
    assert_eq!(claimed.assigned_agent_id.as_deref(), Some(first.id.as_str()));
    assert!(claimed.claimed_at.is_some(), "claim fields move together");

    // Claiming marks the holder busy on this task.
    let holder = store.agents().get(&first.id).await.unwrap();
    assert_eq!(holder.status, AgentStatus::Busy);
    assert_eq!(holder.current_task_id.as_deref(), Some(task_id.as_str()));

    // Idempotent for the holder.
    let again = store.tasks().claim(&task_id, &first.id).await.unwrap();
    assert!(again.success);

    // A second agent is told who holds it, without an error.
    let contested = store.tasks().claim(&task_id, &second.id).await.unwrap();
    assert!(!contested.success);
    assert_eq!(
        contested.already_claimed_by.as_deref(),
        Some(first.id.as_str())
    );

    // Release is holder-only.
    let err = store
        .tasks()
        .release(&task_id, &second.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));

    let released = store
        .tasks()
        .release(&task_id, &first.id, Some("switching work"))
        .await
        .unwrap();
    assert!(released.assigned_agent_id.is_none());
    assert!(released.claimed_at.is_none());
    let holder = store.agents().get(&first.id).await.unwrap();
    assert_eq!(holder.status, AgentStatus::Online);
    assert!(holder.current_task_id.is_none());

    // Releasing an unclaimed task is an error.
    let err = store
        .tasks()
        .release(&task_id, &first.id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[tokio::test]
async fn test_claim_rejects_terminal_and_unknown_agent() {
    let store = test_store().await;
    let workflow = create_workflow(&store, "terminal-claim").await;
    store
        .workflows()
        .set_plan(&workflow.id, plan("p", vec![plan_task("A", &[])]))
        .await
        .unwrap();
    let task_id = task_id_by_name(&store, &workflow.id, "A").await;

    let err = store
        .tasks()
        .claim(&task_id, "ag_000000000000")
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    complete_task(&store, &task_id, "done").await;
    let agent = register_agent(&store, "late").await;
    let err = store.tasks().claim(&task_id, &agent.id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[tokio::test]
async fn test_unregister_releases_claims() {
    let store = test_store().await;
    let workflow = create_workflow(&store, "abandonment").await;
    store
        .workflows()
        .set_plan(
            &workflow.id,
            plan("p", vec![plan_task("A", &[]), plan_task("B", &[])]),
        )
        .await
        .unwrap();
    let a = task_id_by_name(&store, &workflow.id, "A").await;
    let b = task_id_by_name(&store, &workflow.id, "B").await;
    let agent = register_agent(&store, "worker").await;
    store.tasks().claim(&a, &agent.id).await.unwrap();
    store.tasks().claim(&b, &agent.id).await.unwrap();

    let outcome = store.agents().unregister(&agent.id).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.tasks_released, 2);

    let gone = store.agents().get(&agent.id).await.unwrap();
    assert_eq!(gone.status, AgentStatus::Offline);
    assert!(gone.current_task_id.is_none());
    for task_id in [&a, &b] {
        let detail = store.tasks().get(task_id, false, None).await.unwrap();
        assert!(detail.task.assigned_agent_id.is_none());
        assert!(detail.task.claimed_at.is_none());
    }

    // Unregistering with nothing held reports zero.
    let idle = register_agent(&store, "idle").await;
    let outcome = store.agents().unregister(&idle.id).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.tasks_released, 0);

    // Heartbeats from an offline agent are refused.
    let err = store.agents().heartbeat(&agent.id, None, None).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[tokio::test]
async fn test_stale_agent_detection() {
    let store = test_store().await;
    let fresh = register_agent(&store, "fresh").await;
    let quiet = register_agent(&store, "quiet").await;

    // No heartbeat is older than a generous timeout.
    assert!(store.agents().get_stale(60_000).await.unwrap().is_empty());

    // With a zero timeout everything online is stale; refresh one and it
    // drops out of the next zero-window sweep taken before its beat.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    store.agents().heartbeat(&fresh.id, None, None).await.unwrap();
    let stale = store.agents().get_stale(10).await.unwrap();
    let ids: Vec<&str> = stale.iter().map(|a| a.id.as_str()).collect();
    assert!(ids.contains(&quiet.id.as_str()));
    assert!(!ids.contains(&fresh.id.as_str()));

    // Offline agents never count as stale.
    store.agents().unregister(&quiet.id).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let stale = store.agents().get_stale(10).await.unwrap();
    assert!(stale.iter().all(|a| a.id != quiet.id));
}

#[tokio::test]
async fn test_agent_update_merges_metadata_and_replaces_capabilities() {
    let store = test_store().await;
    let agent = store
        .agents()
        .register(NewAgent {
            name: "versatile".to_string(),
            runtime: "claude-code".to_string(),
            capabilities: vec!["rust".to_string()],
            metadata: Some(
                json!({"model": "opus", "region": "us"}).as_object().unwrap().clone(),
            ),
            ..Default::default()
        })
        .await
        .unwrap();

    let updated = store
        .agents()
        .update(
            &agent.id,
            AgentUpdate {
                capabilities: Some(vec!["rust".to_string(), "sql".to_string()]),
                metadata: Some(
                    json!({"region": "eu", "tier": "fast"}).as_object().unwrap().clone(),
                ),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.capabilities, vec!["rust", "sql"]);
    assert_eq!(
        updated.metadata.get("model").and_then(|v| v.as_str()),
        Some("opus")
    );
    assert_eq!(
        updated.metadata.get("region").and_then(|v| v.as_str()),
        Some("eu")
    );
    assert_eq!(
        updated.metadata.get("tier").and_then(|v| v.as_str()),
        Some("fast")
    );

    // Explicit null clears the current task pointer.
    let cleared = store
        .agents()
        .update(
            &agent.id,
            AgentUpdate {
                current_task_id: Some(None),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(cleared.current_task_id.is_none());
}

#[tokio::test]
async fn test_agent_list_filters() {
    let store = test_store().await;
    let worker = register_agent(&store, "w").await;
    let coordinator = store
        .agents()
        .register(NewAgent {
            name: "boss".to_string(),
            runtime: "daemon".to_string(),
            role: Some(caw_core::AgentRole::Coordinator),
            ..Default::default()
        })
        .await
        .unwrap();
    store.agents().unregister(&worker.id).await.unwrap();

    let online = store
        .agents()
        .list(AgentFilter {
            status: Some(vec![AgentStatus::Online]),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(online.len(), 1);
    assert_eq!(online[0].id, coordinator.id);

    let coordinators = store
        .agents()
        .list(AgentFilter {
            role: Some(caw_core::AgentRole::Coordinator),
            runtime: Some("daemon".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(coordinators.len(), 1);

    // Empty status array matches nothing.
    let none = store
        .agents()
        .list(AgentFilter {
            status: Some(vec![]),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_claim_fields_move_together_through_replan() {
    let store = test_store().await;
    let workflow = create_workflow(&store, "invariant").await;
    store
        .workflows()
        .set_plan(&workflow.id, plan("p", vec![plan_task("A", &[])]))
        .await
        .unwrap();
    let task_id = task_id_by_name(&store, &workflow.id, "A").await;
    let agent = register_agent(&store, "w").await;

    store.tasks().claim(&task_id, &agent.id).await.unwrap();
    let tasks = store.tasks();
    tasks
        .update_status(&task_id, TaskStatus::Planning, None, None)
        .await
        .unwrap();
    tasks
        .update_status(&task_id, TaskStatus::InProgress, None, None)
        .await
        .unwrap();

    // Task replan keeps the claim; release stays explicit.
    let outcome = tasks.replan(&task_id, "pivot", "new plan").await.unwrap();
    assert_eq!(outcome.task.status, TaskStatus::Pending);
    let detail = tasks.get(&task_id, true, None).await.unwrap();
    assert_eq!(
        detail.task.assigned_agent_id.is_some(),
        detail.task.claimed_at.is_some()
    );
    assert_eq!(detail.task.assigned_agent_id.as_deref(), Some(agent.id.as_str()));
    assert!(detail.task.outcome.is_none());
    assert!(detail.task.plan.as_deref() == Some("new plan"));

    let checkpoints = detail.checkpoints.unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0].summary, "pivot");
}
