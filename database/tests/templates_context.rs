mod common;

use caw_core::models::{ApplyTemplate, ContextOptions, CreateWorkflow, NewTemplate, TaskStatus};
use caw_core::plan::{TemplateDefinition, TemplateTask};
use common::*;

fn template_task(name: &str, depends_on: &[&str]) -> TemplateTask {
    TemplateTask {
        name: name.to_string(),
        description: format!("{name} description"),
        parallel_group: None,
        depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        context: None,
    }
}

fn variables(pairs: &[(&str, &str)]) -> std::collections::BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn test_template_apply_round_trip() {
    let store = test_store().await;
    let template = store
        .templates()
        .create(NewTemplate {
            name: "feature-work".to_string(),
            description: Some("standard feature flow".to_string()),
            template: Some(TemplateDefinition {
                tasks: vec![
                    template_task("Design {{feature}}", &[]),
                    template_task("Build {{feature}}", &["Design {{feature}}"]),
                    template_task("Test {{feature}}", &["Build {{feature}}"]),
                ],
                variables: vec![],
            }),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(template.version, 1);

    let outcome = store
        .templates()
        .apply(
            &template.id,
            ApplyTemplate {
                workflow_name: "login feature".to_string(),
                variables: variables(&[("feature", "login")]),
                max_parallel: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let detail = store.workflows().get(&outcome.workflow_id, true).await.unwrap();
    assert_eq!(detail.workflow.source_type, "template");
    assert_eq!(detail.workflow.source_ref.as_deref(), Some(template.id.as_str()));
    assert_eq!(detail.workflow.max_parallel_tasks, 2);
    assert_eq!(
        detail.workflow.status,
        caw_core::models::WorkflowStatus::Ready
    );

    let tasks = detail.tasks.unwrap();
    let names: Vec<&str> = tasks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["Design login", "Build login", "Test login"]);

    // Edge structure carried over through interpolation.
    let build = tasks.iter().find(|t| t.name == "Build login").unwrap();
    let deps = store.tasks().get_dependencies(&build.id).await.unwrap();
    assert_eq!(deps.dependencies.len(), 1);
    assert_eq!(deps.dependencies[0].name, "Design login");
    assert_eq!(deps.dependents.len(), 1);
    assert_eq!(deps.dependents[0].name, "Test login");
}

#[tokio::test]
async fn test_template_missing_variables_listed() {
    let store = test_store().await;
    let template = store
        .templates()
        .create(NewTemplate {
            name: "varied".to_string(),
            template: Some(TemplateDefinition {
                tasks: vec![template_task("Deploy {{service}} to {{env}}", &[])],
                variables: vec!["owner".to_string()],
            }),
            ..Default::default()
        })
        .await
        .unwrap();

    let err = store
        .templates()
        .apply(
            &template.id,
            ApplyTemplate {
                workflow_name: "deploy".to_string(),
                variables: variables(&[("service", "api")]),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_validation());
    let message = format!("{err}");
    assert!(message.contains("env"));
    assert!(message.contains("owner"));
    assert!(!message.contains("service"));
}

#[tokio::test]
async fn test_template_name_conflict_and_source_exclusivity() {
    let store = test_store().await;
    let definition = TemplateDefinition {
        tasks: vec![template_task("A", &[])],
        variables: vec![],
    };
    store
        .templates()
        .create(NewTemplate {
            name: "taken".to_string(),
            template: Some(definition.clone()),
            ..Default::default()
        })
        .await
        .unwrap();

    let err = store
        .templates()
        .create(NewTemplate {
            name: "taken".to_string(),
            template: Some(definition.clone()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let err = store
        .templates()
        .create(NewTemplate {
            name: "sourceless".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn test_template_from_workflow_and_versioning() {
    let store = test_store().await;
    let workflow = create_workflow(&store, "prototype").await;
    store
        .workflows()
        .set_plan(
            &workflow.id,
            plan(
                "p",
                vec![
                    plan_task("Survey", &[]),
                    grouped_task("Dig A", "dig"),
                    grouped_task("Dig B", "dig"),
                ],
            ),
        )
        .await
        .unwrap();

    let template = store
        .templates()
        .create(NewTemplate {
            name: "cloned".to_string(),
            from_workflow_id: Some(workflow.id.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(template.template.tasks.len(), 3);
    assert_eq!(template.template.tasks[0].name, "Survey");
    assert_eq!(
        template.template.tasks[1].parallel_group.as_deref(),
        Some("dig")
    );

    let bumped = store
        .templates()
        .update_version(
            &template.id,
            TemplateDefinition {
                tasks: vec![template_task("Survey", &[])],
                variables: vec![],
            },
        )
        .await
        .unwrap();
    assert_eq!(bumped.version, 2);
    assert_eq!(bumped.template.tasks.len(), 1);

    let listed = store.templates().list().await.unwrap();
    assert_eq!(listed.len(), 2);
}

#[tokio::test]
async fn test_context_loader_sections() {
    let store = test_store().await;
    let workflow = store
        .workflows()
        .create(CreateWorkflow {
            name: "context-rich".to_string(),
            source_type: "issue".to_string(),
            source_content: Some("Fix the flaky login test described in #42".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    store
        .workflows()
        .set_plan(
            &workflow.id,
            plan(
                "p",
                vec![
                    plan_task("Investigate", &[]),
                    grouped_task("Fix backend", "fix"),
                    {
                        let mut t = grouped_task("Fix frontend", "fix");
                        t.depends_on = vec!["Investigate".to_string()];
                        t
                    },
                ],
            ),
        )
        .await
        .unwrap();

    let investigate = task_id_by_name(&store, &workflow.id, "Investigate").await;
    complete_task(&store, &investigate, "root cause: clock skew").await;
    let frontend = task_id_by_name(&store, &workflow.id, "Fix frontend").await;

    let context = store
        .context()
        .load(&frontend, ContextOptions::default())
        .await
        .unwrap();

    let wf = context.workflow.unwrap();
    assert_eq!(wf.id, workflow.id);
    assert!(wf.source_summary.unwrap().contains("#42"));

    let current = context.current_task.unwrap();
    assert_eq!(current.task.id, frontend);

    let prior = context.prior_tasks.unwrap();
    assert_eq!(prior.len(), 1);
    assert_eq!(prior[0].outcome.as_deref(), Some("root cause: clock skew"));

    let siblings = context.sibling_tasks.unwrap();
    assert_eq!(siblings.len(), 1);
    assert_eq!(siblings[0].name, "Fix backend");

    let outcomes = context.dependency_outcomes.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].name, "Investigate");

    assert!(context.token_estimate > 0);

    // Ungrouped tasks have no sibling section at all.
    let backend_ctx = store
        .context()
        .load(&investigate, ContextOptions::default())
        .await
        .unwrap();
    assert!(backend_ctx.sibling_tasks.is_none());
}

#[tokio::test]
async fn test_context_loader_truncates_long_sources() {
    let store = test_store().await;
    let workflow = store
        .workflows()
        .create(CreateWorkflow {
            name: "wordy".to_string(),
            source_type: "prompt".to_string(),
            source_content: Some("lorem ipsum ".repeat(4000)),
            ..Default::default()
        })
        .await
        .unwrap();
    store
        .workflows()
        .set_plan(&workflow.id, plan("p", vec![plan_task("A", &[])]))
        .await
        .unwrap();
    let task_id = task_id_by_name(&store, &workflow.id, "A").await;

    let context = store
        .context()
        .load(
            &task_id,
            ContextOptions {
                max_tokens: 500,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let source = context.workflow.unwrap().source_summary.unwrap();
    assert!(source.ends_with(caw_core::tokens::TRUNCATION_MARKER));
    assert!(context.token_estimate <= 600, "close to the requested budget");
}

#[tokio::test]
async fn test_task_set_plan_merges_context() {
    let store = test_store().await;
    let workflow = create_workflow(&store, "planning-context").await;
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
        .set_plan(
            &task_id,
            "step 1: look around",
            Some(
                serde_json::json!({"estimated_complexity": "low"})
                    .as_object()
                    .unwrap()
                    .clone(),
            ),
        )
        .await
        .unwrap();
    let updated = tasks
        .set_plan(
            &task_id,
            "step 1: look around\nstep 2: fix",
            Some(
                serde_json::json!({"files_likely_affected": ["auth.rs"]})
                    .as_object()
                    .unwrap()
                    .clone(),
            ),
        )
        .await
        .unwrap();

    assert!(updated.plan.unwrap().contains("step 2"));
    assert_eq!(
        updated.context.get("estimated_complexity").and_then(|v| v.as_str()),
        Some("low"),
        "earlier context keys survive the merge"
    );
    assert!(updated.context.contains_key("files_likely_affected"));

    // Plans only apply while the task is planning.
    tasks
        .update_status(&task_id, TaskStatus::InProgress, None, None)
        .await
        .unwrap();
    let err = tasks.set_plan(&task_id, "too late", None).await.unwrap_err();
    assert!(matches!(err, caw_core::error::Error::InvalidState(_)));
}
