use std::collections::BTreeSet;
use std::sync::OnceLock;

use caw_core::error::{Error, Result};
use caw_core::events::{Event, EventType};
use caw_core::models::{
    ApplyOutcome, ApplyTemplate, CreateWorkflow, NewTemplate, WorkflowStatus, WorkflowTemplate,
};
use caw_core::plan::{PlanInput, TemplateDefinition, TemplateTask};
use caw_core::{ids, IdKind, Validate};
use chrono::Utc;
use regex::Regex;
use serde_json::json;

use crate::common::{
    db_err, fetch_template, fetch_workflow, load_blocking_edges, load_workflow_tasks,
    row_to_template, TEMPLATE_COLUMNS,
};
use crate::store::Store;
use crate::workflow::{apply_plan_tx, create_workflow_tx};

/// Context keys carried over when cloning a workflow into a template
const CLONED_CONTEXT_KEYS: [&str; 2] = ["estimated_complexity", "files_likely_affected"];

/// Reusable plan prototypes with `{{variable}}` interpolation.
#[derive(Clone)]
pub struct TemplateService {
    store: Store,
}

impl TemplateService {
    pub(crate) fn new(store: Store) -> Self {
        Self { store }
    }

    /// Create a template from exactly one source: an explicit definition,
    /// or a clone of an existing workflow's task graph.
    pub async fn create(&self, input: NewTemplate) -> Result<WorkflowTemplate> {
        Validate::non_empty("name", &input.name)?;

        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        let definition = match (&input.from_workflow_id, &input.template) {
            (Some(_), Some(_)) | (None, None) => {
                return Err(Error::Validation(
                    "provide exactly one of from_workflow_id or template".to_string(),
                ));
            }
            (None, Some(definition)) => definition.clone(),
            (Some(workflow_id), None) => {
                fetch_workflow(&mut tx, workflow_id).await?;
                let tasks = load_workflow_tasks(&mut tx, workflow_id).await?;
                let edges = load_blocking_edges(&mut tx, workflow_id).await?;
                let name_of = |id: &str| -> Option<String> {
                    tasks.iter().find(|t| t.id == id).map(|t| t.name.clone())
                };

                let template_tasks = tasks
                    .iter()
                    .map(|task| {
                        let depends_on = edges
                            .iter()
                            .filter(|(task_id, _)| task_id == &task.id)
                            .filter_map(|(_, dep_id)| name_of(dep_id))
                            .collect();
                        let mut context = serde_json::Map::new();
                        for key in CLONED_CONTEXT_KEYS {
                            if let Some(value) = task.context.get(key) {
                                context.insert(key.to_string(), value.clone());
                            }
                        }
                        TemplateTask {
                            name: task.name.clone(),
                            description: task.description.clone(),
                            parallel_group: task.parallel_group.clone(),
                            depends_on,
                            context: (!context.is_empty()).then_some(context),
                        }
                    })
                    .collect();
                TemplateDefinition {
                    tasks: template_tasks,
                    variables: Vec::new(),
                }
            }
        };

        let now = Utc::now();
        let template = WorkflowTemplate {
            id: ids::generate(IdKind::Template),
            name: input.name.clone(),
            description: input.description.clone(),
            template: definition,
            version: 1,
            created_at: now,
            updated_at: now,
        };
        let serialized = serde_json::to_string(&template.template)
            .map_err(|e| Error::Database(format!("failed to serialize template: {e}")))?;
        sqlx::query(
            "INSERT INTO workflow_templates (id, name, description, template, version, \
             created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&template.id)
        .bind(&template.name)
        .bind(&template.description)
        .bind(&serialized)
        .bind(template.version)
        .bind(template.created_at)
        .bind(template.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match db_err(e) {
            Error::Conflict(_) => {
                Error::Conflict(format!("template name already exists: '{}'", input.name))
            }
            other => other,
        })?;
        tx.commit().await.map_err(db_err)?;

        tracing::info!(template_id = %template.id, name = %template.name, "template created");
        Ok(template)
    }

    pub async fn list(&self) -> Result<Vec<WorkflowTemplate>> {
        let sql =
            format!("SELECT {TEMPLATE_COLUMNS} FROM workflow_templates ORDER BY name");
        let rows = sqlx::query(&sql)
            .fetch_all(self.store.pool())
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_template).collect()
    }

    pub async fn get(&self, template_id: &str) -> Result<WorkflowTemplate> {
        let mut conn = self.store.pool().acquire().await.map_err(db_err)?;
        fetch_template(&mut conn, template_id).await
    }

    /// Instantiate a template into a fresh workflow in one transaction:
    /// interpolate `{{variables}}`, create the workflow
    /// (`source_type = "template"`), and apply the plan.
    pub async fn apply(&self, template_id: &str, input: ApplyTemplate) -> Result<ApplyOutcome> {
        Validate::non_empty("workflow_name", &input.workflow_name)?;

        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        let template = fetch_template(&mut tx, template_id).await?;

        let required = required_variables(&template.template);
        let missing: Vec<&str> = required
            .iter()
            .map(String::as_str)
            .filter(|name| !input.variables.contains_key(*name))
            .collect();
        if !missing.is_empty() {
            return Err(Error::Validation(format!(
                "missing template variables: {}",
                missing.join(", ")
            )));
        }

        let substitute = |text: &str| -> String {
            let mut out = text.to_string();
            for (name, value) in &input.variables {
                out = out.replace(&format!("{{{{{name}}}}}"), value);
            }
            out
        };
        let plan_tasks = template
            .template
            .tasks
            .iter()
            .map(|task| {
                let mut plan_task = task.clone().into_plan_task();
                plan_task.name = substitute(&plan_task.name);
                plan_task.description = substitute(&plan_task.description);
                plan_task.depends_on = plan_task
                    .depends_on
                    .iter()
                    .map(|dep| substitute(dep))
                    .collect();
                plan_task
            })
            .collect();

        let workflow = create_workflow_tx(
            &mut tx,
            &CreateWorkflow {
                name: input.workflow_name.clone(),
                source_type: "template".to_string(),
                source_ref: Some(template.id.clone()),
                source_content: None,
                max_parallel_tasks: input.max_parallel,
                auto_create_workspaces: None,
                config: None,
                repository_paths: input.repo_path.clone().into_iter().collect(),
            },
        )
        .await?;
        let plan = PlanInput {
            summary: template.description.clone().unwrap_or_else(|| {
                format!("Instantiated from template '{}'", template.name)
            }),
            tasks: plan_tasks,
        };
        apply_plan_tx(&mut tx, &workflow, &plan).await?;
        tx.commit().await.map_err(db_err)?;

        self.store.events().emit(Event::new(
            EventType::WorkflowStatus,
            json!({ "workflow_id": workflow.id, "status": WorkflowStatus::Ready.as_str() }),
        ));
        tracing::info!(
            template_id,
            workflow_id = %workflow.id,
            "template applied"
        );
        Ok(ApplyOutcome {
            workflow_id: workflow.id,
        })
    }

    /// Replace the definition and bump the version
    pub async fn update_version(
        &self,
        template_id: &str,
        definition: TemplateDefinition,
    ) -> Result<WorkflowTemplate> {
        let mut tx = self.store.pool().begin().await.map_err(db_err)?;
        let mut template = fetch_template(&mut tx, template_id).await?;

        template.template = definition;
        template.version += 1;
        let now = Utc::now();
        let serialized = serde_json::to_string(&template.template)
            .map_err(|e| Error::Database(format!("failed to serialize template: {e}")))?;
        sqlx::query(
            "UPDATE workflow_templates SET template = ?, version = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&serialized)
        .bind(template.version)
        .bind(now)
        .bind(template_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        template.updated_at = now;
        Ok(template)
    }
}

fn variable_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([A-Za-z0-9_]+)\}\}").expect("valid variable pattern"))
}

/// Variables a template requires: every `{{name}}` occurrence in task
/// names, descriptions, and dependency references, unioned with the
/// declared variable list.
fn required_variables(definition: &TemplateDefinition) -> BTreeSet<String> {
    let mut required: BTreeSet<String> =
        definition.variables.iter().cloned().collect();
    let mut scan = |text: &str| {
        for capture in variable_regex().captures_iter(text) {
            required.insert(capture[1].to_string());
        }
    };
    for task in &definition.tasks {
        scan(&task.name);
        scan(&task.description);
        for dep in &task.depends_on {
            scan(dep);
        }
    }
    required
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> TemplateDefinition {
        TemplateDefinition {
            tasks: vec![
                TemplateTask {
                    name: "Design {{feature}}".to_string(),
                    description: "Sketch the {{feature}} API for {{service}}".to_string(),
                    parallel_group: None,
                    depends_on: vec![],
                    context: None,
                },
                TemplateTask {
                    name: "Build {{feature}}".to_string(),
                    description: String::new(),
                    parallel_group: None,
                    depends_on: vec!["Design {{feature}}".to_string()],
                    context: None,
                },
            ],
            variables: vec!["owner".to_string()],
        }
    }

    #[test]
    fn test_required_variables_unions_scan_and_declared() {
        let required = required_variables(&definition());
        let names: Vec<&str> = required.iter().map(String::as_str).collect();
        assert_eq!(names, vec!["feature", "owner", "service"]);
    }

    #[test]
    fn test_variable_regex_shape() {
        let re = variable_regex();
        assert!(re.is_match("{{var_1}}"));
        assert!(!re.is_match("{{bad name}}"));
        assert!(!re.is_match("{var}"));
    }
}
