//! Plan and template definitions.
//!
//! A plan is the ordered task set applied to a workflow by `set_plan` or
//! `replan`; a template is a reusable plan prototype with `{{variable}}`
//! placeholders. Both reference dependencies by task name (templates) or by
//! task name/id (plans applied to an existing workflow).

use serde::{Deserialize, Serialize};
use serde_json::Map;

/// A task entry inside a plan being applied to a workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanTask {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    /// Task names local to the plan, or existing task ids when replanning
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Free-form context merged onto the created task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, serde_json::Value>>,
}

/// The full plan handed to `set_plan`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanInput {
    pub summary: String,
    #[serde(default)]
    pub tasks: Vec<PlanTask>,
}

/// Input for the workflow-level replan operation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReplanInput {
    pub summary: String,
    pub reason: String,
    #[serde(default)]
    pub tasks: Vec<PlanTask>,
}

/// A task prototype inside a template definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateTask {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    /// Dependencies by task name within the template
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, serde_json::Value>>,
}

/// Serialized template payload stored on a [`crate::models::WorkflowTemplate`]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TemplateDefinition {
    #[serde(default)]
    pub tasks: Vec<TemplateTask>,
    /// Declared variables, unioned with `{{name}}` occurrences when applying
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<String>,
}

impl TemplateTask {
    /// Convert to a plan task after variable interpolation
    pub fn into_plan_task(self) -> PlanTask {
        PlanTask {
            name: self.name,
            description: self.description,
            parallel_group: self.parallel_group,
            depends_on: self.depends_on,
            context: self.context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_task_defaults() {
        let task: PlanTask = serde_json::from_str(r#"{"name": "Build"}"#).unwrap();
        assert_eq!(task.name, "Build");
        assert_eq!(task.description, "");
        assert!(task.depends_on.is_empty());
        assert!(task.parallel_group.is_none());
    }

    #[test]
    fn test_template_definition_round_trip() {
        let definition = TemplateDefinition {
            tasks: vec![TemplateTask {
                name: "Implement {{feature}}".to_string(),
                description: "Implement the {{feature}} feature".to_string(),
                parallel_group: None,
                depends_on: vec!["Design {{feature}}".to_string()],
                context: None,
            }],
            variables: vec!["feature".to_string()],
        };
        let json = serde_json::to_string(&definition).unwrap();
        let parsed: TemplateDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, definition);
    }
}
