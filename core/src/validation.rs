use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::plan::PlanTask;

/// Validation utilities shared by the services.
///
/// Structural plan checks live here; anything that needs the store (name
/// collisions with existing tasks, dependency resolution) stays in the
/// service that owns the transaction.
pub struct Validate;

impl Validate {
    /// Reject empty or whitespace-only required fields
    pub fn non_empty(field: &str, value: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(Error::empty_field(field));
        }
        Ok(())
    }

    /// `max_parallel_tasks` must be at least 1
    pub fn max_parallel(value: i64) -> Result<()> {
        if value < 1 {
            return Err(Error::Validation(format!(
                "max_parallel_tasks must be >= 1, got {value}"
            )));
        }
        Ok(())
    }

    /// Reject malformed entity identifiers
    pub fn id_format(id: &str) -> Result<()> {
        if !crate::ids::is_valid(id) {
            return Err(Error::Validation(format!("malformed identifier: '{id}'")));
        }
        Ok(())
    }

    /// Verify a `blocks` edge set forms a DAG.
    ///
    /// Edges are `(task, depends_on)` pairs. Kahn's algorithm over the
    /// reversed edges; any node left unprocessed sits on a cycle.
    pub fn acyclic(edges: &[(String, String)]) -> Result<()> {
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        for (task, depends_on) in edges {
            dependents.entry(depends_on).or_default().push(task);
            *in_degree.entry(task).or_insert(0) += 1;
            in_degree.entry(depends_on).or_insert(0);
        }

        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(node, _)| *node)
            .collect();
        let mut processed = 0usize;
        while let Some(node) = ready.pop() {
            processed += 1;
            for dependent in dependents.get(node).into_iter().flatten().copied() {
                let degree = in_degree
                    .get_mut(dependent)
                    .expect("dependent was counted above");
                *degree -= 1;
                if *degree == 0 {
                    ready.push(dependent);
                }
            }
        }

        if processed != in_degree.len() {
            let mut stuck: Vec<&str> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(node, _)| *node)
                .collect();
            stuck.sort_unstable();
            return Err(Error::Validation(format!(
                "dependency cycle detected involving: {}",
                stuck.join(", ")
            )));
        }
        Ok(())
    }

    /// Structural checks on a plan's task list: non-empty names, no
    /// duplicate names, no self-dependencies.
    pub fn plan_tasks(tasks: &[PlanTask]) -> Result<()> {
        let mut seen = HashSet::new();
        for task in tasks {
            Self::non_empty("task name", &task.name)?;
            if !seen.insert(task.name.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate task name in plan: '{}'",
                    task.name
                )));
            }
            for dep in &task.depends_on {
                if dep == &task.name {
                    return Err(Error::Validation(format!(
                        "task '{}' cannot depend on itself",
                        task.name
                    )));
                }
            }
        }
        Ok(())
    }
}
