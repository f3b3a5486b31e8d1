//! Planner
//!
//! Turns a task input into an ordered plan by looking its category up in
//! the task catalogue. Planning is a pure function of the task input:
//! identical input always yields a byte-identical plan, which is what
//! makes failed runs reproducible.

use crate::catalog::TaskCatalog;
use crate::error::{EngineError, Result};
use crate::models::{Plan, Step, TaskInput};
use serde_json::Value;

/// Trait for plan generation.
pub trait Planner: Send + Sync {
    fn create_plan(&self, task: &TaskInput) -> Result<Plan>;
}

/// Planner backed by the task catalogue.
pub struct CatalogPlanner {
    catalog: TaskCatalog,
}

impl CatalogPlanner {
    pub fn new(catalog: TaskCatalog) -> Self {
        Self { catalog }
    }
}

impl Planner for CatalogPlanner {
    fn create_plan(&self, task: &TaskInput) -> Result<Plan> {
        let templates = self
            .catalog
            .steps_for(&task.category)
            .ok_or_else(|| EngineError::UnknownTaskCategory(task.category.clone()))?;

        let steps: Vec<Step> = templates
            .iter()
            .map(|template| Step {
                tool_name: template.tool.clone(),
                arguments: resolve_template(&template.arguments, task),
                depends_on: template.depends_on,
                reuse_previous: false,
            })
            .collect();

        if steps.is_empty() {
            return Err(EngineError::InvalidPlan(format!(
                "category '{}' produced an empty plan",
                task.category
            )));
        }

        Ok(Plan {
            category: task.category.clone(),
            steps,
        })
    }
}

/// Substitute `$payload.<key>`, `$payload`, `$document_name` and
/// `$entity_id` placeholders with values from the task input.
fn resolve_template(template: &Value, task: &TaskInput) -> Value {
    match template {
        Value::String(s) => resolve_placeholder(s, task),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_template(v, task)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| resolve_template(v, task)).collect())
        }
        other => other.clone(),
    }
}

fn resolve_placeholder(raw: &str, task: &TaskInput) -> Value {
    match raw {
        "$document_name" => Value::String(task.document_name.clone()),
        "$entity_id" => Value::String(task.entity_id.clone()),
        "$payload" => task.payload.clone(),
        _ => {
            if let Some(key) = raw.strip_prefix("$payload.") {
                task.payload.get(key).cloned().unwrap_or(Value::Null)
            } else {
                Value::String(raw.to_string())
            }
        }
    }
}

//
// ================= Tests =================
//
