//! Task catalogue configuration
//!
//! Maps each task category to its canonical ordered step list. The
//! catalogue is configuration data, loaded once at start-up; the engine
//! never guesses a plan for a category it does not know.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

/// One step template inside a category's canonical ordering.
///
/// `arguments` is a JSON template; the planner substitutes
/// `$payload.<key>`, `$document_name` and `$entity_id` placeholders
/// with values from the task input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTemplate {
    pub tool: String,
    #[serde(default)]
    pub depends_on: Option<usize>,
    #[serde(default = "empty_object")]
    pub arguments: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCatalog {
    pub categories: HashMap<String, Vec<StepTemplate>>,
}

impl TaskCatalog {
    /// Built-in catalogue covering the standard intake categories.
    ///
    /// `document`: raw uploads that still need preprocessing.
    /// `text`: already-extracted text, classification starts immediately.
    pub fn default_catalog() -> Self {
        let document = vec![
            template(
                "preprocess_document",
                None,
                serde_json::json!({
                    "content": "$payload.content",
                    "document_name": "$document_name",
                }),
            ),
            template("classify_sector", Some(0), empty_object()),
            template("extract_events", Some(1), empty_object()),
            template("detect_risks", Some(2), empty_object()),
            template("store_events", Some(2), empty_object()),
            template("create_embeddings", Some(2), empty_object()),
            template("generate_alerts", Some(3), empty_object()),
            template("store_alerts", Some(6), empty_object()),
            template("generate_insights", Some(6), empty_object()),
        ];

        let text = vec![
            template(
                "classify_sector",
                None,
                serde_json::json!({"text": "$payload.content"}),
            ),
            template("extract_events", Some(0), empty_object()),
            template("detect_risks", Some(1), empty_object()),
            template("store_events", Some(1), empty_object()),
            template("create_embeddings", Some(1), empty_object()),
            template("generate_alerts", Some(2), empty_object()),
            template("store_alerts", Some(5), empty_object()),
            template("generate_insights", Some(5), empty_object()),
        ];

        let mut categories = HashMap::new();
        categories.insert("document".to_string(), document);
        categories.insert("text".to_string(), text);

        Self { categories }
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let catalog: TaskCatalog = serde_json::from_str(raw)?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn steps_for(&self, category: &str) -> Option<&[StepTemplate]> {
        self.categories.get(category).map(|steps| steps.as_slice())
    }

    pub fn has_category(&self, category: &str) -> bool {
        self.categories.contains_key(category)
    }

    /// Every category must be non-empty and every dependency must point
    /// at an earlier step.
    pub fn validate(&self) -> Result<()> {
        for (category, steps) in &self.categories {
            if steps.is_empty() {
                return Err(EngineError::CatalogError(format!(
                    "category '{}' has no steps",
                    category
                )));
            }
            for (index, step) in steps.iter().enumerate() {
                if let Some(dep) = step.depends_on {
                    if dep >= index {
                        return Err(EngineError::CatalogError(format!(
                            "category '{}' step {} depends on step {} which is not earlier",
                            category, index, dep
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for TaskCatalog {
    fn default() -> Self {
        Self::default_catalog()
    }
}

fn template(tool: &str, depends_on: Option<usize>, arguments: Value) -> StepTemplate {
    StepTemplate {
        tool: tool.to_string(),
        depends_on,
        arguments,
    }
}

//
// ================= Tests =================
//
