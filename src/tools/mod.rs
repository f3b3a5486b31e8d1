//! Tool trait and registry
//!
//! Tools are the only side-effecting operations the engine drives.
//! The registry is a closed capability table resolved at process start;
//! plans refer to tools by name.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

pub mod intake;
pub use intake::{create_default_registry, DocumentStore};

//
// ================= Tool I/O =================
//

#[derive(Debug, Clone)]
pub struct ToolInput {
    pub tool_name: String,
    pub arguments: Value,
}

/// Failure reported by a tool, classified by the tool itself.
/// Transient failures are candidates for retry; permanent ones are not.
#[derive(Debug, Clone)]
pub struct ToolError {
    pub transient: bool,
    pub message: String,
}

impl ToolError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            transient: true,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            transient: false,
            message: message.into(),
        }
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let class = if self.transient { "transient" } else { "permanent" };
        write!(f, "{} tool error: {}", class, self.message)
    }
}

impl std::error::Error for ToolError {}

pub type ToolResult = std::result::Result<Value, ToolError>;

/// Per-run context handed to every tool invocation.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub entity_id: String,
    pub attempt: u32,
}

//
// ================= Tool Trait =================
//

/// Trait for a single tool invocable by name from a plan.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Safe to re-run without duplicating external side effects.
    fn idempotent(&self) -> bool {
        true
    }

    /// Has externally visible side effects (storage writes, alert emission)
    /// versus being pure computation.
    fn side_effecting(&self) -> bool {
        false
    }

    /// Well-formedness predicate applied by the validator to a successful
    /// output. The default accepts anything.
    fn check_output(&self, _output: &Value) -> std::result::Result<(), String> {
        Ok(())
    }

    async fn execute(&self, input: &ToolInput, ctx: &RunContext) -> ToolResult;
}

//
// ================= Registry =================
//

/// Tool registry for looking up tools by name.
/// Static after start-up; read-only to the engine.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

//
// ================= Tests =================
//

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn description(&self) -> &'static str {
            "Return the arguments unchanged"
        }

        async fn execute(&self, input: &ToolInput, _ctx: &RunContext) -> ToolResult {
            Ok(input.arguments.clone())
        }
    }

    #[tokio::test]
    async fn test_registry_lookup_and_execute() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.list(), vec!["echo"]);

        let ctx = RunContext {
            run_id: Uuid::new_v4(),
            entity_id: "entity_1".into(),
            attempt: 0,
        };
        let input = ToolInput {
            tool_name: "echo".into(),
            arguments: serde_json::json!({"hello": "world"}),
        };

        let tool = registry.get("echo").unwrap();
        let output = tool.execute(&input, &ctx).await.unwrap();
        assert_eq!(output["hello"], "world");
    }

    #[test]
    fn test_tool_error_classification() {
        let transient = ToolError::transient("store unavailable");
        let permanent = ToolError::permanent("unsupported format");

        assert!(transient.transient);
        assert!(!permanent.transient);
        assert!(transient.to_string().contains("transient"));
        assert!(permanent.to_string().contains("permanent"));
    }
}
