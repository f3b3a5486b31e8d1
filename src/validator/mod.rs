//! Validator
//!
//! Deterministic checklist over the current attempt's step results.
//! Pure read: no tool is re-run, no external service is consulted.
//! A failing verdict carries every violation found, not just the first,
//! so the recovery controller and any operator see the complete picture
//! in one pass.

use crate::models::{Plan, StepResult, ValidationError, ValidationVerdict};
use crate::tools::ToolRegistry;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

pub struct ValidationEngine {
    registry: Arc<ToolRegistry>,
}

impl ValidationEngine {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    /// Validate one attempt. `results` must be the current attempt's
    /// step results only; prior attempts are judged by their own verdicts.
    pub fn verify(&self, plan: &Plan, results: &[StepResult], attempt: u32) -> ValidationVerdict {
        let mut errors = Vec::new();

        for (index, step) in plan.steps.iter().enumerate() {
            let result = results.iter().rev().find(|r| r.step_index == index);

            let Some(result) = result else {
                errors.push(ValidationError {
                    step_index: index,
                    code: "missing_result".to_string(),
                    message: format!(
                        "step {} ({}) produced no result this attempt",
                        index, step.tool_name
                    ),
                });
                continue;
            };

            if !result.success {
                let detail = result
                    .error
                    .as_ref()
                    .map(|e| format!("{:?}: {}", e.class, e.message))
                    .unwrap_or_else(|| "unclassified failure".to_string());
                errors.push(ValidationError {
                    step_index: index,
                    code: "step_failed".to_string(),
                    message: format!("step {} ({}) failed: {}", index, step.tool_name, detail),
                });
                continue;
            }

            // Tool-declared well-formedness check over the output.
            if let Some(tool) = self.registry.get(&step.tool_name) {
                if let Err(reason) = tool.check_output(&result.output) {
                    errors.push(ValidationError {
                        step_index: index,
                        code: "ill_formed_output".to_string(),
                        message: format!(
                            "step {} ({}) output is ill-formed: {}",
                            index, step.tool_name, reason
                        ),
                    });
                }
            }
        }

        let passed = errors.is_empty();

        info!(
            attempt = attempt,
            passed = passed,
            violations = errors.len(),
            "Validation completed"
        );

        ValidationVerdict {
            passed,
            attempt,
            errors,
            checked_at: Utc::now(),
        }
    }
}

//
// ================= Tests =================
//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Step, StepError, StepErrorClass};
    use crate::tools::{RunContext, Tool, ToolInput, ToolResult};
    use serde_json::Value;

    struct RecordsTool;

    #[async_trait::async_trait]
    impl Tool for RecordsTool {
        fn name(&self) -> &'static str {
            "records"
        }

        fn description(&self) -> &'static str {
            "Produces records; output must contain at least one"
        }

        fn check_output(&self, output: &Value) -> std::result::Result<(), String> {
            match output.get("records").and_then(Value::as_array) {
                Some(records) if !records.is_empty() => Ok(()),
                _ => Err("no records produced".to_string()),
            }
        }

        async fn execute(&self, _input: &ToolInput, _ctx: &RunContext) -> ToolResult {
            Ok(serde_json::json!({"records": [1]}))
        }
    }

    fn engine() -> ValidationEngine {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(RecordsTool));
        ValidationEngine::new(Arc::new(registry))
    }

    fn plan(step_count: usize) -> Plan {
        Plan {
            category: "test".into(),
            steps: (0..step_count)
                .map(|_| Step {
                    tool_name: "records".into(),
                    arguments: serde_json::json!({}),
                    depends_on: None,
                    reuse_previous: false,
                })
                .collect(),
        }
    }

    fn result(step_index: usize, success: bool, output: Value) -> StepResult {
        StepResult {
            step_index,
            tool_name: "records".into(),
            attempt: 0,
            success,
            output,
            error: if success {
                None
            } else {
                Some(StepError {
                    class: StepErrorClass::Permanent,
                    message: "boom".into(),
                })
            },
            reused: false,
            duration_ms: 1,
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_all_steps_well_formed_passes() {
        let verdict = engine().verify(
            &plan(2),
            &[
                result(0, true, serde_json::json!({"records": [1]})),
                result(1, true, serde_json::json!({"records": [2]})),
            ],
            0,
        );

        assert!(verdict.passed);
        assert!(verdict.errors.is_empty());
    }

    #[test]
    fn test_missing_result_fails() {
        let verdict = engine().verify(
            &plan(2),
            &[result(0, true, serde_json::json!({"records": [1]}))],
            0,
        );

        assert!(!verdict.passed);
        assert_eq!(verdict.errors.len(), 1);
        assert_eq!(verdict.errors[0].code, "missing_result");
        assert_eq!(verdict.errors[0].step_index, 1);
    }

    #[test]
    fn test_failed_step_fails() {
        let verdict = engine().verify(&plan(1), &[result(0, false, Value::Null)], 0);

        assert!(!verdict.passed);
        assert_eq!(verdict.errors[0].code, "step_failed");
        assert!(verdict.errors[0].message.contains("boom"));
    }

    #[test]
    fn test_ill_formed_output_fails() {
        let verdict = engine().verify(
            &plan(1),
            &[result(0, true, serde_json::json!({"records": []}))],
            0,
        );

        assert!(!verdict.passed);
        assert_eq!(verdict.errors[0].code, "ill_formed_output");
    }

    #[test]
    fn test_every_violation_is_reported() {
        let verdict = engine().verify(
            &plan(3),
            &[
                result(0, false, Value::Null),
                result(1, true, serde_json::json!({"records": []})),
            ],
            2,
        );

        assert!(!verdict.passed);
        assert_eq!(verdict.errors.len(), 3);
        let codes: Vec<&str> = verdict.errors.iter().map(|e| e.code.as_str()).collect();
        assert_eq!(codes, vec!["step_failed", "ill_formed_output", "missing_result"]);
        assert_eq!(verdict.attempt, 2);
    }
}
