//! Executor
//!
//! Walks a plan in order, invoking tools through the registry. Step
//! failures never cross this boundary as errors: every outcome is
//! recorded as a StepResult plus log entries, and only a fatal
//! classification (unregistered tool) halts the attempt early.

use crate::models::{LogEntryKind, Plan, Step, StepError, StepErrorClass, StepResult};
use crate::tools::{RunContext, ToolInput, ToolRegistry};
use crate::trace::ExecutionLog;
use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

pub struct Executor {
    registry: Arc<ToolRegistry>,
}

impl Executor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    /// Execute one attempt of a plan.
    ///
    /// `prior_results` is the run's full working memory from earlier
    /// attempts, consulted when a step is marked for carry-forward.
    /// `cancelled` is checked between steps only; an in-flight tool
    /// invocation is always allowed to complete.
    pub async fn execute_plan(
        &self,
        plan: &Plan,
        ctx: &RunContext,
        prior_results: &[StepResult],
        log: &ExecutionLog,
        cancelled: &AtomicBool,
    ) -> Vec<StepResult> {
        let mut results: Vec<StepResult> = Vec::with_capacity(plan.steps.len());

        debug!(run_id = %ctx.run_id, attempt = ctx.attempt, "Starting plan execution");

        for (index, step) in plan.steps.iter().enumerate() {
            if cancelled.load(Ordering::SeqCst) {
                warn!(run_id = %ctx.run_id, step_index = index, "Cancellation observed, stopping attempt");
                break;
            }

            if step.reuse_previous {
                if let Some(result) = self.carry_forward(index, step, ctx, prior_results, log) {
                    results.push(result);
                    continue;
                }
                // No prior success to reuse; fall through and invoke.
            }

            // Dependency check against this attempt's results.
            if let Some(dep) = step.depends_on {
                let dep_ok = results
                    .iter()
                    .any(|r| r.step_index == dep && r.success);
                if !dep_ok {
                    warn!(
                        run_id = %ctx.run_id,
                        step_index = index,
                        dependency = dep,
                        "Skipping step, dependency did not succeed"
                    );
                    results.push(self.record_failure(
                        index,
                        step,
                        ctx,
                        StepErrorClass::DependencyFailed,
                        format!("step {} did not succeed", dep),
                        0,
                        log,
                    ));
                    continue;
                }
            }

            let arguments = inject_upstream(step, &results);

            log.append(LogEntryKind::StepStarted {
                step_index: index,
                tool_name: step.tool_name.clone(),
                attempt: ctx.attempt,
            });

            let Some(tool) = self.registry.get(&step.tool_name) else {
                warn!(
                    run_id = %ctx.run_id,
                    tool_name = %step.tool_name,
                    "Tool not registered, halting attempt"
                );
                results.push(self.record_failure(
                    index,
                    step,
                    ctx,
                    StepErrorClass::ToolNotFound,
                    format!("tool '{}' is not registered", step.tool_name),
                    0,
                    log,
                ));
                break;
            };

            let input = ToolInput {
                tool_name: step.tool_name.clone(),
                arguments,
            };

            let start = Instant::now();
            match tool.execute(&input, ctx).await {
                Ok(output) => {
                    let duration_ms = start.elapsed().as_millis() as u64;
                    log.append(LogEntryKind::StepCompleted {
                        step_index: index,
                        tool_name: step.tool_name.clone(),
                        attempt: ctx.attempt,
                        reused: false,
                    });
                    results.push(StepResult {
                        step_index: index,
                        tool_name: step.tool_name.clone(),
                        attempt: ctx.attempt,
                        success: true,
                        output,
                        error: None,
                        reused: false,
                        duration_ms,
                        completed_at: Utc::now(),
                    });
                }
                Err(e) => {
                    let duration_ms = start.elapsed().as_millis() as u64;
                    let class = if e.transient {
                        StepErrorClass::Transient
                    } else {
                        StepErrorClass::Permanent
                    };
                    warn!(
                        run_id = %ctx.run_id,
                        step_index = index,
                        tool_name = %step.tool_name,
                        error = %e,
                        "Tool execution failed"
                    );
                    results.push(self.record_failure(
                        index,
                        step,
                        ctx,
                        class,
                        e.message,
                        duration_ms,
                        log,
                    ));
                    // Non-fatal: later steps may still produce partial value.
                }
            }
        }

        debug!(
            run_id = %ctx.run_id,
            attempt = ctx.attempt,
            result_count = results.len(),
            "Plan execution completed"
        );

        results
    }

    /// Reuse the latest successful result of a prior attempt for this
    /// step, retagged with the current attempt. The tool is not invoked,
    /// so its side effects are not duplicated.
    fn carry_forward(
        &self,
        index: usize,
        step: &Step,
        ctx: &RunContext,
        prior_results: &[StepResult],
        log: &ExecutionLog,
    ) -> Option<StepResult> {
        let prior = prior_results
            .iter()
            .rev()
            .find(|r| r.step_index == index && r.success)?;

        log.append(LogEntryKind::StepCompleted {
            step_index: index,
            tool_name: step.tool_name.clone(),
            attempt: ctx.attempt,
            reused: true,
        });

        Some(StepResult {
            step_index: index,
            tool_name: step.tool_name.clone(),
            attempt: ctx.attempt,
            success: true,
            output: prior.output.clone(),
            error: None,
            reused: true,
            duration_ms: 0,
            completed_at: Utc::now(),
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn record_failure(
        &self,
        index: usize,
        step: &Step,
        ctx: &RunContext,
        class: StepErrorClass,
        message: String,
        duration_ms: u64,
        log: &ExecutionLog,
    ) -> StepResult {
        log.append(LogEntryKind::StepFailed {
            step_index: index,
            tool_name: step.tool_name.clone(),
            attempt: ctx.attempt,
            class,
            message: message.clone(),
        });

        StepResult {
            step_index: index,
            tool_name: step.tool_name.clone(),
            attempt: ctx.attempt,
            success: false,
            output: Value::Null,
            error: Some(StepError { class, message }),
            reused: false,
            duration_ms,
            completed_at: Utc::now(),
        }
    }
}

/// Merge the dependency step's output into the arguments under
/// `upstream`, so downstream tools see what they were planned against.
fn inject_upstream(step: &Step, results: &[StepResult]) -> Value {
    let Some(dep) = step.depends_on else {
        return step.arguments.clone();
    };
    let Some(dep_result) = results.iter().rev().find(|r| r.step_index == dep && r.success)
    else {
        return step.arguments.clone();
    };

    let mut arguments = step.arguments.clone();
    if let Value::Object(map) = &mut arguments {
        map.insert("upstream".to_string(), dep_result.output.clone());
    }
    arguments
}

//
// ================= Tests =================
//
