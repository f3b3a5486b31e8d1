//! Recovery controller
//!
//! Invoked once per failing verdict. Increments the retry counter,
//! decides between retrying with a replacement plan (bounded exponential
//! backoff) and terminating the run, and restricts the replacement plan
//! to the failed steps and their transitive dependents so that already
//! successful side-effecting work is not repeated.

use crate::models::{
    FailureReason, Plan, RecoveryDecision, StepErrorClass, StepResult, ValidationVerdict,
};
use crate::tools::ToolRegistry;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 250,
            backoff_cap_ms: 10_000,
        }
    }
}

impl RecoveryConfig {
    /// Defaults, overridable through MAX_RETRIES, BACKOFF_BASE_MS and
    /// BACKOFF_CAP_MS. Unparsable or out-of-range values fall back to
    /// the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        fn read<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|v| v.parse().ok())
        }

        Self {
            max_retries: read::<u32>("MAX_RETRIES").unwrap_or(defaults.max_retries),
            backoff_base_ms: read::<u64>("BACKOFF_BASE_MS").unwrap_or(defaults.backoff_base_ms),
            backoff_cap_ms: read::<u64>("BACKOFF_CAP_MS").unwrap_or(defaults.backoff_cap_ms),
        }
    }
}

pub struct RecoveryController {
    config: RecoveryConfig,
    registry: Arc<ToolRegistry>,
}

impl RecoveryController {
    pub fn new(config: RecoveryConfig, registry: Arc<ToolRegistry>) -> Self {
        Self { config, registry }
    }

    /// Decide what to do after a failing verdict.
    ///
    /// The retry counter is incremented exactly once per invocation,
    /// whether the decision is to retry or to terminate.
    pub fn decide(
        &self,
        plan: &Plan,
        verdict: &ValidationVerdict,
        attempt_results: &[StepResult],
        retry_count: u32,
    ) -> RecoveryDecision {
        let retry_count = retry_count + 1;

        // An unregistered tool is a configuration bug; no number of
        // retries will register it.
        let unrecoverable = attempt_results.iter().any(|r| {
            r.error
                .as_ref()
                .map(|e| e.class == StepErrorClass::ToolNotFound)
                .unwrap_or(false)
        });
        if unrecoverable {
            warn!(retry_count, "Attempt hit an unregistered tool, terminating");
            return RecoveryDecision::TerminateAsFailed {
                reason: FailureReason::Unrecoverable,
                retry_count,
            };
        }

        if retry_count >= self.config.max_retries {
            warn!(
                retry_count,
                max_retries = self.config.max_retries,
                "Retry budget exhausted, terminating"
            );
            return RecoveryDecision::TerminateAsFailed {
                reason: FailureReason::MaxRetriesExceeded,
                retry_count,
            };
        }

        let plan = self.build_replacement_plan(plan, verdict, attempt_results);
        let backoff_ms = self.backoff_for(retry_count);

        info!(
            retry_count,
            backoff_ms,
            rerun_steps = plan.steps.iter().filter(|s| !s.reuse_previous).count(),
            "Scheduling retry"
        );

        RecoveryDecision::RetryWithPlan {
            plan,
            backoff_ms,
            retry_count,
        }
    }

    /// Exponential backoff: base * 2^(retry-1), capped.
    pub fn backoff_for(&self, retry_count: u32) -> u64 {
        let exponent = retry_count.saturating_sub(1).min(20);
        let delay = self.config.backoff_base_ms.saturating_mul(1u64 << exponent);
        delay.min(self.config.backoff_cap_ms)
    }

    /// Restrict the plan to what actually has to run again.
    ///
    /// A step re-runs when the verdict flagged it, when it has no
    /// successful result, or when any step it depends on re-runs.
    /// Everything else is carried forward, provided its tool declares
    /// itself safe to skip (idempotent, or side-effecting work that
    /// must not be duplicated).
    fn build_replacement_plan(
        &self,
        plan: &Plan,
        verdict: &ValidationVerdict,
        attempt_results: &[StepResult],
    ) -> Plan {
        let flagged: HashSet<usize> = verdict.errors.iter().map(|e| e.step_index).collect();

        let succeeded: HashSet<usize> = attempt_results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.step_index)
            .collect();

        let mut rerun: HashSet<usize> = HashSet::new();
        for (index, step) in plan.steps.iter().enumerate() {
            let dep_reruns = step
                .depends_on
                .map(|dep| rerun.contains(&dep))
                .unwrap_or(false);

            let safe_to_skip = self
                .registry
                .get(&step.tool_name)
                .map(|tool| tool.idempotent() || tool.side_effecting())
                .unwrap_or(false);

            if flagged.contains(&index)
                || !succeeded.contains(&index)
                || dep_reruns
                || !safe_to_skip
            {
                rerun.insert(index);
            }
        }

        let steps = plan
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| {
                let mut step = step.clone();
                step.reuse_previous = !rerun.contains(&index);
                step
            })
            .collect();

        Plan {
            category: plan.category.clone(),
            steps,
        }
    }
}

//
// ================= Tests =================
//
