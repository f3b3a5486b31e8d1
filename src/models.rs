//! Core data models for the document-intake execution engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

//
// ================= Task Input =================
//

/// One document-intake task as submitted by the caller.
///
/// `payload` is opaque to the engine; only the routing hints
/// (`category`, `document_name`, `entity_id`) are inspected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInput {
    pub entity_id: String,
    pub category: String,
    pub document_name: String,
    pub payload: serde_json::Value,
}

//
// ================= Run State Machine =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Planning,
    Executing,
    Validating,
    Recovering,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Planning => "planning",
            RunState::Executing => "executing",
            RunState::Validating => "validating",
            RunState::Recovering => "recovering",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    MaxRetriesExceeded,
    /// The attempt hit a configuration-level fault (unregistered tool);
    /// retrying cannot help, so the run terminates before the retry budget.
    Unrecoverable,
    Cancelled,
}

/// Terminal outcome of a run, unset until the run reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded {
        /// Map of tool name to the output of its last successful step.
        final_outputs: serde_json::Map<String, serde_json::Value>,
    },
    Failed {
        reason: FailureReason,
        last_verdict: Option<ValidationVerdict>,
    },
}

/// Snapshot of a run as exposed to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: Uuid,
    pub state: RunState,
    pub retry_count: u32,
    pub outcome: Option<RunOutcome>,
    pub created_at: DateTime<Utc>,
}

//
// ================= Plan =================
//

/// Ordered sequence of tool invocations for one run.
///
/// Plans carry no ids, timestamps, or randomness: the planner must
/// produce byte-identical plans for identical task input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub category: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub tool_name: String,
    pub arguments: serde_json::Value,
    /// Index of the prior step whose output feeds this step's arguments.
    pub depends_on: Option<usize>,
    /// Set by the recovery controller: the step already succeeded on a
    /// prior attempt and its result is carried forward, not re-invoked.
    #[serde(default)]
    pub reuse_previous: bool,
}

//
// ================= Step Results =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorClass {
    /// Plan references an unregistered tool; configuration bug, fatal.
    ToolNotFound,
    /// Required upstream step did not succeed; step skipped, not invoked.
    DependencyFailed,
    /// Tool-declared transient failure, candidate for retry.
    Transient,
    /// Tool-declared permanent failure; the step stays failed.
    Permanent,
}

impl StepErrorClass {
    /// Fatal classifications halt the current attempt immediately.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StepErrorClass::ToolNotFound)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepError {
    pub class: StepErrorClass,
    pub message: String,
}

/// Recorded outcome of executing (or skipping) one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: usize,
    pub tool_name: String,
    /// Retry counter value active when this result was produced.
    pub attempt: u32,
    pub success: bool,
    pub output: serde_json::Value,
    pub error: Option<StepError>,
    /// True when the result was carried forward from a prior attempt.
    pub reused: bool,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

//
// ================= Validation =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationError {
    pub step_index: usize,
    pub code: String,
    pub message: String,
}

/// Produced fresh on every validation pass; never merged across attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationVerdict {
    pub passed: bool,
    pub attempt: u32,
    pub errors: Vec<ValidationError>,
    pub checked_at: DateTime<Utc>,
}

//
// ================= Recovery =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryDecision {
    RetryWithPlan {
        plan: Plan,
        backoff_ms: u64,
        retry_count: u32,
    },
    TerminateAsFailed {
        reason: FailureReason,
        retry_count: u32,
    },
}

//
// ================= Execution Log =================
//

/// One immutable fact about a run. Entries are appended in order and
/// never removed; `sequence` is strictly increasing within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: LogEntryKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LogEntryKind {
    StateChanged {
        from: RunState,
        to: RunState,
    },
    PlanCreated {
        plan: Plan,
    },
    StepStarted {
        step_index: usize,
        tool_name: String,
        attempt: u32,
    },
    StepCompleted {
        step_index: usize,
        tool_name: String,
        attempt: u32,
        reused: bool,
    },
    StepFailed {
        step_index: usize,
        tool_name: String,
        attempt: u32,
        class: StepErrorClass,
        message: String,
    },
    ValidationResult {
        verdict: ValidationVerdict,
    },
    RecoveryDecided {
        decision: RecoveryDecision,
    },
    RunCancelled,
}
