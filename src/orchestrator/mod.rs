//! Orchestrator: drives the run state machine
//!
//! Planning → Executing → Validating → {Succeeded | Recovering},
//! Recovering → {Executing | Failed}. Every transition is recorded in
//! the execution log before the next component runs, so the log alone
//! reconstructs the full history of a run, discarded attempts included.

use crate::error::{EngineError, Result};
use crate::executor::Executor;
use crate::models::{
    FailureReason, LogEntryKind, Plan, RecoveryDecision, RunOutcome, RunState, RunStatus,
    StepResult, TaskInput, ValidationVerdict,
};
use crate::planner::Planner;
use crate::recovery::RecoveryController;
use crate::store::{RunRecord, RunStore};
use crate::tools::RunContext;
use crate::trace::{compute_task_hash, ExecutionLog};
use crate::validator::ValidationEngine;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Defensive guard against runaway catalogue entries.
const MAX_STEPS_PER_PLAN: usize = 50;

/// Live bookkeeping for one run. The log and the cancel flag are shared
/// with the spawned driver task; the watch channel carries state
/// snapshots out to callers.
struct RunHandle {
    task: Arc<TaskInput>,
    log: ExecutionLog,
    cancelled: Arc<AtomicBool>,
    status: watch::Sender<RunStatus>,
}

/// The engine half shared with every spawned run driver: everything a
/// run needs after planning is done, plus the live-run map. Handles of
/// terminal runs are retired from the map once the archive holds their
/// record; queries for them are served from the archive.
struct Engine {
    executor: Executor,
    validator: ValidationEngine,
    recovery: RecoveryController,
    run_store: Arc<dyn RunStore>,
    runs: RwLock<HashMap<Uuid, Arc<RunHandle>>>,
}

/// Top-level driver owning all runs.
///
/// Each run executes as its own tokio task; a run waiting out a backoff
/// delay suspends only itself.
pub struct Orchestrator {
    planner: Box<dyn Planner>,
    engine: Arc<Engine>,
}

impl Orchestrator {
    pub fn new(
        planner: Box<dyn Planner>,
        executor: Executor,
        validator: ValidationEngine,
        recovery: RecoveryController,
        run_store: Arc<dyn RunStore>,
    ) -> Self {
        Self {
            planner,
            engine: Arc::new(Engine {
                executor,
                validator,
                recovery,
                run_store,
                runs: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Begin a new run. Returns immediately with the run id, or rejects
    /// synchronously when the input fails shape validation or names a
    /// category the catalogue does not know. No run is registered and
    /// no log is created on rejection.
    pub async fn start_run(&self, task: TaskInput) -> Result<Uuid> {
        validate_task_shape(&task)?;

        // Planning is pure and cheap; doing it here gives the caller a
        // synchronous UnknownTaskCategory instead of a doomed run.
        let plan = self.planner.create_plan(&task)?;
        if plan.steps.len() > MAX_STEPS_PER_PLAN {
            return Err(EngineError::InvalidPlan(format!(
                "plan exceeds {} steps",
                MAX_STEPS_PER_PLAN
            )));
        }

        let run_id = Uuid::new_v4();
        let created_at = Utc::now();
        let task = Arc::new(task);

        let (status_tx, _) = watch::channel(RunStatus {
            run_id,
            state: RunState::Planning,
            retry_count: 0,
            outcome: None,
            created_at,
        });

        let handle = Arc::new(RunHandle {
            task: task.clone(),
            log: ExecutionLog::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
            status: status_tx,
        });

        {
            let mut runs = self.engine.runs.write().await;
            runs.insert(run_id, handle.clone());
        }

        info!(
            run_id = %run_id,
            entity_id = %task.entity_id,
            category = %task.category,
            "Run admitted"
        );

        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            engine.drive_run(run_id, handle, plan).await;
        });

        Ok(run_id)
    }

    /// Non-blocking snapshot of a run's state and outcome.
    pub async fn get_run_result(&self, run_id: Uuid) -> Result<RunStatus> {
        if let Some(handle) = self.live_handle(run_id).await {
            return Ok(handle.status.borrow().clone());
        }
        self.archived_status(run_id).await
    }

    /// Await the terminal snapshot of a run.
    pub async fn wait_for_result(&self, run_id: Uuid) -> Result<RunStatus> {
        let Some(handle) = self.live_handle(run_id).await else {
            return self.archived_status(run_id).await;
        };
        let mut rx = handle.status.subscribe();
        let status = rx
            .wait_for(|status| status.state.is_terminal())
            .await
            .map_err(|_| EngineError::RunNotFound(run_id))?;
        Ok(status.clone())
    }

    /// Full observability trace, available mid-run and after the run
    /// went terminal.
    pub async fn get_execution_log(&self, run_id: Uuid) -> Result<Vec<crate::models::LogEntry>> {
        if let Some(handle) = self.live_handle(run_id).await {
            return Ok(handle.log.snapshot());
        }
        let record = self
            .engine
            .run_store
            .load_record(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        Ok(record.log.as_ref().clone())
    }

    /// Request cancellation. Takes effect at the next component or step
    /// boundary; an in-flight tool invocation completes first.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<()> {
        let Some(handle) = self.live_handle(run_id).await else {
            // A retired handle always belongs to a terminal run.
            self.archived_status(run_id).await?;
            return Err(EngineError::RunAlreadyTerminal(run_id));
        };
        if handle.status.borrow().state.is_terminal() {
            return Err(EngineError::RunAlreadyTerminal(run_id));
        }
        handle.cancelled.store(true, Ordering::SeqCst);
        info!(run_id = %run_id, "Cancellation requested");
        Ok(())
    }

    async fn live_handle(&self, run_id: Uuid) -> Option<Arc<RunHandle>> {
        let runs = self.engine.runs.read().await;
        runs.get(&run_id).cloned()
    }

    /// Status of a run whose handle has been retired to the archive.
    async fn archived_status(&self, run_id: Uuid) -> Result<RunStatus> {
        let record = self
            .engine
            .run_store
            .load_record(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;

        let state = match record.outcome {
            RunOutcome::Succeeded { .. } => RunState::Succeeded,
            RunOutcome::Failed { .. } => RunState::Failed,
        };
        Ok(RunStatus {
            run_id: record.run_id,
            state,
            retry_count: record.retry_count,
            outcome: Some(record.outcome),
            created_at: record.created_at,
        })
    }
}

impl Engine {
    /// The run state machine. Runs to a terminal state and archives the
    /// record; never returns an error, every failure is captured in the
    /// run's own outcome.
    async fn drive_run(&self, run_id: Uuid, handle: Arc<RunHandle>, initial_plan: Plan) {
        let started_at = Utc::now();
        let mut plan = initial_plan;
        let mut retry_count: u32 = 0;
        let mut memory: Vec<StepResult> = Vec::new();
        let mut verdicts: Vec<ValidationVerdict> = Vec::new();
        let mut state = RunState::Planning;

        handle.log.append(LogEntryKind::PlanCreated { plan: plan.clone() });
        state = self.transition(&handle, state, RunState::Executing, retry_count);

        loop {
            if handle.cancelled.load(Ordering::SeqCst) {
                self.finalize_cancelled(run_id, &handle, state, retry_count, &plan, memory, verdicts, started_at)
                    .await;
                return;
            }

            let ctx = RunContext {
                run_id,
                entity_id: handle.task.entity_id.clone(),
                attempt: retry_count,
            };

            let attempt_results = self
                .executor
                .execute_plan(&plan, &ctx, &memory, &handle.log, &handle.cancelled)
                .await;
            memory.extend(attempt_results.iter().cloned());

            if handle.cancelled.load(Ordering::SeqCst) {
                self.finalize_cancelled(run_id, &handle, state, retry_count, &plan, memory, verdicts, started_at)
                    .await;
                return;
            }

            state = self.transition(&handle, state, RunState::Validating, retry_count);

            let verdict = self.validator.verify(&plan, &attempt_results, retry_count);
            handle.log.append(LogEntryKind::ValidationResult {
                verdict: verdict.clone(),
            });
            verdicts.push(verdict.clone());

            if verdict.passed {
                let final_outputs = collect_final_outputs(&attempt_results);
                self.transition(&handle, state, RunState::Succeeded, retry_count);
                let outcome = RunOutcome::Succeeded { final_outputs };
                let archived = self
                    .archive(run_id, &handle, &plan, memory, verdicts, &outcome, retry_count, started_at)
                    .await;
                self.publish(&handle, RunState::Succeeded, retry_count, Some(outcome));
                if archived {
                    self.retire(run_id).await;
                }
                info!(run_id = %run_id, retry_count, "Run succeeded");
                return;
            }

            state = self.transition(&handle, state, RunState::Recovering, retry_count);

            let decision =
                self.recovery
                    .decide(&plan, &verdict, &attempt_results, retry_count);
            handle.log.append(LogEntryKind::RecoveryDecided {
                decision: decision.clone(),
            });

            match decision {
                RecoveryDecision::RetryWithPlan {
                    plan: replacement,
                    backoff_ms,
                    retry_count: next_count,
                } => {
                    retry_count = next_count;
                    self.publish(&handle, state, retry_count, None);

                    debug!(run_id = %run_id, retry_count, backoff_ms, "Backing off before retry");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;

                    if handle.cancelled.load(Ordering::SeqCst) {
                        self.finalize_cancelled(run_id, &handle, state, retry_count, &plan, memory, verdicts, started_at)
                            .await;
                        return;
                    }

                    plan = replacement;
                    state = self.transition(&handle, state, RunState::Executing, retry_count);
                }
                RecoveryDecision::TerminateAsFailed {
                    reason,
                    retry_count: final_count,
                } => {
                    retry_count = final_count;
                    self.transition(&handle, state, RunState::Failed, retry_count);
                    let outcome = RunOutcome::Failed {
                        reason,
                        last_verdict: Some(verdict),
                    };
                    let archived = self
                        .archive(run_id, &handle, &plan, memory, verdicts, &outcome, retry_count, started_at)
                        .await;
                    self.publish(&handle, RunState::Failed, retry_count, Some(outcome));
                    if archived {
                        self.retire(run_id).await;
                    }
                    warn!(run_id = %run_id, retry_count, ?reason, "Run failed");
                    return;
                }
            }
        }
    }

    /// Record a state transition in the log, then publish it.
    fn transition(
        &self,
        handle: &RunHandle,
        from: RunState,
        to: RunState,
        retry_count: u32,
    ) -> RunState {
        handle
            .log
            .append(LogEntryKind::StateChanged { from, to });
        if !to.is_terminal() {
            self.publish(handle, to, retry_count, None);
        }
        to
    }

    fn publish(
        &self,
        handle: &RunHandle,
        state: RunState,
        retry_count: u32,
        outcome: Option<RunOutcome>,
    ) {
        handle.status.send_modify(|status| {
            status.state = state;
            status.retry_count = retry_count;
            if outcome.is_some() {
                status.outcome = outcome;
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize_cancelled(
        &self,
        run_id: Uuid,
        handle: &RunHandle,
        state: RunState,
        retry_count: u32,
        plan: &Plan,
        memory: Vec<StepResult>,
        verdicts: Vec<ValidationVerdict>,
        started_at: chrono::DateTime<Utc>,
    ) {
        handle.log.append(LogEntryKind::RunCancelled);
        self.transition(handle, state, RunState::Failed, retry_count);

        let outcome = RunOutcome::Failed {
            reason: FailureReason::Cancelled,
            last_verdict: verdicts.last().cloned(),
        };
        let archived = self
            .archive(run_id, handle, plan, memory, verdicts, &outcome, retry_count, started_at)
            .await;
        self.publish(handle, RunState::Failed, retry_count, Some(outcome));
        if archived {
            self.retire(run_id).await;
        }
        info!(run_id = %run_id, "Run cancelled");
    }

    /// Persist the terminal record, including the full log snapshot.
    /// Returns whether the archive accepted it; the live handle is only
    /// retired once the record is durable.
    #[allow(clippy::too_many_arguments)]
    async fn archive(
        &self,
        run_id: Uuid,
        handle: &RunHandle,
        plan: &Plan,
        memory: Vec<StepResult>,
        verdicts: Vec<ValidationVerdict>,
        outcome: &RunOutcome,
        retry_count: u32,
        started_at: chrono::DateTime<Utc>,
    ) -> bool {
        let record = RunRecord {
            run_id,
            entity_id: handle.task.entity_id.clone(),
            task: handle.task.clone(),
            task_hash: compute_task_hash(&handle.task),
            final_plan: Arc::new(plan.clone()),
            step_results: Arc::new(memory),
            verdicts: Arc::new(verdicts),
            log: Arc::new(handle.log.snapshot()),
            outcome: outcome.clone(),
            retry_count,
            created_at: started_at,
            finished_at: Utc::now(),
        };

        match self.run_store.persist_record(record).await {
            Ok(()) => true,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Failed to archive run record");
                false
            }
        }
    }

    /// Drop the live handle; queries are served from the archive now.
    async fn retire(&self, run_id: Uuid) {
        let mut runs = self.runs.write().await;
        runs.remove(&run_id);
    }
}

fn validate_task_shape(task: &TaskInput) -> Result<()> {
    if task.entity_id.trim().is_empty() {
        return Err(EngineError::InvalidTaskInput("entity_id is empty".into()));
    }
    if task.document_name.trim().is_empty() {
        return Err(EngineError::InvalidTaskInput(
            "document_name is empty".into(),
        ));
    }
    if task.category.trim().is_empty() {
        return Err(EngineError::InvalidTaskInput("category is empty".into()));
    }
    if !task.payload.is_object() {
        return Err(EngineError::InvalidTaskInput(
            "payload must be a JSON object".into(),
        ));
    }
    Ok(())
}

/// Tool name → output of its successful step in the final attempt.
fn collect_final_outputs(
    attempt_results: &[StepResult],
) -> serde_json::Map<String, serde_json::Value> {
    let mut outputs = serde_json::Map::new();
    for result in attempt_results {
        if result.success {
            outputs.insert(result.tool_name.clone(), result.output.clone());
        }
    }
    outputs
}

//
// ================= Tests =================
//

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TaskCatalog;
    use crate::models::{LogEntry, StepErrorClass};
    use crate::planner::CatalogPlanner;
    use crate::recovery::RecoveryConfig;
    use crate::store::InMemoryRunStore;
    use crate::tools::{Tool, ToolError, ToolInput, ToolRegistry, ToolResult};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Succeeds always, counts invocations. Declared side-effecting and
    /// non-idempotent so successful runs are carried forward on retry.
    struct WriterTool {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Tool for WriterTool {
        fn name(&self) -> &'static str {
            "writer"
        }

        fn description(&self) -> &'static str {
            "Always succeeds, must not be re-invoked on retry"
        }

        fn idempotent(&self) -> bool {
            false
        }

        fn side_effecting(&self) -> bool {
            true
        }

        async fn execute(&self, _input: &ToolInput, _ctx: &RunContext) -> ToolResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"written": true}))
        }
    }

    /// Fails transiently for the first `fail_times` invocations.
    struct FlakyTool {
        fail_times: usize,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Tool for FlakyTool {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn description(&self) -> &'static str {
            "Transiently fails, then succeeds"
        }

        async fn execute(&self, _input: &ToolInput, _ctx: &RunContext) -> ToolResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_times {
                Err(ToolError::transient("not yet"))
            } else {
                Ok(json!({"recovered": true}))
            }
        }
    }

    struct SlowTool {
        tool_name: &'static str,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &'static str {
            self.tool_name
        }

        fn description(&self) -> &'static str {
            "Sleeps, then succeeds"
        }

        async fn execute(&self, _input: &ToolInput, _ctx: &RunContext) -> ToolResult {
            tokio::time::sleep(Duration::from_millis(100)).await;
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"slow": true}))
        }
    }

    fn catalog(tools: &[&str]) -> TaskCatalog {
        let raw = serde_json::json!({
            "categories": {
                "test": tools.iter().map(|t| json!({"tool": t})).collect::<Vec<_>>(),
            }
        });
        TaskCatalog::from_json_str(&raw.to_string()).unwrap()
    }

    fn orchestrator(registry: ToolRegistry, catalog: TaskCatalog) -> Arc<Orchestrator> {
        let registry = Arc::new(registry);
        let config = RecoveryConfig {
            max_retries: 3,
            backoff_base_ms: 1,
            backoff_cap_ms: 10,
        };
        Arc::new(Orchestrator::new(
            Box::new(CatalogPlanner::new(catalog)),
            Executor::new(registry.clone()),
            ValidationEngine::new(registry.clone()),
            RecoveryController::new(config, registry),
            Arc::new(InMemoryRunStore::new()),
        ))
    }

    fn task() -> TaskInput {
        TaskInput {
            entity_id: "entity_1".into(),
            category: "test".into(),
            document_name: "doc.txt".into(),
            payload: json!({"content": "hello"}),
        }
    }

    fn count_kind(entries: &[LogEntry], predicate: impl Fn(&LogEntryKind) -> bool) -> usize {
        entries.iter().filter(|e| predicate(&e.kind)).count()
    }

    #[tokio::test]
    async fn test_clean_run_succeeds_without_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(WriterTool { calls: calls.clone() }));

        let orchestrator = orchestrator(registry, catalog(&["writer"]));
        let run_id = orchestrator.start_run(task()).await.unwrap();
        let status = orchestrator.wait_for_result(run_id).await.unwrap();

        assert_eq!(status.state, RunState::Succeeded);
        assert_eq!(status.retry_count, 0);
        match status.outcome.unwrap() {
            RunOutcome::Succeeded { final_outputs } => {
                assert_eq!(final_outputs["writer"]["written"], true);
            }
            other => panic!("expected success, got {:?}", other),
        }

        let entries = orchestrator.get_execution_log(run_id).await.unwrap();
        let validations = count_kind(&entries, |k| {
            matches!(k, LogEntryKind::ValidationResult { verdict } if verdict.passed)
        });
        assert_eq!(validations, 1);
        assert_eq!(
            count_kind(&entries, |k| matches!(k, LogEntryKind::ValidationResult { .. })),
            1
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Terminal state is the last entry; nothing after it.
        match &entries.last().unwrap().kind {
            LogEntryKind::StateChanged { to, .. } => assert_eq!(*to, RunState::Succeeded),
            other => panic!("unexpected final entry {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_without_reinvoking_writer() {
        let writer_calls = Arc::new(AtomicUsize::new(0));
        let flaky_calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(WriterTool {
            calls: writer_calls.clone(),
        }));
        registry.register(Arc::new(FlakyTool {
            fail_times: 2,
            calls: flaky_calls.clone(),
        }));

        let orchestrator = orchestrator(registry, catalog(&["writer", "flaky"]));
        let run_id = orchestrator.start_run(task()).await.unwrap();
        let status = orchestrator.wait_for_result(run_id).await.unwrap();

        assert_eq!(status.state, RunState::Succeeded);
        assert_eq!(status.retry_count, 2);
        // Flaky ran on every attempt, the successful writer only once.
        assert_eq!(flaky_calls.load(Ordering::SeqCst), 3);
        assert_eq!(writer_calls.load(Ordering::SeqCst), 1);

        let entries = orchestrator.get_execution_log(run_id).await.unwrap();
        let writer_starts = count_kind(&entries, |k| {
            matches!(k, LogEntryKind::StepStarted { tool_name, .. } if tool_name == "writer")
        });
        assert_eq!(writer_starts, 1);
        let reused = count_kind(&entries, |k| {
            matches!(k, LogEntryKind::StepCompleted { reused: true, .. })
        });
        assert_eq!(reused, 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FlakyTool {
            fail_times: usize::MAX,
            calls,
        }));

        let orchestrator = orchestrator(registry, catalog(&["flaky"]));
        let run_id = orchestrator.start_run(task()).await.unwrap();
        let status = orchestrator.wait_for_result(run_id).await.unwrap();

        assert_eq!(status.state, RunState::Failed);
        assert_eq!(status.retry_count, 3);
        match status.outcome.unwrap() {
            RunOutcome::Failed {
                reason,
                last_verdict,
            } => {
                assert_eq!(reason, FailureReason::MaxRetriesExceeded);
                let verdict = last_verdict.unwrap();
                assert!(!verdict.passed);
                assert_eq!(verdict.errors[0].code, "step_failed");
            }
            other => panic!("expected failure, got {:?}", other),
        }

        let entries = orchestrator.get_execution_log(run_id).await.unwrap();
        let failed_validations = count_kind(&entries, |k| {
            matches!(k, LogEntryKind::ValidationResult { verdict } if !verdict.passed)
        });
        assert_eq!(failed_validations, 3);
    }

    #[tokio::test]
    async fn test_unregistered_tool_is_unrecoverable() {
        let registry = ToolRegistry::new();
        let orchestrator = orchestrator(registry, catalog(&["ghost"]));

        let run_id = orchestrator.start_run(task()).await.unwrap();
        let status = orchestrator.wait_for_result(run_id).await.unwrap();

        assert_eq!(status.state, RunState::Failed);
        match status.outcome.unwrap() {
            RunOutcome::Failed { reason, .. } => {
                assert_eq!(reason, FailureReason::Unrecoverable)
            }
            other => panic!("expected failure, got {:?}", other),
        }

        let entries = orchestrator.get_execution_log(run_id).await.unwrap();
        let not_found = count_kind(&entries, |k| {
            matches!(
                k,
                LogEntryKind::StepFailed {
                    class: StepErrorClass::ToolNotFound,
                    ..
                }
            )
        });
        assert_eq!(not_found, 1);
    }

    #[tokio::test]
    async fn test_invalid_input_and_unknown_category_reject_synchronously() {
        let registry = ToolRegistry::new();
        let orchestrator = orchestrator(registry, catalog(&["writer"]));

        let mut no_entity = task();
        no_entity.entity_id = "  ".into();
        assert!(matches!(
            orchestrator.start_run(no_entity).await.unwrap_err(),
            EngineError::InvalidTaskInput(_)
        ));

        let mut bad_payload = task();
        bad_payload.payload = json!("just a string");
        assert!(matches!(
            orchestrator.start_run(bad_payload).await.unwrap_err(),
            EngineError::InvalidTaskInput(_)
        ));

        let mut unknown = task();
        unknown.category = "spreadsheet".into();
        assert!(matches!(
            orchestrator.start_run(unknown).await.unwrap_err(),
            EngineError::UnknownTaskCategory(_)
        ));
    }

    #[tokio::test]
    async fn test_identical_inputs_produce_identical_plans() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(WriterTool { calls }));

        let orchestrator = orchestrator(registry, catalog(&["writer"]));
        let first = orchestrator.start_run(task()).await.unwrap();
        let second = orchestrator.start_run(task()).await.unwrap();
        orchestrator.wait_for_result(first).await.unwrap();
        orchestrator.wait_for_result(second).await.unwrap();

        let plan_of = |entries: &[LogEntry]| -> Vec<u8> {
            entries
                .iter()
                .find_map(|e| match &e.kind {
                    LogEntryKind::PlanCreated { plan } => {
                        Some(serde_json::to_vec(plan).unwrap())
                    }
                    _ => None,
                })
                .unwrap()
        };

        let first_plan = plan_of(&orchestrator.get_execution_log(first).await.unwrap());
        let second_plan = plan_of(&orchestrator.get_execution_log(second).await.unwrap());
        assert_eq!(first_plan, second_plan);
    }

    #[tokio::test]
    async fn test_log_is_append_only_while_running() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(SlowTool {
            tool_name: "slow",
            calls,
        }));

        let orchestrator = orchestrator(registry, catalog(&["slow", "slow", "slow"]));
        let run_id = orchestrator.start_run(task()).await.unwrap();

        let mut last_len = 0;
        for _ in 0..5 {
            let entries = orchestrator.get_execution_log(run_id).await.unwrap();
            assert!(entries.len() >= last_len, "log shrank");
            for pair in entries.windows(2) {
                assert!(pair[1].sequence > pair[0].sequence);
                assert!(pair[1].timestamp >= pair[0].timestamp);
            }
            last_len = entries.len();
            tokio::time::sleep(Duration::from_millis(40)).await;
        }

        orchestrator.wait_for_result(run_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_stops_further_invocations() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(SlowTool {
            tool_name: "slow",
            calls: calls.clone(),
        }));

        let orchestrator = orchestrator(registry, catalog(&["slow", "slow", "slow"]));
        let run_id = orchestrator.start_run(task()).await.unwrap();

        // Cancel while the first step is still in flight.
        tokio::time::sleep(Duration::from_millis(30)).await;
        orchestrator.cancel_run(run_id).await.unwrap();

        let status = orchestrator.wait_for_result(run_id).await.unwrap();
        assert_eq!(status.state, RunState::Failed);
        match status.outcome.unwrap() {
            RunOutcome::Failed { reason, .. } => assert_eq!(reason, FailureReason::Cancelled),
            other => panic!("expected cancellation, got {:?}", other),
        }

        // The in-flight step was allowed to finish; nothing started after
        // the cancellation entry.
        let entries = orchestrator.get_execution_log(run_id).await.unwrap();
        let cancel_seq = entries
            .iter()
            .find(|e| matches!(e.kind, LogEntryKind::RunCancelled))
            .unwrap()
            .sequence;
        let started_after = entries
            .iter()
            .filter(|e| e.sequence > cancel_seq)
            .filter(|e| matches!(e.kind, LogEntryKind::StepStarted { .. }))
            .count();
        assert_eq!(started_after, 0);
        assert!(calls.load(Ordering::SeqCst) <= 1);

        // Cancelling a terminal run is rejected.
        assert!(matches!(
            orchestrator.cancel_run(run_id).await.unwrap_err(),
            EngineError::RunAlreadyTerminal(_)
        ));
    }

    #[tokio::test]
    async fn test_unknown_run_id_is_reported() {
        let registry = ToolRegistry::new();
        let orchestrator = orchestrator(registry, catalog(&["writer"]));

        let missing = Uuid::new_v4();
        assert!(matches!(
            orchestrator.get_run_result(missing).await.unwrap_err(),
            EngineError::RunNotFound(_)
        ));
        assert!(matches!(
            orchestrator.get_execution_log(missing).await.unwrap_err(),
            EngineError::RunNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_terminal_run_is_served_from_the_archive() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(WriterTool { calls }));
        let registry = Arc::new(registry);

        let run_store = Arc::new(InMemoryRunStore::new());
        let orchestrator = Arc::new(Orchestrator::new(
            Box::new(CatalogPlanner::new(catalog(&["writer"]))),
            Executor::new(registry.clone()),
            ValidationEngine::new(registry.clone()),
            RecoveryController::new(
                RecoveryConfig {
                    max_retries: 3,
                    backoff_base_ms: 1,
                    backoff_cap_ms: 10,
                },
                registry,
            ),
            run_store.clone(),
        ));

        let run_id = orchestrator.start_run(task()).await.unwrap();
        let status = orchestrator.wait_for_result(run_id).await.unwrap();
        assert_eq!(status.state, RunState::Succeeded);

        // The archive holds the durable record with the full log.
        let record = run_store.load_record(run_id).await.unwrap().unwrap();
        assert!(!record.log.is_empty());
        match &record.log.last().unwrap().kind {
            LogEntryKind::StateChanged { to, .. } => assert_eq!(*to, RunState::Succeeded),
            other => panic!("unexpected final entry {:?}", other),
        }

        // Caller-facing queries keep working once the live handle is gone.
        let status = orchestrator.get_run_result(run_id).await.unwrap();
        assert_eq!(status.state, RunState::Succeeded);
        assert_eq!(status.retry_count, 0);

        let entries = orchestrator.get_execution_log(run_id).await.unwrap();
        assert_eq!(
            entries.last().map(|e| e.sequence),
            record.log.last().map(|e| e.sequence)
        );

        let waited = orchestrator.wait_for_result(run_id).await.unwrap();
        assert_eq!(waited.state, RunState::Succeeded);

        assert!(matches!(
            orchestrator.cancel_run(run_id).await.unwrap_err(),
            EngineError::RunAlreadyTerminal(_)
        ));
    }
}
