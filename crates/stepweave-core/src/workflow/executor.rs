//! Workflow scheduler: the single-writer control loop behind `WorkflowEngine`.
//!
//! Each run is driven by one `Scheduler` that alone evaluates readiness,
//! launches steps and writes the run's context. Step bodies run on a
//! `tokio::task::JoinSet` with an `Arc` snapshot of the context and hand
//! their results back to the loop.
//!
//! # Execution flow
//!
//! 1. Validate the definition; an invalid one is rejected before any step runs.
//! 2. Classify pending steps: blocked, waiting, or dependency-satisfied.
//!    Satisfied steps whose conditions are false are skipped.
//! 3. Launch ready steps in definition order up to `max_parallel_steps`.
//! 4. Wait for the first of: a step completion, cancellation, the workflow
//!    deadline. A completion merges outputs and goes back to step 2.
//! 5. On a terminal status, emit the final event and run the lifecycle hook.

use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};
use stepweave_types::config::EngineConfig;
use stepweave_types::event::WorkflowEvent;
use stepweave_types::workflow::{
    RunFailure, StepDefinition, StepExecutionRecord, StepOutputs, StepStatus, WorkflowDefinition,
    WorkflowStatus, WorkflowStatusReport,
};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::WorkflowContext;
use super::dag::{ValidationReport, validate};
use super::events::{EventEmitter, ListenerId, WorkflowListener};
use super::expression::ConditionEvaluator;
use super::handler::{HandlerError, HandlerRegistry, StepHandler};
use super::step_runner::{HumanWaiters, RunScope, StepError, StepRunResult, StepRunner};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by the engine's public entry points.
///
/// Once a run has started, every outcome (including failure) is reported
/// through `WorkflowExecution` instead.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("invalid workflow definition: {0}")]
    Definition(ValidationReport),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("step '{step_id}' of run {run_id} is not awaiting input")]
    NotAwaitingInput { run_id: Uuid, step_id: String },

    #[error("run task failed: {0}")]
    Join(String),
}

/// Scheduler invariant violations. These end a run as FAILED and are
/// reported with a `workflow_error` event.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvariantError {
    #[error("scheduler exceeded tick cap of {0} rounds")]
    TickCapExceeded(u32),

    #[error("deadlock: steps [{}] can never become ready", .0.join(", "))]
    Deadlock(Vec<String>),
}

impl From<InvariantError> for RunFailure {
    fn from(err: InvariantError) -> Self {
        match err {
            InvariantError::TickCapExceeded(ticks) => RunFailure::TickCapExceeded { ticks },
            InvariantError::Deadlock(steps) => RunFailure::Blocked { steps },
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowExecution
// ---------------------------------------------------------------------------

/// State of one run. Read-only once the run reaches a terminal status.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowExecution {
    pub run_id: Uuid,
    #[serde(skip)]
    pub definition: Arc<WorkflowDefinition>,
    pub workflow_id: String,
    pub context: WorkflowContext,
    /// One record per top-level step, keyed by step id.
    pub records: BTreeMap<String, StepExecutionRecord>,
    pub status: WorkflowStatus,
    pub completed_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub skipped_steps: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub failure: Option<RunFailure>,
}

impl WorkflowExecution {
    fn new(run_id: Uuid, definition: Arc<WorkflowDefinition>, context: WorkflowContext) -> Self {
        let records = definition
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepExecutionRecord::pending(&s.id)))
            .collect();
        Self {
            run_id,
            workflow_id: definition.id.clone(),
            definition,
            context,
            records,
            status: WorkflowStatus::Created,
            completed_steps: Vec::new(),
            failed_steps: Vec::new(),
            skipped_steps: Vec::new(),
            started_at: None,
            completed_at: None,
            error: None,
            failure: None,
        }
    }

    pub fn record(&self, step_id: &str) -> Option<&StepExecutionRecord> {
        self.records.get(step_id)
    }

    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }

    /// Wall-clock duration so far, or in total once terminal.
    pub fn duration_ms(&self) -> Option<u64> {
        let start = self.started_at?;
        let end = self.completed_at.unwrap_or_else(Utc::now);
        Some((end - start).num_milliseconds().max(0) as u64)
    }

    pub fn status_report(&self) -> WorkflowStatusReport {
        WorkflowStatusReport {
            run_id: self.run_id,
            workflow_id: self.workflow_id.clone(),
            status: self.status,
            started_at: self.started_at,
            duration_ms: self.duration_ms(),
            completed_steps: self.completed_steps.len(),
            failed_steps: self.failed_steps.len(),
            skipped_steps: self.skipped_steps.len(),
            total_steps: self.definition.steps.len(),
            error: self.error.clone(),
        }
    }

    fn status_of(&self, step_id: &str) -> Option<StepStatus> {
        self.records.get(step_id).map(|r| r.status)
    }
}

// ---------------------------------------------------------------------------
// Run options & handle
// ---------------------------------------------------------------------------

/// Per-run options beyond the inputs.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Initial `variables` namespace.
    pub variables: Map<String, Value>,
}

impl RunOptions {
    pub fn with_variable(mut self, key: impl Into<String>, value: Value) -> Self {
        self.variables.insert(key.into(), value);
        self
    }
}

/// Handle to a run spawned with [`WorkflowEngine::start`].
#[derive(Debug)]
pub struct RunHandle {
    run_id: Uuid,
    task: JoinHandle<WorkflowExecution>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Wait for the run to reach a terminal status.
    pub async fn wait(self) -> Result<WorkflowExecution, ExecutorError> {
        self.task
            .await
            .map_err(|e| ExecutorError::Join(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

struct RunEntry {
    report: WorkflowStatusReport,
    cancel: CancellationToken,
}

/// Entry point for running workflows. Cheap to clone; clones share
/// handlers, listeners and run state.
#[derive(Clone)]
pub struct WorkflowEngine {
    handlers: HandlerRegistry,
    emitter: EventEmitter,
    evaluator: Arc<ConditionEvaluator>,
    waiters: HumanWaiters,
    config: Arc<EngineConfig>,
    runner: StepRunner,
    runs: Arc<DashMap<Uuid, RunEntry>>,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig) -> Self {
        let config = Arc::new(config);
        let handlers = HandlerRegistry::new();
        let emitter = EventEmitter::new(config.event_bus_capacity);
        let evaluator = Arc::new(ConditionEvaluator::new());
        let waiters = HumanWaiters::default();
        let runner = StepRunner::new(
            handlers.clone(),
            Arc::clone(&evaluator),
            emitter.clone(),
            waiters.clone(),
            Arc::clone(&config),
        );
        Self {
            handlers,
            emitter,
            evaluator,
            waiters,
            config,
            runner,
            runs: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn register_handler<T: StepHandler + 'static>(&self, name: impl Into<String>, handler: T) {
        self.handlers.register(name, handler);
    }

    pub fn add_listener<L: WorkflowListener + 'static>(&self, listener: L) -> ListenerId {
        self.emitter.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.emitter.remove_listener(id)
    }

    /// Broadcast stream of every event emitted from now on.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowEvent> {
        self.emitter.subscribe()
    }

    pub fn validate(&self, definition: &WorkflowDefinition) -> ValidationReport {
        validate(definition)
    }

    /// Run a workflow to completion.
    pub async fn execute(
        &self,
        definition: impl Into<Arc<WorkflowDefinition>>,
        inputs: Map<String, Value>,
    ) -> Result<WorkflowExecution, ExecutorError> {
        self.execute_with(definition, inputs, RunOptions::default())
            .await
    }

    pub async fn execute_with(
        &self,
        definition: impl Into<Arc<WorkflowDefinition>>,
        inputs: Map<String, Value>,
        options: RunOptions,
    ) -> Result<WorkflowExecution, ExecutorError> {
        let scheduler = self.prepare(definition.into(), inputs, options)?;
        Ok(scheduler.run().await)
    }

    /// Spawn a run and return immediately.
    pub fn start(
        &self,
        definition: impl Into<Arc<WorkflowDefinition>>,
        inputs: Map<String, Value>,
    ) -> Result<RunHandle, ExecutorError> {
        self.start_with(definition, inputs, RunOptions::default())
    }

    pub fn start_with(
        &self,
        definition: impl Into<Arc<WorkflowDefinition>>,
        inputs: Map<String, Value>,
        options: RunOptions,
    ) -> Result<RunHandle, ExecutorError> {
        let scheduler = self.prepare(definition.into(), inputs, options)?;
        let run_id = scheduler.exec.run_id;
        let task = tokio::spawn(scheduler.run());
        Ok(RunHandle { run_id, task })
    }

    /// Latest status of a run. Kept after termination until `forget`.
    pub fn status(&self, run_id: Uuid) -> Option<WorkflowStatusReport> {
        self.runs.get(&run_id).map(|entry| entry.report.clone())
    }

    /// Drop the status of a terminated run. Active runs are kept.
    pub fn forget(&self, run_id: Uuid) -> bool {
        self.runs
            .remove_if(&run_id, |_, entry| entry.report.status.is_terminal())
            .is_some()
    }

    /// Request cancellation. Returns false for unknown or terminated runs.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.runs.get(&run_id) {
            Some(entry) if !entry.report.status.is_terminal() => {
                tracing::info!(run_id = %run_id, "cancellation requested");
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Deliver the result of a HUMAN step that is waiting for input.
    pub fn resume(
        &self,
        run_id: Uuid,
        step_id: &str,
        outputs: StepOutputs,
    ) -> Result<(), ExecutorError> {
        if !self.runs.contains_key(&run_id) {
            return Err(ExecutorError::RunNotFound(run_id));
        }
        if !self.waiters.resume(run_id, step_id, outputs) {
            return Err(ExecutorError::NotAwaitingInput {
                run_id,
                step_id: step_id.to_string(),
            });
        }
        tracing::info!(run_id = %run_id, step_id, "human step resumed");
        Ok(())
    }

    pub fn is_waiting(&self, run_id: Uuid, step_id: &str) -> bool {
        self.waiters.is_waiting(run_id, step_id)
    }

    fn prepare(
        &self,
        definition: Arc<WorkflowDefinition>,
        inputs: Map<String, Value>,
        options: RunOptions,
    ) -> Result<Scheduler, ExecutorError> {
        let report = validate(&definition);
        if !report.valid {
            tracing::warn!(workflow_id = %definition.id, errors = %report, "rejected invalid workflow definition");
            return Err(ExecutorError::Definition(report));
        }

        let run_id = Uuid::now_v7();
        let context = WorkflowContext::new(run_id, &definition.id, inputs, options.variables);
        let exec = WorkflowExecution::new(run_id, definition, context);
        let cancel = CancellationToken::new();
        self.runs.insert(
            run_id,
            RunEntry {
                report: exec.status_report(),
                cancel: cancel.clone(),
            },
        );

        Ok(Scheduler {
            engine: self.clone(),
            exec,
            cancel,
            in_flight: JoinSet::new(),
            running: HashSet::new(),
            failure: None,
            halted: false,
            ticks: 0,
        })
    }
}

impl Default for WorkflowEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("handlers", &self.handlers)
            .field("runs", &self.runs.len())
            .field("config", &self.config)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

enum DependencyState {
    Satisfied,
    Waiting,
    Blocked,
}

/// Drives one run. Owns the execution state exclusively.
struct Scheduler {
    engine: WorkflowEngine,
    exec: WorkflowExecution,
    cancel: CancellationToken,
    in_flight: JoinSet<(usize, StepRunResult)>,
    /// Indices of steps currently running.
    running: HashSet<usize>,
    failure: Option<RunFailure>,
    /// No further steps are launched once set.
    halted: bool,
    ticks: u32,
}

impl Scheduler {
    async fn run(mut self) -> WorkflowExecution {
        let def = Arc::clone(&self.exec.definition);
        let run_id = self.exec.run_id;

        self.exec.status = WorkflowStatus::Running;
        self.exec.started_at = Some(Utc::now());
        self.publish_status();
        tracing::info!(run_id = %run_id, workflow_id = %def.id, steps = def.steps.len(), "workflow started");
        self.engine.emitter.emit(WorkflowEvent::WorkflowStarted {
            run_id,
            workflow_id: def.id.clone(),
            total_steps: def.steps.len(),
        });

        let deadline = def
            .timeout_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .map(|d| Instant::now() + d);

        loop {
            // Rounds with nothing left to schedule only settle the run and are not counted.
            if !self.halted && self.has_pending(&def) {
                self.ticks += 1;
                let cap = self.engine.config.max_scheduler_ticks;
                if self.ticks > cap {
                    self.halt(InvariantError::TickCapExceeded(cap).into());
                } else if let Some(blocked) = self.tick(&def) {
                    self.halt(InvariantError::Deadlock(blocked).into());
                }
            }
            if self.in_flight.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    if self.failure.is_none() {
                        self.failure = Some(RunFailure::Cancelled);
                    }
                    self.drain_cancelled().await;
                    break;
                }
                _ = wait_until(deadline) => {
                    let timeout_secs = def.timeout_secs.unwrap_or_default();
                    tracing::warn!(run_id = %run_id, timeout_secs, "workflow timed out");
                    if self.failure.is_none() {
                        self.failure = Some(RunFailure::Timeout { timeout_secs });
                    }
                    self.cancel.cancel();
                    self.drain_cancelled().await;
                    break;
                }
                joined = self.in_flight.join_next() => match joined {
                    Some(Ok((index, result))) => self.record(&def, index, result),
                    Some(Err(e)) => tracing::warn!(run_id = %run_id, error = %e, "step task ended abnormally"),
                    None => {}
                },
            }
        }

        self.finish(&def).await
    }

    fn has_pending(&self, def: &WorkflowDefinition) -> bool {
        def.steps
            .iter()
            .any(|step| self.exec.status_of(&step.id) == Some(StepStatus::Pending))
    }

    /// One scheduling round. Returns the stuck steps on deadlock.
    fn tick(&mut self, def: &Arc<WorkflowDefinition>) -> Option<Vec<String>> {
        let allow_skipped = self.engine.config.skipped_satisfies_dependency;
        let mut ready: Vec<(usize, Vec<String>)> = Vec::new();
        let mut seen: HashSet<usize> = HashSet::new();

        // Skips can unblock or block later steps, so iterate to a fixed point.
        loop {
            let mut changed = false;
            for (index, step) in def.steps.iter().enumerate() {
                if seen.contains(&index) || self.exec.status_of(&step.id) != Some(StepStatus::Pending) {
                    continue;
                }
                match self.dependency_state(step, allow_skipped) {
                    DependencyState::Waiting => {}
                    DependencyState::Blocked => {
                        if def.continue_on_error {
                            self.skip(step, "upstream did not complete", Vec::new());
                            changed = true;
                        }
                    }
                    DependencyState::Satisfied => {
                        let (ok, warnings) = self
                            .engine
                            .evaluator
                            .evaluate_all(&step.conditions, &self.exec.context);
                        if ok {
                            seen.insert(index);
                            ready.push((index, warnings));
                        } else {
                            self.skip(step, "condition evaluated to false", warnings);
                            changed = true;
                        }
                    }
                }
            }
            if !changed {
                break;
            }
        }

        ready.sort_by_key(|(index, _)| *index);
        let budget = def.max_parallel_steps.saturating_sub(self.running.len());
        tracing::debug!(
            run_id = %self.exec.run_id,
            tick = self.ticks,
            ready = ready.len(),
            running = self.running.len(),
            budget,
            "scheduler tick"
        );
        for (index, warnings) in ready.into_iter().take(budget) {
            self.launch(def, index, warnings);
        }

        if !self.in_flight.is_empty() {
            return None;
        }
        let stuck: Vec<String> = def
            .steps
            .iter()
            .filter(|s| self.exec.status_of(&s.id) == Some(StepStatus::Pending))
            .map(|s| s.id.clone())
            .collect();
        if stuck.is_empty() { None } else { Some(stuck) }
    }

    fn dependency_state(&self, step: &StepDefinition, allow_skipped: bool) -> DependencyState {
        let mut waiting = false;
        for dep in &step.depends_on {
            match self.exec.status_of(dep) {
                Some(StepStatus::Completed) => {}
                Some(StepStatus::Skipped) if allow_skipped => {}
                Some(StepStatus::Skipped) | Some(StepStatus::Failed) => {
                    return DependencyState::Blocked;
                }
                _ => waiting = true,
            }
        }
        if waiting {
            DependencyState::Waiting
        } else {
            DependencyState::Satisfied
        }
    }

    fn launch(&mut self, def: &Arc<WorkflowDefinition>, index: usize, warnings: Vec<String>) {
        let run_id = self.exec.run_id;
        let step = &def.steps[index];
        let inputs = self.exec.context.resolve_parameters(&step.parameters);

        if let Some(record) = self.exec.records.get_mut(&step.id) {
            record.transition(StepStatus::Running);
            record.input = Some(Value::Object(inputs.clone()));
            record.warnings.extend(warnings);
        }
        self.running.insert(index);
        self.publish_status();

        tracing::debug!(run_id = %run_id, step_id = %step.id, kind = %step.kind(), running = self.running.len(), "launching step");
        self.engine.emitter.emit(WorkflowEvent::StepStarted {
            run_id,
            step_id: step.id.clone(),
            step_kind: step.kind(),
        });

        let snapshot = Arc::new(self.exec.context.clone());
        let runner = self.engine.runner.clone();
        let definition = Arc::clone(def);
        let scope = RunScope {
            run_id,
            max_parallel_steps: def.max_parallel_steps,
            cancel: self.cancel.child_token(),
        };
        self.in_flight.spawn(async move {
            let step = &definition.steps[index];
            let result = AssertUnwindSafe(runner.execute(step, snapshot, inputs, &scope))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| StepRunResult {
                    outcome: Err(StepError::Handler(HandlerError::fatal("step panicked"))),
                    attempts: 1,
                    warnings: Vec::new(),
                    branch_taken: None,
                });
            (index, result)
        });
    }

    /// Apply a finished step's result. Only the scheduler writes here.
    fn record(&mut self, def: &Arc<WorkflowDefinition>, index: usize, result: StepRunResult) {
        self.running.remove(&index);
        let run_id = self.exec.run_id;
        let step = &def.steps[index];
        let retry_count = result.retry_count();

        match result.outcome {
            Ok(outputs) if result.branch_taken == Some(false) => {
                if let Some(record) = self.exec.records.get_mut(&step.id) {
                    record.retry_count = retry_count;
                    record.warnings.extend(result.warnings);
                    record.output = Some(Value::Object(outputs));
                    record.transition(StepStatus::Skipped);
                }
                self.exec.skipped_steps.push(step.id.clone());
                tracing::debug!(run_id = %run_id, step_id = %step.id, "condition step took the false branch");
                self.engine.emitter.emit(WorkflowEvent::StepSkipped {
                    run_id,
                    step_id: step.id.clone(),
                    reason: "condition evaluated to false".to_string(),
                });
            }
            Ok(outputs) => {
                let mapping_warnings = self.exec.context.merge_outputs(&outputs, &step.output_mapping);
                for warning in &mapping_warnings {
                    tracing::warn!(run_id = %run_id, step_id = %step.id, "{warning}");
                }
                let mut duration_ms = 0;
                if let Some(record) = self.exec.records.get_mut(&step.id) {
                    record.retry_count = retry_count;
                    record.warnings.extend(result.warnings);
                    record.warnings.extend(mapping_warnings);
                    record.output = Some(Value::Object(outputs));
                    record.transition(StepStatus::Completed);
                    duration_ms = record.duration_ms().unwrap_or(0);
                }
                self.exec.completed_steps.push(step.id.clone());
                tracing::debug!(run_id = %run_id, step_id = %step.id, duration_ms, retry_count, "step completed, outputs merged");
                self.engine.emitter.emit(WorkflowEvent::StepCompleted {
                    run_id,
                    step_id: step.id.clone(),
                    duration_ms,
                    retry_count,
                });
            }
            Err(error) => {
                let message = error.to_string();
                if let Some(record) = self.exec.records.get_mut(&step.id) {
                    record.retry_count = retry_count;
                    record.warnings.extend(result.warnings);
                    record.error = Some(message.clone());
                    record.transition(StepStatus::Failed);
                }
                self.exec.failed_steps.push(step.id.clone());
                tracing::warn!(run_id = %run_id, step_id = %step.id, retry_count, error = %message, optional = step.optional, "step failed");
                self.engine.emitter.emit(WorkflowEvent::StepFailed {
                    run_id,
                    step_id: step.id.clone(),
                    error: message.clone(),
                    retry_count,
                });
                if !step.optional && !def.continue_on_error {
                    self.halt(RunFailure::StepFailed {
                        step_id: step.id.clone(),
                        error: message,
                    });
                }
            }
        }
        self.publish_status();
    }

    fn skip(&mut self, step: &StepDefinition, reason: &str, warnings: Vec<String>) {
        if let Some(record) = self.exec.records.get_mut(&step.id) {
            record.warnings.extend(warnings);
            record.transition(StepStatus::Skipped);
        }
        self.exec.skipped_steps.push(step.id.clone());
        tracing::debug!(run_id = %self.exec.run_id, step_id = %step.id, reason, "step skipped");
        self.engine.emitter.emit(WorkflowEvent::StepSkipped {
            run_id: self.exec.run_id,
            step_id: step.id.clone(),
            reason: reason.to_string(),
        });
    }

    fn halt(&mut self, failure: RunFailure) {
        if self.failure.is_none() {
            self.failure = Some(failure);
        }
        self.halted = true;
    }

    /// Give in-flight steps the grace period to observe cancellation, then
    /// abort whatever is left. Their results are discarded.
    async fn drain_cancelled(&mut self) {
        self.halted = true;
        let grace = Duration::from_millis(self.engine.config.cancel_grace_ms);
        let in_flight = &mut self.in_flight;
        let drained = tokio::time::timeout(grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                run_id = %self.exec.run_id,
                remaining = self.in_flight.len(),
                "steps did not exit within grace period, aborting"
            );
        }
        self.in_flight.shutdown().await;
    }

    async fn finish(mut self, def: &Arc<WorkflowDefinition>) -> WorkflowExecution {
        let run_id = self.exec.run_id;

        for step in &def.steps {
            let Some(record) = self.exec.records.get_mut(&step.id) else {
                continue;
            };
            if record.status != StepStatus::Running {
                continue;
            }
            record.error = Some("cancelled".to_string());
            record.transition(StepStatus::Failed);
            let retry_count = record.retry_count;
            self.exec.failed_steps.push(step.id.clone());
            self.engine.emitter.emit(WorkflowEvent::StepFailed {
                run_id,
                step_id: step.id.clone(),
                error: "cancelled".to_string(),
                retry_count,
            });
        }
        self.running.clear();

        let status = match &self.failure {
            None => WorkflowStatus::Completed,
            Some(RunFailure::Cancelled) => WorkflowStatus::Cancelled,
            Some(_) => WorkflowStatus::Failed,
        };
        self.exec.status = status;
        self.exec.completed_at = Some(Utc::now());
        self.exec.error = self.failure.as_ref().map(ToString::to_string);
        self.exec.failure = self.failure.clone();
        let duration_ms = self.exec.duration_ms().unwrap_or(0);
        let workflow_id = def.id.clone();

        match &self.failure {
            None => {
                tracing::info!(
                    run_id = %run_id,
                    duration_ms,
                    completed = self.exec.completed_steps.len(),
                    failed = self.exec.failed_steps.len(),
                    skipped = self.exec.skipped_steps.len(),
                    "workflow completed"
                );
                self.engine.emitter.emit(WorkflowEvent::WorkflowCompleted {
                    run_id,
                    workflow_id,
                    duration_ms,
                    completed_steps: self.exec.completed_steps.len(),
                    failed_steps: self.exec.failed_steps.len(),
                    skipped_steps: self.exec.skipped_steps.len(),
                });
            }
            Some(RunFailure::Cancelled) => {
                tracing::warn!(run_id = %run_id, duration_ms, "workflow cancelled");
                self.engine
                    .emitter
                    .emit(WorkflowEvent::WorkflowCancelled { run_id, workflow_id });
            }
            Some(failure) if failure.is_engine_error() => {
                tracing::error!(run_id = %run_id, error = %failure, "workflow aborted by engine error");
                self.engine.emitter.emit(WorkflowEvent::WorkflowError {
                    run_id,
                    workflow_id,
                    error: failure.to_string(),
                });
            }
            Some(failure) => {
                tracing::info!(run_id = %run_id, duration_ms, error = %failure, "workflow failed");
                self.engine.emitter.emit(WorkflowEvent::WorkflowFailed {
                    run_id,
                    workflow_id,
                    error: failure.to_string(),
                });
            }
        }

        self.engine.waiters.clear_run(run_id);
        self.publish_status();
        self.run_hook(def).await;
        self.exec
    }

    /// Invoke `on_complete` / `on_failure`. Errors are logged only.
    async fn run_hook(&self, def: &WorkflowDefinition) {
        let (slot, name) = match self.exec.status {
            WorkflowStatus::Completed => ("on_complete", def.hooks.on_complete.as_deref()),
            WorkflowStatus::Failed => ("on_failure", def.hooks.on_failure.as_deref()),
            _ => return,
        };
        let Some(name) = name else { return };
        let Some(handler) = self.engine.handlers.get(name) else {
            tracing::warn!(run_id = %self.exec.run_id, hook = slot, handler = name, "lifecycle hook handler not registered");
            return;
        };

        let mut inputs = Map::new();
        inputs.insert("workflow_id".into(), Value::String(def.id.clone()));
        inputs.insert("run_id".into(), Value::String(self.exec.run_id.to_string()));
        inputs.insert("status".into(), Value::String(self.exec.status.to_string()));
        inputs.insert(
            "error".into(),
            self.exec.error.clone().map(Value::String).unwrap_or(Value::Null),
        );
        let step = StepDefinition::action(slot, name);

        let outcome = AssertUnwindSafe(handler.handle(&step, &self.exec.context, &inputs))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(_)) => tracing::debug!(run_id = %self.exec.run_id, hook = slot, "lifecycle hook ran"),
            Ok(Err(e)) => tracing::warn!(run_id = %self.exec.run_id, hook = slot, error = %e, "lifecycle hook failed"),
            Err(_) => tracing::warn!(run_id = %self.exec.run_id, hook = slot, "lifecycle hook panicked"),
        }
    }

    fn publish_status(&self) {
        if let Some(mut entry) = self.engine.runs.get_mut(&self.exec.run_id) {
            entry.report = self.exec.status_report();
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
