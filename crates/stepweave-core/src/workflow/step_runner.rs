//! Single-step execution: kind dispatch, timeout, retry, composite re-entry.
//!
//! `StepRunner::execute` runs one step to a final outcome. It never touches
//! the live workflow context; it receives an `Arc` snapshot plus the inputs
//! resolved when the step became ready, and hands back a `StepRunResult`
//! for the scheduler to record and merge.
//!
//! Step kinds:
//! - ACTION delegates to a registered handler
//! - CONDITION evaluates its expression and reports the branch taken
//! - DELAY sleeps on a tokio timer
//! - PARALLEL runs its children concurrently under its own semaphore
//! - LOOP runs its body once per item, sequentially
//! - HUMAN parks on a one-shot channel until `resume`

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use serde_json::{Map, Value, json};
use stepweave_types::config::EngineConfig;
use stepweave_types::event::WorkflowEvent;
use stepweave_types::workflow::{LoopItems, StepConfig, StepDefinition, StepInputs, StepOutputs};
use tokio::sync::{Semaphore, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::WorkflowContext;
use super::events::EventEmitter;
use super::expression::ConditionEvaluator;
use super::handler::{BoxStepHandler, HandlerError, HandlerRegistry};
use super::retry::RetryHandler;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Errors that can end a step attempt.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
    /// No handler is registered under the ACTION step's name. Never retried.
    #[error("no handler registered under '{0}'")]
    HandlerNotFound(String),

    #[error("step timed out after {0}s")]
    Timeout(f64),

    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("step cancelled")]
    Cancelled,
}

impl StepError {
    pub fn is_retryable(&self) -> bool {
        match self {
            StepError::Timeout(_) => true,
            StepError::Handler(e) => e.retryable,
            StepError::HandlerNotFound(_) | StepError::InvalidInput(_) | StepError::Cancelled => {
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Results & run scope
// ---------------------------------------------------------------------------

/// Final outcome of one step after all attempts.
#[derive(Debug, Clone)]
pub struct StepRunResult {
    pub outcome: Result<StepOutputs, StepError>,
    /// Attempts made, at least 1.
    pub attempts: u32,
    /// Condition evaluation and output warnings collected on the way.
    pub warnings: Vec<String>,
    /// For CONDITION steps, the evaluated result.
    pub branch_taken: Option<bool>,
}

impl StepRunResult {
    pub fn retry_count(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    fn failed(error: StepError, attempts: u32, warnings: Vec<String>) -> Self {
        Self {
            outcome: Err(error),
            attempts,
            warnings,
            branch_taken: None,
        }
    }
}

/// Per-run information threaded through every step of the run.
#[derive(Debug, Clone)]
pub struct RunScope {
    pub run_id: Uuid,
    /// Default budget for PARALLEL steps without their own `max_concurrency`.
    pub max_parallel_steps: usize,
    /// Cancelled on run cancellation or workflow timeout.
    pub cancel: CancellationToken,
}

/// Output of a single successful attempt.
struct Dispatched {
    outputs: StepOutputs,
    warnings: Vec<String>,
    branch_taken: Option<bool>,
}

impl Dispatched {
    fn outputs(outputs: StepOutputs) -> Self {
        Self {
            outputs,
            warnings: Vec::new(),
            branch_taken: None,
        }
    }
}

fn outputs(value: Value) -> StepOutputs {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}

// ---------------------------------------------------------------------------
// HUMAN waiters
// ---------------------------------------------------------------------------

/// Suspended HUMAN steps keyed by (run id, step id).
#[derive(Clone, Default)]
pub struct HumanWaiters {
    inner: Arc<DashMap<(Uuid, String), oneshot::Sender<StepOutputs>>>,
}

impl HumanWaiters {
    fn register(&self, run_id: Uuid, step_id: &str) -> oneshot::Receiver<StepOutputs> {
        let (tx, rx) = oneshot::channel();
        self.inner.insert((run_id, step_id.to_string()), tx);
        rx
    }

    fn remove(&self, run_id: Uuid, step_id: &str) {
        self.inner.remove(&(run_id, step_id.to_string()));
    }

    /// Deliver `outputs` to a waiting step. Returns false if nothing was waiting.
    pub fn resume(&self, run_id: Uuid, step_id: &str, outputs: StepOutputs) -> bool {
        match self.inner.remove(&(run_id, step_id.to_string())) {
            Some((_, tx)) => tx.send(outputs).is_ok(),
            None => false,
        }
    }

    pub fn is_waiting(&self, run_id: Uuid, step_id: &str) -> bool {
        self.inner.contains_key(&(run_id, step_id.to_string()))
    }

    /// Drop every waiter of a run.
    pub fn clear_run(&self, run_id: Uuid) {
        self.inner.retain(|(id, _), _| *id != run_id);
    }
}

/// Removes a HUMAN step's waiter when its attempt ends, however it ends.
struct WaiterGuard<'a> {
    waiters: &'a HumanWaiters,
    run_id: Uuid,
    step_id: &'a str,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiters.remove(self.run_id, self.step_id);
    }
}

impl std::fmt::Debug for HumanWaiters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HumanWaiters")
            .field("waiting", &self.inner.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Executes individual steps. Cheap to clone; all state is shared.
#[derive(Clone, Debug)]
pub struct StepRunner {
    handlers: HandlerRegistry,
    evaluator: Arc<ConditionEvaluator>,
    emitter: EventEmitter,
    waiters: HumanWaiters,
    config: Arc<EngineConfig>,
}

impl StepRunner {
    pub fn new(
        handlers: HandlerRegistry,
        evaluator: Arc<ConditionEvaluator>,
        emitter: EventEmitter,
        waiters: HumanWaiters,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            handlers,
            evaluator,
            emitter,
            waiters,
            config,
        }
    }

    /// Run a step through every allowed attempt and return the final result.
    ///
    /// Inputs are resolved once by the caller and reused for every attempt.
    pub fn execute<'a>(
        &'a self,
        step: &'a StepDefinition,
        ctx: Arc<WorkflowContext>,
        inputs: StepInputs,
        scope: &'a RunScope,
    ) -> Pin<Box<dyn Future<Output = StepRunResult> + Send + 'a>> {
        Box::pin(async move {
            // Resolved once per step start; later registrations don't affect it.
            let handler = match &step.config {
                StepConfig::Action { handler } => match self.handlers.get(handler) {
                    Some(h) => Some(h),
                    None => {
                        tracing::warn!(step_id = %step.id, handler = %handler, "handler not found");
                        return StepRunResult::failed(
                            StepError::HandlerNotFound(handler.clone()),
                            1,
                            Vec::new(),
                        );
                    }
                },
                _ => None,
            };

            let mut attempt: u32 = 0;
            loop {
                attempt += 1;
                tracing::debug!(run_id = %scope.run_id, step_id = %step.id, kind = %step.kind(), attempt, "step attempt");

                let error = match self
                    .attempt(step, &ctx, &inputs, scope, handler.as_deref())
                    .await
                {
                    Ok(done) => {
                        return StepRunResult {
                            outcome: Ok(done.outputs),
                            attempts: attempt,
                            warnings: done.warnings,
                            branch_taken: done.branch_taken,
                        };
                    }
                    Err(e) => e,
                };

                if scope.cancel.is_cancelled()
                    || !RetryHandler::should_retry(&step.retry, attempt, error.is_retryable())
                {
                    tracing::debug!(run_id = %scope.run_id, step_id = %step.id, attempt, error = %error, "step attempts exhausted");
                    return StepRunResult::failed(error, attempt, Vec::new());
                }

                let delay = RetryHandler::delay_for(&step.retry, attempt);
                tracing::warn!(
                    run_id = %scope.run_id,
                    step_id = %step.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "step attempt failed, retrying"
                );
                self.emitter.emit(WorkflowEvent::StepRetrying {
                    run_id: scope.run_id,
                    step_id: step.id.clone(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    error: error.to_string(),
                });

                tokio::select! {
                    _ = scope.cancel.cancelled() => {
                        return StepRunResult::failed(StepError::Cancelled, attempt, Vec::new());
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        })
    }

    /// One attempt under the step's timeout and the run's cancellation token.
    async fn attempt(
        &self,
        step: &StepDefinition,
        ctx: &Arc<WorkflowContext>,
        inputs: &StepInputs,
        scope: &RunScope,
        handler: Option<&BoxStepHandler>,
    ) -> Result<Dispatched, StepError> {
        let timeout_secs = match step.config {
            // A waiting human is not subject to the engine-wide default.
            StepConfig::Human { .. } => step.timeout_secs,
            _ => step.timeout_secs.or(self.config.default_step_timeout_secs),
        };

        let work = self.dispatch(step, ctx, inputs, scope, handler);
        let bounded = async {
            match timeout_secs {
                Some(secs) => match tokio::time::timeout(secs_to_duration(secs), work).await {
                    Ok(result) => result,
                    Err(_) => Err(StepError::Timeout(secs)),
                },
                None => work.await,
            }
        };

        tokio::select! {
            biased;
            _ = scope.cancel.cancelled() => Err(StepError::Cancelled),
            result = bounded => result,
        }
    }

    async fn dispatch(
        &self,
        step: &StepDefinition,
        ctx: &Arc<WorkflowContext>,
        inputs: &StepInputs,
        scope: &RunScope,
        handler: Option<&BoxStepHandler>,
    ) -> Result<Dispatched, StepError> {
        match &step.config {
            StepConfig::Action { handler: name } => {
                let handler = handler.ok_or_else(|| StepError::HandlerNotFound(name.clone()))?;
                let out = handler.handle(step, ctx, inputs).await?;
                Ok(Dispatched::outputs(out))
            }
            StepConfig::Condition { condition } => Ok(self.run_condition(condition, ctx)),
            StepConfig::Delay { delay_seconds } => {
                tokio::time::sleep(secs_to_duration(*delay_seconds)).await;
                Ok(Dispatched::outputs(outputs(json!({ "delayed_seconds": delay_seconds }))))
            }
            StepConfig::Parallel {
                steps,
                max_concurrency,
            } => {
                let limit = max_concurrency.unwrap_or(scope.max_parallel_steps);
                self.run_parallel(steps, limit, ctx, scope).await
            }
            StepConfig::Loop {
                items,
                body,
                max_iterations,
            } => self.run_loop(items, body, *max_iterations, ctx, scope).await,
            StepConfig::Human { prompt } => self.run_human(step, prompt.as_deref(), scope).await,
        }
    }

    // -- CONDITION: never fails; a degraded expression is false plus a warning --

    fn run_condition(&self, condition: &str, ctx: &WorkflowContext) -> Dispatched {
        let outcome = self.evaluator.evaluate(condition, ctx);
        let mut out = Map::new();
        out.insert("condition_result".to_string(), Value::Bool(outcome.result));
        if let Some(warning) = &outcome.warning {
            out.insert("warning".to_string(), Value::String(warning.clone()));
        }
        tracing::debug!(condition, result = outcome.result, "condition evaluated");
        Dispatched {
            outputs: out,
            warnings: outcome.warning.into_iter().collect(),
            branch_taken: Some(outcome.result),
        }
    }

    /// Run one nested step, honouring its own conditions.
    ///
    /// Returns `None` when a condition skipped it.
    async fn run_child(
        &self,
        child: &StepDefinition,
        ctx: Arc<WorkflowContext>,
        scope: &RunScope,
    ) -> (Option<StepRunResult>, Vec<String>) {
        let (ready, warnings) = self.evaluator.evaluate_all(&child.conditions, &ctx);
        if !ready {
            return (None, warnings);
        }
        let inputs = ctx.resolve_parameters(&child.parameters);
        (Some(self.execute(child, ctx, inputs, scope).await), warnings)
    }

    // -- PARALLEL: independent budget; child failures are collected, never raised --

    async fn run_parallel(
        &self,
        steps: &[StepDefinition],
        limit: usize,
        ctx: &Arc<WorkflowContext>,
        scope: &RunScope,
    ) -> Result<Dispatched, StepError> {
        let semaphore = Semaphore::new(limit.max(1));

        let runs = steps.iter().map(|child| {
            let semaphore = &semaphore;
            let ctx = Arc::clone(ctx);
            async move {
                let _permit = semaphore.acquire().await.ok();
                (child, self.run_child(child, ctx, scope).await)
            }
        });
        let finished = join_all(runs).await;

        let mut results = Vec::new();
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut skipped = 0usize;
        for (child, (result, child_warnings)) in finished {
            warnings.extend(child_warnings);
            match result {
                None => {
                    skipped += 1;
                    results.push(json!({ "step_id": child.id, "status": "skipped" }));
                }
                Some(run) => {
                    warnings.extend(run.warnings.iter().cloned());
                    match (run.outcome, run.branch_taken) {
                        (Ok(out), Some(false)) => {
                            skipped += 1;
                            results.push(json!({ "step_id": child.id, "status": "skipped", "outputs": out }));
                        }
                        (Ok(out), _) => {
                            results.push(json!({ "step_id": child.id, "status": "completed", "outputs": out }));
                        }
                        (Err(StepError::Cancelled), _) => return Err(StepError::Cancelled),
                        (Err(e), _) => {
                            tracing::debug!(step_id = %child.id, error = %e, "parallel child failed");
                            errors.push(json!({ "step_id": child.id, "error": e.to_string() }));
                        }
                    }
                }
            }
        }

        let succeeded = results.len() - skipped;
        let failed = errors.len();
        Ok(Dispatched {
            outputs: outputs(json!({
                "results": results,
                "errors": errors,
                "succeeded": succeeded,
                "failed": failed,
                "skipped": skipped,
            })),
            warnings,
            branch_taken: None,
        })
    }

    // -- LOOP: sequential; iteration failures are collected, never raised --

    async fn run_loop(
        &self,
        items: &LoopItems,
        body: &StepDefinition,
        max_iterations: Option<usize>,
        ctx: &Arc<WorkflowContext>,
        scope: &RunScope,
    ) -> Result<Dispatched, StepError> {
        let items: Vec<Value> = match items {
            LoopItems::Values(values) => values.clone(),
            LoopItems::Path(path) => {
                let path = strip_placeholder(path);
                match ctx.lookup(path) {
                    Some(Value::Array(values)) => values.clone(),
                    Some(other) => {
                        return Err(StepError::InvalidInput(format!(
                            "loop items at '{path}' must be an array, got {other}"
                        )));
                    }
                    None => {
                        return Err(StepError::InvalidInput(format!(
                            "loop items path '{path}' not found"
                        )));
                    }
                }
            }
        };

        let cap = max_iterations.unwrap_or(self.config.loop_max_iterations);
        let truncated = items.len() > cap;
        if truncated {
            tracing::warn!(total = items.len(), cap, "loop items truncated to iteration cap");
        }

        let mut results = Vec::new();
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut iterations = 0usize;
        for (index, item) in items.into_iter().take(cap).enumerate() {
            if scope.cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }
            iterations += 1;
            let scoped = Arc::new(ctx.for_iteration(item.clone(), index));
            let (result, child_warnings) = self.run_child(body, scoped, scope).await;
            warnings.extend(child_warnings);
            match result {
                None => results.push(json!({ "index": index, "item": item, "status": "skipped" })),
                Some(run) => {
                    warnings.extend(run.warnings.iter().cloned());
                    match run.outcome {
                        Ok(out) => results.push(json!({ "index": index, "item": item, "status": "completed", "outputs": out })),
                        Err(StepError::Cancelled) => return Err(StepError::Cancelled),
                        Err(e) => errors.push(json!({ "index": index, "item": item, "error": e.to_string() })),
                    }
                }
            }
        }

        Ok(Dispatched {
            outputs: outputs(json!({
                "results": results,
                "errors": errors,
                "iterations": iterations,
                "truncated": truncated,
            })),
            warnings,
            branch_taken: None,
        })
    }

    // -- HUMAN: suspend on a one-shot channel until resumed or cancelled --

    async fn run_human(
        &self,
        step: &StepDefinition,
        prompt: Option<&str>,
        scope: &RunScope,
    ) -> Result<Dispatched, StepError> {
        let rx = self.waiters.register(scope.run_id, &step.id);
        // Dropped on resume, cancellation, or when a step timeout drops this future.
        let _guard = WaiterGuard {
            waiters: &self.waiters,
            run_id: scope.run_id,
            step_id: &step.id,
        };
        tracing::info!(run_id = %scope.run_id, step_id = %step.id, "waiting for human input");
        self.emitter.emit(WorkflowEvent::StepWaiting {
            run_id: scope.run_id,
            step_id: step.id.clone(),
            prompt: prompt.map(str::to_string),
        });

        let received = tokio::select! {
            _ = scope.cancel.cancelled() => None,
            result = rx => result.ok(),
        };
        match received {
            Some(out) => Ok(Dispatched::outputs(out)),
            None => Err(StepError::Cancelled),
        }
    }
}

/// Accept `{{ outputs.rows }}` as well as the bare `outputs.rows`.
fn strip_placeholder(path: &str) -> &str {
    let trimmed = path.trim();
    trimmed
        .strip_prefix("{{")
        .and_then(|p| p.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::handler::{HandlerCall, handler_fn};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use stepweave_types::workflow::RetryPolicy;

    struct Harness {
        runner: StepRunner,
        handlers: HandlerRegistry,
        waiters: HumanWaiters,
        emitter: EventEmitter,
        scope: RunScope,
    }

    fn harness() -> Harness {
        let handlers = HandlerRegistry::new();
        let emitter = EventEmitter::new(64);
        let waiters = HumanWaiters::default();
        let runner = StepRunner::new(
            handlers.clone(),
            Arc::new(ConditionEvaluator::new()),
            emitter.clone(),
            waiters.clone(),
            Arc::new(EngineConfig::default()),
        );
        Harness {
            runner,
            handlers,
            waiters,
            emitter,
            scope: RunScope {
                run_id: Uuid::now_v7(),
                max_parallel_steps: 5,
                cancel: CancellationToken::new(),
            },
        }
    }

    fn ctx() -> Arc<WorkflowContext> {
        let mut ctx = WorkflowContext::new(Uuid::now_v7(), "wf", Map::new(), Map::new());
        ctx.outputs.insert("rows".into(), json!(["a", "b", "c"]));
        ctx.outputs.insert("scalar".into(), json!(7));
        Arc::new(ctx)
    }

    impl Harness {
        async fn run(&self, step: &StepDefinition) -> StepRunResult {
            let ctx = ctx();
            let inputs = ctx.resolve_parameters(&step.parameters);
            self.runner.execute(step, ctx, inputs, &self.scope).await
        }

        fn register_echo(&self) {
            self.handlers.register(
                "echo",
                handler_fn(|call: HandlerCall| async move {
                    let mut out = call.inputs.clone();
                    if let Some(item) = call.context.variables.get("loop_item") {
                        out.insert("item".into(), item.clone());
                    }
                    Ok(out)
                }),
            );
        }

        fn register_fail(&self, retryable: bool) {
            self.handlers.register(
                "fail",
                handler_fn(move |_| async move {
                    Err(HandlerError {
                        message: "nope".into(),
                        retryable,
                    })
                }),
            );
        }
    }

    // -----------------------------------------------------------------------
    // ACTION, retry, timeout
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_action_returns_handler_outputs() {
        let h = harness();
        h.register_echo();
        let step = StepDefinition::action("a", "echo").with_parameter("n", json!(3));
        let result = h.run(&step).await;
        assert_eq!(result.outcome.unwrap()["n"], json!(3));
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_handler_not_found_is_not_retried() {
        let h = harness();
        let step = StepDefinition::action("a", "ghost").with_retry(RetryPolicy::fixed(3, 1));
        let result = h.run(&step).await;
        assert_eq!(
            result.outcome.unwrap_err(),
            StepError::HandlerNotFound("ghost".into())
        );
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_flaky_handler_succeeds_on_third_attempt() {
        let h = harness();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        h.handlers.register(
            "flaky",
            handler_fn(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(HandlerError::retryable("transient"))
                    } else {
                        Ok(Map::new())
                    }
                }
            }),
        );
        let mut events = h.emitter.subscribe();

        let step = StepDefinition::action("a", "flaky").with_retry(RetryPolicy::fixed(2, 1));
        let result = h.run(&step).await;
        assert!(result.outcome.is_ok());
        assert_eq!(result.attempts, 3);
        assert_eq!(result.retry_count(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let first = events.recv().await.unwrap();
        assert_eq!(first.name(), "step_retrying");
    }

    #[tokio::test]
    async fn test_retry_attempts_bounded() {
        let h = harness();
        h.register_fail(true);
        let step = StepDefinition::action("a", "fail").with_retry(RetryPolicy::fixed(2, 1));
        let result = h.run(&step).await;
        assert!(result.outcome.is_err());
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn test_fatal_handler_error_stops_immediately() {
        let h = harness();
        h.register_fail(false);
        let step = StepDefinition::action("a", "fail").with_retry(RetryPolicy::fixed(5, 1));
        let result = h.run(&step).await;
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let h = harness();
        h.handlers.register(
            "slow",
            handler_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Map::new())
            }),
        );
        let step = StepDefinition::action("a", "slow")
            .with_timeout_secs(0.02)
            .with_retry(RetryPolicy::fixed(1, 1));
        let result = h.run(&step).await;
        assert!(matches!(result.outcome, Err(StepError::Timeout(_))));
        assert_eq!(result.attempts, 2);
    }

    // -----------------------------------------------------------------------
    // CONDITION, DELAY
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_condition_reports_branch() {
        let h = harness();
        let step = StepDefinition::new(
            "gate",
            StepConfig::Condition {
                condition: "outputs.scalar > 5".into(),
            },
        );
        let result = h.run(&step).await;
        assert_eq!(result.branch_taken, Some(true));
        assert_eq!(result.outcome.unwrap()["condition_result"], json!(true));

        let step = StepDefinition::new(
            "gate",
            StepConfig::Condition {
                condition: "variables.x > 10".into(),
            },
        );
        let result = h.run(&step).await;
        assert_eq!(result.branch_taken, Some(false));
        assert_eq!(result.outcome.unwrap()["condition_result"], json!(false));
    }

    #[tokio::test]
    async fn test_malformed_condition_warns() {
        let h = harness();
        let step = StepDefinition::new(
            "gate",
            StepConfig::Condition {
                condition: "variables.x >>> (".into(),
            },
        );
        let result = h.run(&step).await;
        assert_eq!(result.branch_taken, Some(false));
        assert_eq!(result.warnings.len(), 1);
        assert!(result.outcome.unwrap().contains_key("warning"));
    }

    #[tokio::test]
    async fn test_delay_reports_seconds() {
        let h = harness();
        let step = StepDefinition::new("nap", StepConfig::Delay { delay_seconds: 0.01 });
        let result = h.run(&step).await;
        assert_eq!(result.outcome.unwrap()["delayed_seconds"], json!(0.01));
    }

    // -----------------------------------------------------------------------
    // PARALLEL
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_parallel_partial_failure_completes() {
        let h = harness();
        h.register_echo();
        h.register_fail(false);
        let step = StepDefinition::new(
            "fan",
            StepConfig::Parallel {
                steps: vec![
                    StepDefinition::action("ok1", "echo"),
                    StepDefinition::action("bad", "fail"),
                    StepDefinition::action("ok2", "echo"),
                    StepDefinition::action("gated", "echo").with_condition("variables.nope"),
                ],
                max_concurrency: None,
            },
        );
        let out = h.run(&step).await.outcome.unwrap();
        assert_eq!(out["succeeded"], json!(2));
        assert_eq!(out["failed"], json!(1));
        assert_eq!(out["skipped"], json!(1));
        assert_eq!(out["errors"][0]["step_id"], json!("bad"));
    }

    #[tokio::test]
    async fn test_parallel_respects_max_concurrency() {
        let h = harness();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            h.handlers.register(
                "tracked",
                handler_fn(move |_| {
                    let running = Arc::clone(&running);
                    let peak = Arc::clone(&peak);
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(Map::new())
                    }
                }),
            );
        }
        let children = (0..6)
            .map(|i| StepDefinition::action(format!("c{i}"), "tracked"))
            .collect();
        let step = StepDefinition::new(
            "fan",
            StepConfig::Parallel {
                steps: children,
                max_concurrency: Some(2),
            },
        );
        let out = h.run(&step).await.outcome.unwrap();
        assert_eq!(out["succeeded"], json!(6));
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    // -----------------------------------------------------------------------
    // LOOP
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_loop_over_context_path_injects_item() {
        let h = harness();
        h.register_echo();
        let step = StepDefinition::new(
            "each",
            StepConfig::Loop {
                items: LoopItems::Path("outputs.rows".into()),
                body: Box::new(
                    StepDefinition::action("body", "echo")
                        .with_parameter("idx", json!("{{ variables.loop_index }}")),
                ),
                max_iterations: None,
            },
        );
        let out = h.run(&step).await.outcome.unwrap();
        assert_eq!(out["iterations"], json!(3));
        assert_eq!(out["truncated"], json!(false));
        assert_eq!(out["results"][1]["outputs"]["item"], json!("b"));
        assert_eq!(out["results"][2]["outputs"]["idx"], json!(2));
    }

    #[tokio::test]
    async fn test_loop_collects_failures_and_truncates() {
        let h = harness();
        h.register_fail(false);
        let step = StepDefinition::new(
            "each",
            StepConfig::Loop {
                items: LoopItems::Values(vec![json!(1), json!(2), json!(3), json!(4)]),
                body: Box::new(StepDefinition::action("body", "fail")),
                max_iterations: Some(2),
            },
        );
        let out = h.run(&step).await.outcome.unwrap();
        assert_eq!(out["iterations"], json!(2));
        assert_eq!(out["truncated"], json!(true));
        assert_eq!(out["errors"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_loop_non_array_items_fails_step() {
        let h = harness();
        h.register_echo();
        let step = StepDefinition::new(
            "each",
            StepConfig::Loop {
                items: LoopItems::Path("{{ outputs.scalar }}".into()),
                body: Box::new(StepDefinition::action("body", "echo")),
                max_iterations: None,
            },
        );
        let result = h.run(&step).await;
        assert!(matches!(result.outcome, Err(StepError::InvalidInput(_))));
    }

    // -----------------------------------------------------------------------
    // HUMAN & cancellation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_human_step_resumes_with_outputs() {
        let h = harness();
        let step = StepDefinition::new(
            "approve",
            StepConfig::Human {
                prompt: Some("ship it?".into()),
            },
        );
        let mut events = h.emitter.subscribe();

        let run = h.run(&step);
        let resume = async {
            let event = events.recv().await.unwrap();
            assert_eq!(event.name(), "step_waiting");
            assert!(h.waiters.is_waiting(h.scope.run_id, "approve"));
            let mut out = Map::new();
            out.insert("approved".into(), json!(true));
            assert!(h.waiters.resume(h.scope.run_id, "approve", out));
        };
        let (result, ()) = tokio::join!(run, resume);
        assert_eq!(result.outcome.unwrap()["approved"], json!(true));
        assert!(!h.waiters.is_waiting(h.scope.run_id, "approve"));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_delay() {
        let h = harness();
        let step = StepDefinition::new("nap", StepConfig::Delay { delay_seconds: 30.0 });
        let cancel = h.scope.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let result = h.run(&step).await;
        assert_eq!(result.outcome.unwrap_err(), StepError::Cancelled);
    }

    #[tokio::test]
    async fn test_cancellation_clears_human_waiter() {
        let h = harness();
        let step = StepDefinition::new("approve", StepConfig::Human { prompt: None });
        h.scope.cancel.cancel();
        let result = h.run(&step).await;
        assert_eq!(result.outcome.unwrap_err(), StepError::Cancelled);
        assert!(!h.waiters.is_waiting(h.scope.run_id, "approve"));
    }

    #[tokio::test]
    async fn test_human_timeout_clears_waiter() {
        let h = harness();
        let step = StepDefinition::new("approve", StepConfig::Human { prompt: None })
            .with_timeout_secs(0.02);
        let result = h.run(&step).await;
        assert!(matches!(result.outcome, Err(StepError::Timeout(_))));
        assert!(!h.waiters.is_waiting(h.scope.run_id, "approve"));
        assert!(!h.waiters.resume(h.scope.run_id, "approve", Map::new()));
    }
}
