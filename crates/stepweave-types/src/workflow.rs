//! Workflow domain types for stepweave.
//!
//! Defines the immutable definition model (`WorkflowDefinition`,
//! `StepDefinition`, `StepConfig`) that YAML/JSON files deserialize into,
//! plus the per-run tracking types (`StepExecutionRecord`,
//! `WorkflowStatusReport`, `RunFailure`) the engine hands back to callers.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Outputs mapping returned by a step body.
pub type StepOutputs = Map<String, Value>;

/// Inputs mapping resolved from a step's `parameters` at readiness time.
pub type StepInputs = Map<String, Value>;

/// Concurrency budget used when a definition does not declare one.
pub const DEFAULT_MAX_PARALLEL_STEPS: usize = 5;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// Created once, validated once, then shared (usually as
/// `Arc<WorkflowDefinition>`) across any number of runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable identifier (e.g. "quarterly-report").
    pub id: String,
    /// Human-readable workflow name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered list of steps forming the dependency graph.
    pub steps: Vec<StepDefinition>,
    /// Overall run timeout in seconds. `None` means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
    /// Maximum number of steps in `running` status at any instant.
    #[serde(default = "default_max_parallel_steps")]
    pub max_parallel_steps: usize,
    /// Keep scheduling past failures of non-optional steps.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Handler names invoked once the run reaches a terminal status.
    #[serde(default, skip_serializing_if = "WorkflowHooks::is_empty")]
    pub hooks: WorkflowHooks,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

fn default_max_parallel_steps() -> usize {
    DEFAULT_MAX_PARALLEL_STEPS
}

impl WorkflowDefinition {
    /// Build a definition with default policies.
    pub fn new(id: impl Into<String>, name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            steps,
            timeout_secs: None,
            max_parallel_steps: DEFAULT_MAX_PARALLEL_STEPS,
            continue_on_error: false,
            hooks: WorkflowHooks::default(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_max_parallel_steps(mut self, max: usize) -> Self {
        self.max_parallel_steps = max;
        self
    }

    pub fn with_timeout_secs(mut self, secs: f64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_continue_on_error(mut self, enabled: bool) -> Self {
        self.continue_on_error = enabled;
        self
    }

    pub fn with_hooks(mut self, hooks: WorkflowHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Look up a top-level step by ID.
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Lifecycle hooks: names of registered handlers to invoke after a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowHooks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_complete: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,
}

impl WorkflowHooks {
    pub fn is_empty(&self) -> bool {
        self.on_complete.is_none() && self.on_failure.is_none()
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single step in the workflow graph (or nested inside a composite step).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step ID, unique across the whole definition including nested steps.
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Kind-specific configuration.
    pub config: StepConfig,
    /// Parameter mapping; string values may embed `{{ namespace.path }}`
    /// placeholders resolved against the context when the step becomes ready.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    /// Step IDs this step depends on (graph edges).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Guard expressions; all must evaluate true or the step is skipped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<String>,
    #[serde(default, skip_serializing_if = "RetryPolicy::is_disabled")]
    pub retry: RetryPolicy,
    /// Per-attempt timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
    /// An optional step's failure never fails the run.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub optional: bool,
    /// Context output key -> dotted path into this step's outputs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_mapping: BTreeMap<String, String>,
}

impl StepDefinition {
    /// Create a step with the given config and no dependencies.
    pub fn new(id: impl Into<String>, config: StepConfig) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            config,
            parameters: Map::new(),
            depends_on: Vec::new(),
            conditions: Vec::new(),
            retry: RetryPolicy::default(),
            timeout_secs: None,
            optional: false,
            output_mapping: BTreeMap::new(),
        }
    }

    /// Shorthand for an ACTION step bound to `handler`.
    pub fn action(id: impl Into<String>, handler: impl Into<String>) -> Self {
        Self::new(
            id,
            StepConfig::Action {
                handler: handler.into(),
            },
        )
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_condition(mut self, expression: impl Into<String>) -> Self {
        self.conditions.push(expression.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout_secs(mut self, secs: f64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn map_output(mut self, context_key: impl Into<String>, path: impl Into<String>) -> Self {
        self.output_mapping.insert(context_key.into(), path.into());
        self
    }

    pub fn kind(&self) -> StepKind {
        self.config.kind()
    }

    /// Display name, falling back to the ID.
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Kind-specific step configuration.
///
/// Internally tagged by `type`:
/// ```yaml
/// config:
///   type: action
///   handler: fetch_rows
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Delegate to a registered handler.
    Action { handler: String },
    /// Evaluate a guard expression; a false result skips the step.
    Condition { condition: String },
    /// Run nested steps concurrently, tolerating partial failure.
    Parallel {
        steps: Vec<StepDefinition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrency: Option<usize>,
    },
    /// Run `body` once per item with `loop_item` / `loop_index` injected.
    Loop {
        items: LoopItems,
        body: Box<StepDefinition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<usize>,
    },
    /// Suspend on a timer.
    Delay { delay_seconds: f64 },
    /// Suspend until resumed from outside the scheduler.
    Human {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },
}

impl StepConfig {
    pub fn kind(&self) -> StepKind {
        match self {
            StepConfig::Action { .. } => StepKind::Action,
            StepConfig::Condition { .. } => StepKind::Condition,
            StepConfig::Parallel { .. } => StepKind::Parallel,
            StepConfig::Loop { .. } => StepKind::Loop,
            StepConfig::Delay { .. } => StepKind::Delay,
            StepConfig::Human { .. } => StepKind::Human,
        }
    }

    /// Nested step definitions of composite kinds.
    pub fn children(&self) -> Vec<&StepDefinition> {
        match self {
            StepConfig::Parallel { steps, .. } => steps.iter().collect(),
            StepConfig::Loop { body, .. } => vec![body.as_ref()],
            _ => Vec::new(),
        }
    }
}

/// Source collection for a LOOP step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoopItems {
    /// Dotted context path such as `outputs.fetch.rows`.
    Path(String),
    /// Literal items.
    Values(Vec<Value>),
}

/// Fieldless discriminant of `StepConfig`, used in logs and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Action,
    Condition,
    Parallel,
    Loop,
    Delay,
    Human,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Action => "action",
            StepKind::Condition => "condition",
            StepKind::Parallel => "parallel",
            StepKind::Loop => "loop",
            StepKind::Delay => "delay",
            StepKind::Human => "human",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Retry policy for a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure.
    #[serde(default)]
    pub max_retries: u32,
    /// Base delay between attempts.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
    /// Upper bound for exponential back-off.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl RetryPolicy {
    /// Retry up to `max_retries` times with exponential back-off from `retry_delay_ms`.
    pub fn exponential(max_retries: u32, retry_delay_ms: u64) -> Self {
        Self {
            max_retries,
            retry_delay_ms,
            backoff: Backoff::Exponential,
            max_delay_ms: default_max_delay_ms(),
        }
    }

    /// Retry up to `max_retries` times with a constant delay.
    pub fn fixed(max_retries: u32, retry_delay_ms: u64) -> Self {
        Self {
            max_retries,
            retry_delay_ms,
            backoff: Backoff::Fixed,
            max_delay_ms: default_max_delay_ms(),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.max_retries == 0
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_delay_ms: default_retry_delay_ms(),
            backoff: Backoff::default(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    #[default]
    Exponential,
}

// ---------------------------------------------------------------------------
// Execution Status
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowStatus::Created => "CREATED",
            WorkflowStatus::Running => "RUNNING",
            WorkflowStatus::Completed => "COMPLETED",
            WorkflowStatus::Failed => "FAILED",
            WorkflowStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// Whether a record may move from `self` to `next`.
    ///
    /// Records only move forward: pending -> running -> terminal, or
    /// pending -> skipped when a step is skipped before it starts.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (StepStatus::Pending, StepStatus::Running)
                | (StepStatus::Pending, StepStatus::Skipped)
                | (StepStatus::Running, StepStatus::Completed)
                | (StepStatus::Running, StepStatus::Failed)
                | (StepStatus::Running, StepStatus::Skipped)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Step Execution Record
// ---------------------------------------------------------------------------

/// Per-run execution record of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Inputs resolved when the step became ready.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Total attempts made minus one.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl StepExecutionRecord {
    pub fn pending(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            input: None,
            output: None,
            error: None,
            retry_count: 0,
            warnings: Vec::new(),
        }
    }

    /// Move to `next` if the transition is forward; returns whether it applied.
    ///
    /// Stamps `started_at` on entering `running` and `completed_at` on
    /// entering any terminal status.
    pub fn transition(&mut self, next: StepStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        if next == StepStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        true
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Run failure & status report
// ---------------------------------------------------------------------------

/// Why a run ended in FAILED or CANCELLED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunFailure {
    /// A non-optional step failed with continue-on-error disabled.
    StepFailed { step_id: String, error: String },
    /// Pending steps can never become ready.
    Blocked { steps: Vec<String> },
    /// The workflow-level timeout elapsed.
    Timeout { timeout_secs: f64 },
    /// The scheduler needed more rounds than `max_scheduler_ticks` allows.
    TickCapExceeded { ticks: u32 },
    /// The run was cancelled from outside.
    Cancelled,
}

impl RunFailure {
    /// Engine invariant violations, as opposed to ordinary business failure.
    pub fn is_engine_error(&self) -> bool {
        matches!(
            self,
            RunFailure::Blocked { .. } | RunFailure::TickCapExceeded { .. }
        )
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunFailure::StepFailed { step_id, error } => {
                write!(f, "step '{step_id}' failed: {error}")
            }
            RunFailure::Blocked { steps } => write!(
                f,
                "workflow blocked: steps [{}] can never become ready",
                steps.join(", ")
            ),
            RunFailure::Timeout { timeout_secs } => {
                write!(f, "workflow timed out after {timeout_secs}s")
            }
            RunFailure::TickCapExceeded { ticks } => {
                write!(f, "scheduler exceeded tick cap of {ticks} rounds")
            }
            RunFailure::Cancelled => f.write_str("workflow cancelled"),
        }
    }
}

/// Point-in-time status of a run, for polling by an outer API layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatusReport {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    pub total_steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_config_yaml_tagging() {
        let yaml = r#"
id: fan-out
config:
  type: parallel
  max_concurrency: 2
  steps:
    - id: left
      config:
        type: action
        handler: fetch
    - id: right
      config:
        type: delay
        delay_seconds: 0.5
"#;
        let step: StepDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(step.kind(), StepKind::Parallel);
        let children = step.config.children();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].kind(), StepKind::Action);
        assert_eq!(children[1].kind(), StepKind::Delay);
    }

    #[test]
    fn test_loop_items_untagged() {
        let literal: LoopItems = serde_json::from_value(json!([1, 2, 3])).unwrap();
        assert_eq!(literal, LoopItems::Values(vec![json!(1), json!(2), json!(3)]));

        let path: LoopItems = serde_json::from_value(json!("outputs.fetch.rows")).unwrap();
        assert_eq!(path, LoopItems::Path("outputs.fetch.rows".to_string()));
    }

    #[test]
    fn test_definition_defaults() {
        let yaml = r#"
id: report
name: Report
steps:
  - id: a
    config:
      type: action
      handler: noop
"#;
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(def.max_parallel_steps, DEFAULT_MAX_PARALLEL_STEPS);
        assert!(!def.continue_on_error);
        assert!(def.hooks.is_empty());
        assert!(def.steps[0].retry.is_disabled());
        assert_eq!(def.steps[0].retry.backoff, Backoff::Exponential);
    }

    #[test]
    fn test_retry_policy_defaults_from_partial_yaml() {
        let policy: RetryPolicy = serde_yaml_ng::from_str("max_retries: 2").unwrap();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.retry_delay_ms, 1_000);
        assert_eq!(policy.max_delay_ms, 30_000);
    }

    #[test]
    fn test_record_transitions_only_move_forward() {
        let mut record = StepExecutionRecord::pending("a");
        assert!(!record.transition(StepStatus::Completed));
        assert!(record.transition(StepStatus::Running));
        assert!(record.started_at.is_some());
        assert!(record.transition(StepStatus::Completed));
        assert!(record.completed_at.is_some());
        assert!(!record.transition(StepStatus::Running));
        assert!(!record.transition(StepStatus::Pending));
        assert_eq!(record.status, StepStatus::Completed);
    }

    #[test]
    fn test_pending_can_skip_directly() {
        let mut record = StepExecutionRecord::pending("gate");
        assert!(record.transition(StepStatus::Skipped));
        assert!(record.started_at.is_none());
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn test_run_failure_engine_classification() {
        assert!(RunFailure::Blocked { steps: vec!["c".into()] }.is_engine_error());
        assert!(RunFailure::TickCapExceeded { ticks: 1000 }.is_engine_error());
        assert!(!RunFailure::Cancelled.is_engine_error());
        let failed = RunFailure::StepFailed {
            step_id: "load".into(),
            error: "boom".into(),
        };
        assert!(!failed.is_engine_error());
        assert_eq!(failed.to_string(), "step 'load' failed: boom");
    }

    #[test]
    fn test_workflow_status_serde_uppercase() {
        let json = serde_json::to_string(&WorkflowStatus::Completed).unwrap();
        assert_eq!(json, "\"COMPLETED\"");
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
    }
}
