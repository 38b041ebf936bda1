//! Event types for the stepweave lifecycle event stream.
//!
//! `WorkflowEvent` is emitted by the scheduler and step runner at every
//! run and step transition. All variants are Clone + Send + Sync for use
//! with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::workflow::StepKind;

/// Lifecycle events of a workflow run.
///
/// Serialized with an internal `type` tag whose value is the event name
/// (`workflow_started`, `step_retrying`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A run passed validation and entered RUNNING.
    WorkflowStarted {
        run_id: Uuid,
        workflow_id: String,
        total_steps: usize,
    },

    /// All steps reached a terminal status.
    WorkflowCompleted {
        run_id: Uuid,
        workflow_id: String,
        duration_ms: u64,
        completed_steps: usize,
        failed_steps: usize,
        skipped_steps: usize,
    },

    /// A step failure or timeout ended the run.
    WorkflowFailed {
        run_id: Uuid,
        workflow_id: String,
        error: String,
    },

    /// The engine itself gave up (deadlock or tick cap).
    WorkflowError {
        run_id: Uuid,
        workflow_id: String,
        error: String,
    },

    WorkflowCancelled { run_id: Uuid, workflow_id: String },

    StepStarted {
        run_id: Uuid,
        step_id: String,
        step_kind: StepKind,
    },

    StepCompleted {
        run_id: Uuid,
        step_id: String,
        duration_ms: u64,
        retry_count: u32,
    },

    StepFailed {
        run_id: Uuid,
        step_id: String,
        error: String,
        retry_count: u32,
    },

    /// An attempt failed and another one is scheduled after `delay_ms`.
    StepRetrying {
        run_id: Uuid,
        step_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    StepSkipped {
        run_id: Uuid,
        step_id: String,
        reason: String,
    },

    /// A HUMAN step is suspended awaiting `resume`.
    StepWaiting {
        run_id: Uuid,
        step_id: String,
        prompt: Option<String>,
    },
}

impl WorkflowEvent {
    /// Stable event name, identical to the serialized `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::WorkflowStarted { .. } => "workflow_started",
            WorkflowEvent::WorkflowCompleted { .. } => "workflow_completed",
            WorkflowEvent::WorkflowFailed { .. } => "workflow_failed",
            WorkflowEvent::WorkflowError { .. } => "workflow_error",
            WorkflowEvent::WorkflowCancelled { .. } => "workflow_cancelled",
            WorkflowEvent::StepStarted { .. } => "step_started",
            WorkflowEvent::StepCompleted { .. } => "step_completed",
            WorkflowEvent::StepFailed { .. } => "step_failed",
            WorkflowEvent::StepRetrying { .. } => "step_retrying",
            WorkflowEvent::StepSkipped { .. } => "step_skipped",
            WorkflowEvent::StepWaiting { .. } => "step_waiting",
        }
    }

    pub fn run_id(&self) -> Uuid {
        match self {
            WorkflowEvent::WorkflowStarted { run_id, .. }
            | WorkflowEvent::WorkflowCompleted { run_id, .. }
            | WorkflowEvent::WorkflowFailed { run_id, .. }
            | WorkflowEvent::WorkflowError { run_id, .. }
            | WorkflowEvent::WorkflowCancelled { run_id, .. }
            | WorkflowEvent::StepStarted { run_id, .. }
            | WorkflowEvent::StepCompleted { run_id, .. }
            | WorkflowEvent::StepFailed { run_id, .. }
            | WorkflowEvent::StepRetrying { run_id, .. }
            | WorkflowEvent::StepSkipped { run_id, .. }
            | WorkflowEvent::StepWaiting { run_id, .. } => *run_id,
        }
    }

    /// Step ID for step-scoped events.
    pub fn step_id(&self) -> Option<&str> {
        match self {
            WorkflowEvent::StepStarted { step_id, .. }
            | WorkflowEvent::StepCompleted { step_id, .. }
            | WorkflowEvent::StepFailed { step_id, .. }
            | WorkflowEvent::StepRetrying { step_id, .. }
            | WorkflowEvent::StepSkipped { step_id, .. }
            | WorkflowEvent::StepWaiting { step_id, .. } => Some(step_id),
            _ => None,
        }
    }

    /// JSON payload handed to listeners (includes the `type` tag).
    pub fn payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
