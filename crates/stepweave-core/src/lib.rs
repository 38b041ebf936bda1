//! The stepweave workflow engine.
//!
//! Validates workflow definitions, evaluates step conditions, and schedules
//! steps over a dependency graph with bounded parallelism, retries,
//! timeouts and cancellation. Depends only on `stepweave-types`; step
//! business logic plugs in through `workflow::handler::StepHandler`.

pub mod config;
pub mod event;
pub mod workflow;

pub use workflow::executor::{ExecutorError, RunHandle, RunOptions, WorkflowEngine, WorkflowExecution};
pub use workflow::handler::{HandlerCall, HandlerError, HandlerRegistry, StepHandler, handler_fn};
