//! Workflow engine core: definition I/O, validation, and DAG execution.
//!
//! - `definition` -- YAML/JSON parsing, filesystem load/save, templates
//! - `dag` -- dependency validation, cycle detection, diagnostic levels
//! - `context` -- run context, path lookup, placeholder resolution
//! - `expression` -- restricted condition parser and evaluator
//! - `handler` -- ACTION handler trait and registry
//! - `events` -- lifecycle listeners and the emitter
//! - `retry` -- retry decisions and back-off delays
//! - `step_runner` -- single-step execution for every step kind
//! - `executor` -- the scheduler loop and `WorkflowEngine`

pub mod context;
pub mod dag;
pub mod definition;
pub mod events;
pub mod executor;
pub mod expression;
pub mod handler;
pub mod retry;
pub mod step_runner;
