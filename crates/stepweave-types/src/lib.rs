//! Shared domain types for stepweave.
//!
//! Definitions, per-run records, statuses, lifecycle events and engine
//! configuration used by the engine, the CLI and any embedding service.
//!
//! No async or I/O dependencies -- only serde, serde_json, uuid, chrono.

pub mod config;
pub mod event;
pub mod workflow;
