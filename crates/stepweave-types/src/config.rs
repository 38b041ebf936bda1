//! Engine configuration types for stepweave.
//!
//! `EngineConfig` holds the knobs the scheduler reads at run time. It is
//! usually loaded from a `stepweave.toml`; every field has a default so
//! an empty file (or no file) is valid.

use serde::{Deserialize, Serialize};

/// Scheduler and runner settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Safety cap on scheduler rounds per run.
    ///
    /// A round runs at start and after each top-level step settles, as long as
    /// some step is still pending. A linear chain of N steps therefore needs N
    /// rounds; raise the cap for definitions with more top-level steps.
    #[serde(default = "default_max_scheduler_ticks")]
    pub max_scheduler_ticks: u32,

    /// How long in-flight steps get to exit after cancellation before they are aborted.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    /// Iteration cap for LOOP steps that do not declare `max_iterations`.
    #[serde(default = "default_loop_max_iterations")]
    pub loop_max_iterations: usize,

    /// Per-attempt timeout for steps without their own `timeout_secs`.
    #[serde(default)]
    pub default_step_timeout_secs: Option<f64>,

    /// Whether a skipped dependency counts as satisfied.
    #[serde(default)]
    pub skipped_satisfies_dependency: bool,

    /// Capacity of the broadcast event bus.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_max_scheduler_ticks() -> u32 {
    1_000
}

fn default_cancel_grace_ms() -> u64 {
    2_000
}

fn default_loop_max_iterations() -> usize {
    100
}

fn default_event_bus_capacity() -> usize {
    1_024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_scheduler_ticks: default_max_scheduler_ticks(),
            cancel_grace_ms: default_cancel_grace_ms(),
            loop_max_iterations: default_loop_max_iterations(),
            default_step_timeout_secs: None,
            skipped_satisfies_dependency: false,
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_scheduler_ticks, 1_000);
        assert_eq!(config.cancel_grace_ms, 2_000);
        assert_eq!(config.loop_max_iterations, 100);
        assert!(config.default_step_timeout_secs.is_none());
        assert!(!config.skipped_satisfies_dependency);
        assert_eq!(config.event_bus_capacity, 1_024);
    }

    #[test]
    fn test_engine_config_deserialize_empty() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
max_scheduler_ticks = 50
default_step_timeout_secs = 2.5
skipped_satisfies_dependency = true
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_scheduler_ticks, 50);
        assert_eq!(config.default_step_timeout_secs, Some(2.5));
        assert!(config.skipped_satisfies_dependency);
        assert_eq!(config.cancel_grace_ms, 2_000);
    }
}
