//! Engine configuration loader.
//!
//! Reads an `EngineConfig` from a TOML file. Falls back to defaults when the
//! file is missing or malformed, so a bad config never prevents a run.

use std::path::Path;

use stepweave_types::config::EngineConfig;

/// Conventional config file name looked up next to workflow files.
pub const CONFIG_FILE_NAME: &str = "stepweave.toml";

/// Load engine configuration from `path`.
///
/// - Missing file: returns [`EngineConfig::default()`].
/// - Unreadable or unparseable file: logs a warning and returns the default.
/// - Otherwise returns the parsed config, with unspecified keys defaulted.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => sanitize(config),
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            EngineConfig::default()
        }
    }
}

/// Clamp values the engine cannot work with.
fn sanitize(mut config: EngineConfig) -> EngineConfig {
    if config.max_scheduler_ticks == 0 {
        tracing::warn!("max_scheduler_ticks must be >= 1, using default");
        config.max_scheduler_ticks = EngineConfig::default().max_scheduler_ticks;
    }
    if config.event_bus_capacity == 0 {
        config.event_bus_capacity = 1;
    }
    if let Some(secs) = config.default_step_timeout_secs {
        if !secs.is_finite() || secs <= 0.0 {
            tracing::warn!("ignoring non-positive default_step_timeout_secs {secs}");
            config.default_step_timeout_secs = None;
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(&tmp.path().join(CONFIG_FILE_NAME)).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        tokio::fs::write(
            &path,
            r#"
max_scheduler_ticks = 50
default_step_timeout_secs = 2.5
skipped_satisfies_dependency = true
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(&path).await;
        assert_eq!(config.max_scheduler_ticks, 50);
        assert_eq!(config.default_step_timeout_secs, Some(2.5));
        assert!(config.skipped_satisfies_dependency);
        assert_eq!(config.cancel_grace_ms, 2_000);
    }

    #[tokio::test]
    async fn load_engine_config_malformed_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        tokio::fs::write(&path, "max_scheduler_ticks = \"lots\"").await.unwrap();

        assert_eq!(load_engine_config(&path).await, EngineConfig::default());
    }

    #[tokio::test]
    async fn load_engine_config_clamps_unusable_values() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(CONFIG_FILE_NAME);
        tokio::fs::write(
            &path,
            "max_scheduler_ticks = 0\nevent_bus_capacity = 0\ndefault_step_timeout_secs = -3.0\n",
        )
        .await
        .unwrap();

        let config = load_engine_config(&path).await;
        assert_eq!(config.max_scheduler_ticks, 1_000);
        assert_eq!(config.event_bus_capacity, 1);
        assert!(config.default_step_timeout_secs.is_none());
    }
}
