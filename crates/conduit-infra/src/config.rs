//! Engine configuration loader.
//!
//! Reads a TOML file into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed, so a bad config never stops the engine
//! from starting.

use std::path::Path;

use conduit_types::config::EngineConfig;

/// Default config file name inside a data directory.
pub const CONFIG_FILE: &str = "conduit.toml";

/// Load engine configuration from `path`.
///
/// - Missing file: returns [`EngineConfig::default()`].
/// - Unreadable or unparseable file: logs a warning and returns the default.
/// - Otherwise the parsed config; absent fields take their defaults.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no engine config found, using defaults");
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to read engine config, using defaults");
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => {
            tracing::debug!(path = %path.display(), ?config, "engine config loaded");
            config
        }
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to parse engine config, using defaults");
            EngineConfig::default()
        }
    }
}
