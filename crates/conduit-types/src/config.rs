//! Engine configuration types.
//!
//! `EngineConfig` is the `conduit.toml` file that tunes the interpreter's
//! worker pool, conflict handling and safety limits.

use serde::{Deserialize, Serialize};

/// Top-level engine configuration. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on concurrently executing call tasks per drive.
    #[serde(default = "default_max_parallel_effects")]
    pub max_parallel_effects: usize,

    /// Reload-and-recompute attempts after a stale instance write.
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,

    /// Capacity of the engine event broadcast channel.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Iteration cap for a single `for` task.
    #[serde(default = "default_max_for_iterations")]
    pub max_for_iterations: usize,

    /// Timeout applied to call tasks without `timeout_secs`.
    #[serde(default = "default_call_timeout_secs")]
    pub default_call_timeout_secs: u64,

    /// Signals one drive may process before the instance is faulted.
    /// Bounds goto cycles that never suspend.
    #[serde(default = "default_max_drive_steps")]
    pub max_drive_steps: usize,
}

fn default_max_parallel_effects() -> usize {
    16
}

fn default_max_conflict_retries() -> u32 {
    3
}

fn default_event_bus_capacity() -> usize {
    1024
}

fn default_max_for_iterations() -> usize {
    10_000
}

fn default_call_timeout_secs() -> u64 {
    300
}

fn default_max_drive_steps() -> usize {
    100_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_effects: default_max_parallel_effects(),
            max_conflict_retries: default_max_conflict_retries(),
            event_bus_capacity: default_event_bus_capacity(),
            max_for_iterations: default_max_for_iterations(),
            default_call_timeout_secs: default_call_timeout_secs(),
            max_drive_steps: default_max_drive_steps(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_parallel_effects, 16);
        assert_eq!(config.max_conflict_retries, 3);
        assert_eq!(config.event_bus_capacity, 1024);
        assert_eq!(config.max_for_iterations, 10_000);
        assert_eq!(config.default_call_timeout_secs, 300);
        assert_eq!(config.max_drive_steps, 100_000);
    }

    #[test]
    fn test_engine_config_empty_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_partial_override() {
        let toml_str = r#"
max_parallel_effects = 4
default_call_timeout_secs = 30
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_parallel_effects, 4);
        assert_eq!(config.default_call_timeout_secs, 30);
        assert_eq!(config.max_conflict_retries, 3);
    }

    #[test]
    fn test_engine_config_toml_roundtrip() {
        let config = EngineConfig {
            max_for_iterations: 50,
            ..EngineConfig::default()
        };
        let text = toml::to_string(&config).unwrap();
        let parsed: EngineConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
