//! Runtime configuration.
//!
//! [`RuntimeConfig`] can be built in code, deserialized as part of a larger
//! application config, or read from `SPINDLE_*` environment variables.

use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const WORKERS_VAR: &str = "SPINDLE_WORKERS";
const YIELD_AFTER_VAR: &str = "SPINDLE_YIELD_AFTER";
const THREAD_NAME_VAR: &str = "SPINDLE_THREAD_NAME";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of worker threads fibers are multiplexed onto.
    pub workers: usize,
    /// Interpreter steps a fiber may take before it yields to other ready fibers.
    pub yield_after: u32,
    /// Prefix for worker and timer thread names.
    pub thread_name: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get().min(4))
            .unwrap_or(1);
        RuntimeConfig {
            workers,
            yield_after: 2048,
            thread_name: "spindle".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Start from the defaults and apply any `SPINDLE_*` overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = RuntimeConfig::default();
        if let Some(workers) = read_var(WORKERS_VAR)? {
            config.workers = workers;
        }
        if let Some(yield_after) = read_var(YIELD_AFTER_VAR)? {
            config.yield_after = yield_after;
        }
        if let Ok(name) = env::var(THREAD_NAME_VAR) {
            config.thread_name = name;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_yield_after(mut self, yield_after: u32) -> Self {
        self.yield_after = yield_after;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.yield_after == 0 {
            return Err(ConfigError::NoFuel);
        }
        Ok(())
    }
}

fn read_var<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Parse { var, value }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RuntimeConfig::default();
        assert!(config.workers >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_workers_and_fuel() {
        let no_workers = RuntimeConfig::default().with_workers(0);
        assert!(matches!(no_workers.validate(), Err(ConfigError::NoWorkers)));

        let no_fuel = RuntimeConfig::default().with_yield_after(0);
        assert!(matches!(no_fuel.validate(), Err(ConfigError::NoFuel)));
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let config: RuntimeConfig = serde_json::from_str(r#"{ "workers": 3 }"#).unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.yield_after, RuntimeConfig::default().yield_after);
        assert_eq!(config.thread_name, "spindle");
    }

    #[test]
    fn test_serialized_config_reads_back() {
        let config = RuntimeConfig::default()
            .with_workers(2)
            .with_yield_after(64)
            .with_thread_name("pool");
        let json = serde_json::to_string(&config).unwrap();
        let back: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
