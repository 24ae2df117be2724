//! Errors raised by the runtime itself, as opposed to failures of the effects it runs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("a runtime needs at least one worker thread")]
    NoWorkers,

    #[error("yield_after must be greater than zero")]
    NoFuel,

    #[error("invalid value {value:?} for {var}")]
    Parse { var: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid runtime configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to spawn runtime thread {name}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}
