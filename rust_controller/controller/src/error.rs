use thiserror::Error;

use prelude::*;

/// Malformed input or configuration. Returned before any solve is attempted.
#[derive(Debug, Error)]
pub enum MpcError {
    #[error("expected {expected} reference curve coefficients, got {actual}")]
    CoefficientCount { expected: usize, actual: usize },

    #[error("reference curve coefficients are not finite")]
    NonFiniteCurve,

    #[error("state component {field} is not finite")]
    NonFiniteState { field: &'static str },

    #[error("horizon must be at least 2 steps, got {0}")]
    InvalidHorizon(usize),

    #[error("invalid value for {name}: {value}")]
    InvalidParameter { name: &'static str, value: float },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("unable to deserialise config: {0}")]
    Deserialise(#[from] toml::de::Error),
}
