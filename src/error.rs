use thiserror::Error;

/// Failures that end a run or the whole sweep. Policy and metrics code
/// degrades locally instead of producing these.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("simulator failure: {0}")]
    Simulator(String),

    #[error("invalid value '{value}' for parameter '{name}'")]
    InvalidParameter { name: String, value: String },

    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("unknown scenario '{0}'")]
    UnknownScenario(String),

    #[error("unknown policy '{0}'")]
    UnknownPolicy(String),
}

pub type Result<T> = std::result::Result<T, SimError>;
