use thiserror::Error;

#[derive(Debug, Error)]
pub enum RainbowError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

pub type Result<T> = std::result::Result<T, RainbowError>;
