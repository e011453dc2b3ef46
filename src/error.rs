use thiserror::Error;

#[derive(Error, Debug)]
pub enum AutopayError {
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Bank account verification failed: {0}")]
    VerificationFailed(String),
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Processor error: {0}")]
    ProcessorError(String),
    #[error("ACH autopay is not enabled")]
    Disabled,
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

impl From<config::ConfigError> for AutopayError {
    fn from(err: config::ConfigError) -> Self {
        AutopayError::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for AutopayError {
    fn from(err: serde_json::Error) -> Self {
        AutopayError::InternalError(Box::new(err))
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for AutopayError {
    fn from(err: rocksdb::Error) -> Self {
        AutopayError::InternalError(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, AutopayError>;
