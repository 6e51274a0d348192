use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum JobflowError {
    EventStoreError(String),
    QueueError(String),
    ValidationError(String),
    DispatchError(String),
    ExecutionError(String),
    ConfigurationError(String),
}

impl fmt::Display for JobflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobflowError::EventStoreError(msg) => write!(f, "Event store error: {msg}"),
            JobflowError::QueueError(msg) => write!(f, "Queue error: {msg}"),
            JobflowError::ValidationError(msg) => write!(f, "Validation error: {msg}"),
            JobflowError::DispatchError(msg) => write!(f, "Dispatch error: {msg}"),
            JobflowError::ExecutionError(msg) => write!(f, "Execution error: {msg}"),
            JobflowError::ConfigurationError(msg) => write!(f, "Configuration error: {msg}"),
        }
    }
}

impl std::error::Error for JobflowError {}

pub type Result<T> = std::result::Result<T, JobflowError>;
