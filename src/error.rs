use thiserror::Error;

#[derive(Error, Debug)]
pub enum StevedoreError {
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {message}")]
    Validation { message: String },

    /// An illegal state transition was requested on a job. This is a defect in the
    /// caller, not a benign race.
    #[error("Invalid transition for job {job_id}: cannot {action} while {status}")]
    InvalidTransition {
        job_id: String,
        status: String,
        action: &'static str,
    },

    #[error("Lock for job {job_id} is not held by worker {worker_id}")]
    LockNotHeld { job_id: String, worker_id: String },

    #[error("Queue {queue_name} is closed")]
    QueueClosed { queue_name: String },

    #[error("Worker error: {message}")]
    Worker { message: String },

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StevedoreError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        StevedoreError::Validation {
            message: message.into(),
        }
    }
}

/// Error returned by a job processor.
///
/// Carries the message recorded as the job's failure reason and optional stack lines
/// stored when the failure is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProcessingFailure {
    pub message: String,
    pub stacktrace: Vec<String>,
}

impl ProcessingFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stacktrace: Vec::new(),
        }
    }

    pub fn with_stacktrace(mut self, stacktrace: Vec<String>) -> Self {
        self.stacktrace = stacktrace;
        self
    }
}

impl From<String> for ProcessingFailure {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ProcessingFailure {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<StevedoreError> for ProcessingFailure {
    fn from(err: StevedoreError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<serde_json::Error> for ProcessingFailure {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<std::io::Error> for ProcessingFailure {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

impl From<toml::de::Error> for StevedoreError {
    fn from(err: toml::de::Error) -> Self {
        StevedoreError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for StevedoreError {
    fn from(err: toml::ser::Error) -> Self {
        StevedoreError::Config(format!("TOML serialization error: {}", err))
    }
}
