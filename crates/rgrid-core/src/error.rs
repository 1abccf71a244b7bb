//! Error types shared across the master

use crate::scheduler::job::JobId;

/// Main error type for rgrid
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Job description errors (bad file, bad fields, bad graph)
    #[error("Invalid job description: {0}")]
    InvalidJob(String),

    /// Lookup of a job id that is neither queued nor scheduled
    #[error("Unknown job: {0}")]
    UnknownJob(JobId),

    /// Lookup of a worker host that is not registered
    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    /// Network errors (admin stream, ping socket)
    #[error("Network error: {0}")]
    Network(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors with description
    #[error("Error: {0}")]
    Other(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        Error::Config(error.to_string())
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(error: validator::ValidationErrors) -> Self {
        Error::InvalidJob(error.to_string())
    }
}

impl Error {
    /// Create a new configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new invalid-job error
    pub fn invalid_job<T: Into<String>>(msg: T) -> Self {
        Error::InvalidJob(msg.into())
    }

    /// Create a new network error
    pub fn network<T: Into<String>>(msg: T) -> Self {
        Error::Network(msg.into())
    }

    /// Get error category for monitoring
    pub fn category(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::InvalidJob(_) => "invalid_job",
            Error::UnknownJob(_) => "unknown_job",
            Error::UnknownWorker(_) => "unknown_worker",
            Error::Network(_) => "network",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::UnknownJob(42);
        assert!(err.to_string().contains("42"));
        assert_eq!(err.category(), "unknown_job");
    }

    #[test]
    fn test_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert_eq!(err.category(), "io");
    }
}
