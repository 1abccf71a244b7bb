pub mod config;
pub mod error;
pub mod master;
pub mod scheduler;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use master::{Master, MasterChannels};
pub use scheduler::{
    CompletionStatus, Job, JobCompletion, JobId, JobInfo, Scheduler, SchedulerStats, Submission,
    TaskOutcome, WorkerTask,
};

/// Current version of rgrid
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
    }
}
