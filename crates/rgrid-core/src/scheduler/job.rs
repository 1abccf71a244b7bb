//! Job types and definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique job identifier, allocated monotonically by the master
pub type JobId = i64;

/// Group identifier shared by sibling jobs of one meta submission
pub type GroupId = i64;

/// Terminal label attached to a job when it leaves the master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// All task instances completed successfully
    Success,

    /// Retry budget or failed-node budget exhausted
    Failed,

    /// Queue or execution deadline exceeded
    Timeout,

    /// Administrative stop
    Stopped,

    /// Worker hosting a non-reschedulable task was lost
    WorkerLost,

    /// A dependency of this meta-job child failed
    ParentFailed,

    /// Unreleased meta-job child removed by a group stop
    Cancelled,
}

impl CompletionStatus {
    /// Whether this status marks a successful run
    pub fn is_success(&self) -> bool {
        matches!(self, CompletionStatus::Success)
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionStatus::Success => write!(f, "success"),
            CompletionStatus::Failed => write!(f, "failed"),
            CompletionStatus::Timeout => write!(f, "timeout"),
            CompletionStatus::Stopped => write!(f, "stopped"),
            CompletionStatus::WorkerLost => write!(f, "worker_lost"),
            CompletionStatus::ParentFailed => write!(f, "parent_failed"),
            CompletionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What the worker-side executor runs for each task instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecSpec {
    /// Script path or inline source
    pub script: String,

    /// Script language understood by the worker executor
    pub language: String,
}

/// Job definition
///
/// Immutable once submitted; mutable scheduling state lives with the
/// scheduler, keyed by `job_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub job_id: JobId,

    /// Group shared with meta-job siblings
    pub group_id: GroupId,

    /// Optional human-readable name from the description file
    pub name: Option<String>,

    /// Execution payload
    pub exec: ExecSpec,

    /// Priority (higher wins)
    pub priority: i32,

    /// Total task instances to launch
    pub num_tasks: u32,

    /// Max distinct hosts that may fail before the job is abandoned
    pub max_failed_nodes: u32,

    /// Max distinct hosts concurrently assigned (< 0 means unlimited)
    pub max_cluster_cpu: i32,

    /// Max concurrently in-flight task instances (< 0 means unlimited)
    pub max_cpu: i32,

    /// Seconds a job may wait in the queue (< 0 means forever)
    pub queue_timeout: i64,

    /// Seconds a job may execute (< 0 means forever)
    pub job_timeout: i64,

    /// Seconds a single task instance may execute (< 0 means forever)
    pub task_timeout: i64,

    /// Per-host attempt budget (negative means unlimited; 0 collapses to
    /// a single attempt)
    pub max_exec: i32,

    /// Optional worker-group affinity filter
    pub host_group: Option<String>,

    /// Terminate instead of retrying when a hosting worker dies
    pub no_reschedule: bool,

    /// Submission timestamp
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    /// Create a new job with default limits
    pub fn new(job_id: JobId, group_id: GroupId, exec: ExecSpec) -> Self {
        Self {
            job_id,
            group_id,
            name: None,
            exec,
            priority: 0,
            num_tasks: 1,
            max_failed_nodes: 1,
            max_cluster_cpu: -1,
            max_cpu: -1,
            queue_timeout: -1,
            job_timeout: -1,
            task_timeout: -1,
            max_exec: -1,
            host_group: None,
            no_reschedule: false,
            submitted_at: Utc::now(),
        }
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the task count
    pub fn with_num_tasks(mut self, num_tasks: u32) -> Self {
        self.num_tasks = num_tasks;
        self
    }

    /// Set the per-host attempt budget
    pub fn with_max_exec(mut self, max_exec: i32) -> Self {
        self.max_exec = max_exec;
        self
    }

    /// Set the worker-group affinity filter
    pub fn with_host_group(mut self, group: impl Into<String>) -> Self {
        self.host_group = Some(group.into());
        self
    }

    /// Set the queue/job/task timeouts, in seconds
    pub fn with_timeouts(mut self, queue: i64, job: i64, task: i64) -> Self {
        self.queue_timeout = queue;
        self.job_timeout = job;
        self.task_timeout = task;
        self
    }

    /// Disable rescheduling on worker death
    pub fn with_no_reschedule(mut self) -> Self {
        self.no_reschedule = true;
        self
    }

    /// Per-host attempt bound; `None` means unlimited and `max_exec = 0`
    /// collapses to a single attempt
    pub fn attempts_per_host(&self) -> Option<u32> {
        if self.max_exec < 0 {
            None
        } else {
            Some((self.max_exec as u32).max(1))
        }
    }

    /// Total attempt budget across all hosts and tasks; `None` means
    /// unlimited
    pub fn attempt_budget(&self) -> Option<u64> {
        self.attempts_per_host()
            .map(|per_host| u64::from(self.num_tasks) * u64::from(per_host))
    }
}

/// A task instance bound to one worker at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerTask {
    /// Owning job
    pub job_id: JobId,

    /// Task slot within the job, `0..num_tasks`
    pub task_id: u32,

    /// Dispatch instance, incremented per (re)assignment of the job
    pub instance_id: u64,
}

impl WorkerTask {
    pub fn new(job_id: JobId, task_id: u32, instance_id: u64) -> Self {
        Self {
            job_id,
            task_id,
            instance_id,
        }
    }
}

impl fmt::Display for WorkerTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.job_id, self.task_id, self.instance_id)
    }
}

/// Result reported by a worker for one task instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    Failed,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Success)
    }
}

/// Event published when a job reaches a terminal state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCompletion {
    pub job_id: JobId,
    pub group_id: GroupId,
    pub status: CompletionStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec() -> ExecSpec {
        ExecSpec {
            script: "/tmp/task.py".to_string(),
            language: "python".to_string(),
        }
    }

    #[test]
    fn test_job_defaults() {
        let job = Job::new(1, 1, exec());
        assert_eq!(job.num_tasks, 1);
        assert_eq!(job.max_cluster_cpu, -1);
        assert!(!job.no_reschedule);
    }

    #[test]
    fn test_job_builders() {
        let job = Job::new(2, 2, exec())
            .with_priority(9)
            .with_num_tasks(4)
            .with_max_exec(3)
            .with_host_group("gpu")
            .with_timeouts(30, 600, 60);

        assert_eq!(job.priority, 9);
        assert_eq!(job.num_tasks, 4);
        assert_eq!(job.host_group.as_deref(), Some("gpu"));
        assert_eq!(job.queue_timeout, 30);
        assert_eq!(job.job_timeout, 600);
        assert_eq!(job.task_timeout, 60);
    }

    #[test]
    fn test_attempt_budget() {
        let job = Job::new(3, 3, exec()).with_num_tasks(5).with_max_exec(2);
        assert_eq!(job.attempts_per_host(), Some(2));
        assert_eq!(job.attempt_budget(), Some(10));

        // max_exec = 0 means a single attempt per task
        let job = Job::new(4, 4, exec()).with_num_tasks(5).with_max_exec(0);
        assert_eq!(job.attempts_per_host(), Some(1));
        assert_eq!(job.attempt_budget(), Some(5));

        // Negative means unlimited
        let job = Job::new(5, 5, exec()).with_num_tasks(5);
        assert_eq!(job.attempts_per_host(), None);
        assert_eq!(job.attempt_budget(), None);
    }

    #[test]
    fn test_completion_status_labels() {
        assert_eq!(CompletionStatus::Success.to_string(), "success");
        assert_eq!(CompletionStatus::WorkerLost.to_string(), "worker_lost");
        assert_eq!(CompletionStatus::ParentFailed.to_string(), "parent_failed");
        assert!(CompletionStatus::Success.is_success());
        assert!(!CompletionStatus::Timeout.is_success());
    }
}
