//! In-flight jobs and their remaining-execution counters
//!
//! Entries are ordered by priority (higher first, ties broken by lower job
//! id). The set owns the in-flight `Arc<Job>`s; every other component
//! carries a job id and resolves it here. Both structs are plain data
//! guarded by the scheduler's lock, not locked on their own.

use crate::scheduler::job::{CompletionStatus, GroupId, Job, JobCompletion, JobId};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{info, warn};

type PriorityKey = (Reverse<i32>, JobId);

struct JobSlot {
    job: Arc<Job>,
    sent_completely: bool,
}

type CompletionHook = Box<dyn Fn(JobCompletion) + Send + Sync>;

/// Jobs currently being executed, in scheduling order
pub struct ScheduledJobs {
    jobs: BTreeMap<PriorityKey, JobSlot>,
    by_id: HashMap<JobId, PriorityKey>,
    executions: HashMap<JobId, i64>,
    on_completion: Option<CompletionHook>,
}

impl Default for ScheduledJobs {
    fn default() -> Self {
        Self::new()
    }
}

impl ScheduledJobs {
    pub fn new() -> Self {
        Self {
            jobs: BTreeMap::new(),
            by_id: HashMap::new(),
            executions: HashMap::new(),
            on_completion: None,
        }
    }

    /// Register the per-job completion callback, fired on every removal
    pub fn set_completion_hook(&mut self, hook: CompletionHook) {
        self.on_completion = Some(hook);
    }

    fn key_for(job: &Job) -> PriorityKey {
        (Reverse(job.priority), job.job_id)
    }

    /// Admit a job with its remaining-execution counter
    pub fn add(&mut self, job: Arc<Job>, num_exec: i64) {
        let key = Self::key_for(&job);
        self.executions.insert(job.job_id, num_exec);
        self.by_id.insert(job.job_id, key);
        self.jobs.insert(
            key,
            JobSlot {
                job,
                sent_completely: false,
            },
        );
    }

    /// Reduce the remaining-execution counter; at zero the job is removed
    /// with status `success` and returned.
    pub fn decrement_job_execution(&mut self, job_id: JobId, num_tasks: i64) -> Option<Arc<Job>> {
        let remaining = self.executions.get_mut(&job_id)?;
        *remaining -= num_tasks;
        if *remaining < 1 {
            return self.remove_job(job_id, true, CompletionStatus::Success);
        }
        None
    }

    pub fn find_job_by_job_id(&self, job_id: JobId) -> Option<Arc<Job>> {
        let key = self.by_id.get(&job_id)?;
        self.jobs.get(key).map(|slot| slot.job.clone())
    }

    /// Every scheduled job sharing a meta group
    pub fn get_job_group(&self, group_id: GroupId) -> Vec<Arc<Job>> {
        self.jobs
            .values()
            .filter(|slot| slot.job.group_id == group_id)
            .map(|slot| slot.job.clone())
            .collect()
    }

    pub fn get_num_exec(&self, job_id: JobId) -> Option<i64> {
        self.executions.get(&job_id).copied()
    }

    pub fn get_num_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Scheduled job ids in priority order
    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs.values().map(|slot| slot.job.job_id).collect()
    }

    /// Jobs still waiting for task assignments, in priority order
    pub fn jobs_needing_dispatch(&self) -> Vec<Arc<Job>> {
        self.jobs
            .values()
            .filter(|slot| !slot.sent_completely)
            .map(|slot| slot.job.clone())
            .collect()
    }

    pub fn is_sent_completely(&self, job_id: JobId) -> bool {
        self.by_id
            .get(&job_id)
            .and_then(|key| self.jobs.get(key))
            .map(|slot| slot.sent_completely)
            .unwrap_or(false)
    }

    pub fn set_sent_completely(&mut self, job_id: JobId, value: bool) {
        let Some(key) = self.by_id.get(&job_id).copied() else {
            return;
        };
        if let Some(slot) = self.jobs.get_mut(&key) {
            slot.sent_completely = value;
        }
    }

    /// Remove a job, firing the completion callback. Returns the removed
    /// job so the caller can run its own eviction steps.
    pub fn remove_job(
        &mut self,
        job_id: JobId,
        success: bool,
        status: CompletionStatus,
    ) -> Option<Arc<Job>> {
        self.executions.remove(&job_id);
        let Some(key) = self.by_id.remove(&job_id) else {
            warn!(job_id, "remove_job: job not found");
            return None;
        };
        let slot = self.jobs.remove(&key)?;

        info!(job_id, group_id = slot.job.group_id, %status, success, "job completed");
        if let Some(hook) = &self.on_completion {
            hook(JobCompletion {
                job_id,
                group_id: slot.job.group_id,
                status,
            });
        }
        Some(slot.job)
    }

    /// Remove everything with status `timeout` (emergency drain)
    pub fn clear(&mut self) -> Vec<Arc<Job>> {
        let ids = self.job_ids();
        ids.into_iter()
            .filter_map(|job_id| self.remove_job(job_id, false, CompletionStatus::Timeout))
            .collect()
    }
}

/// Per-host attempt counts for each job
///
/// Forbids retrying a task on a host that already burned its per-host
/// attempt budget.
#[derive(Debug, Default)]
pub struct JobExecHistory {
    history: HashMap<JobId, HashMap<IpAddr, u32>>,
}

impl JobExecHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, job_id: JobId, host_ip: IpAddr) {
        *self
            .history
            .entry(job_id)
            .or_default()
            .entry(host_ip)
            .or_insert(0) += 1;
    }

    pub fn get_num_exec(&self, job_id: JobId, host_ip: &IpAddr) -> u32 {
        self.history
            .get(&job_id)
            .and_then(|per_host| per_host.get(host_ip))
            .copied()
            .unwrap_or(0)
    }

    /// Attempts summed over every host
    pub fn total_attempts(&self, job_id: JobId) -> u64 {
        self.history
            .get(&job_id)
            .map(|per_host| per_host.values().map(|&n| u64::from(n)).sum())
            .unwrap_or(0)
    }

    pub fn remove_job(&mut self, job_id: JobId) {
        self.history.remove(&job_id);
    }
}
