//! Admission queue for submitted jobs
//!
//! FIFO of jobs waiting for promotion into the scheduled set, with an
//! id index for O(1) lookup and deletion. Pushing a job arms its
//! queue-admission deadline.

use crate::scheduler::job::{Job, JobId};
use crate::scheduler::timeout::TimeoutQueue;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::info;

struct Inner {
    // Deleted ids stay in the FIFO as tombstones; pop skips them.
    fifo: VecDeque<JobId>,
    index: HashMap<JobId, Arc<Job>>,
}

/// Thread-safe FIFO of jobs not yet admitted to execution
pub struct JobQueue {
    inner: Mutex<Inner>,
    timeouts: Arc<TimeoutQueue>,
}

impl JobQueue {
    pub fn new(timeouts: Arc<TimeoutQueue>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                fifo: VecDeque::new(),
                index: HashMap::new(),
            }),
            timeouts,
        }
    }

    /// Append a job and arm its queue deadline
    pub fn push(&self, job: Arc<Job>) {
        let job_id = job.job_id;
        let queue_timeout = job.queue_timeout;
        {
            let mut inner = self.inner.lock().expect("job queue lock poisoned");
            inner.fifo.push_back(job_id);
            inner.index.insert(job_id, job);
        }
        self.timeouts.push_queue_timeout(job_id, queue_timeout);
        info!(job_id, "job queued");
    }

    /// Pop the oldest job still present
    pub fn pop(&self) -> Option<Arc<Job>> {
        let mut inner = self.inner.lock().expect("job queue lock poisoned");
        while let Some(job_id) = inner.fifo.pop_front() {
            if let Some(job) = inner.index.remove(&job_id) {
                return Some(job);
            }
        }
        None
    }

    /// Remove a job by id; returns it if it was still queued
    pub fn delete(&self, job_id: JobId) -> Option<Arc<Job>> {
        let mut inner = self.inner.lock().expect("job queue lock poisoned");
        inner.index.remove(&job_id)
    }

    pub fn get(&self, job_id: JobId) -> Option<Arc<Job>> {
        let inner = self.inner.lock().expect("job queue lock poisoned");
        inner.index.get(&job_id).cloned()
    }

    /// Remove and return every queued job sharing a meta group
    pub fn delete_group(&self, group_id: crate::scheduler::job::GroupId) -> Vec<Arc<Job>> {
        let mut inner = self.inner.lock().expect("job queue lock poisoned");
        let ids: Vec<JobId> = inner
            .index
            .values()
            .filter(|job| job.group_id == group_id)
            .map(|job| job.job_id)
            .collect();
        ids.into_iter()
            .filter_map(|job_id| inner.index.remove(&job_id))
            .collect()
    }

    /// Remove and return every queued job
    pub fn drain(&self) -> Vec<Arc<Job>> {
        let mut inner = self.inner.lock().expect("job queue lock poisoned");
        inner.fifo.clear();
        inner.index.drain().map(|(_, job)| job).collect()
    }

    /// Highest queued job id, if any
    pub fn max_job_id(&self) -> Option<JobId> {
        let inner = self.inner.lock().expect("job queue lock poisoned");
        inner.index.keys().max().copied()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("job queue lock poisoned").index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::ExecSpec;

    fn job(job_id: JobId, queue_timeout: i64) -> Arc<Job> {
        Arc::new(
            Job::new(
                job_id,
                job_id,
                ExecSpec {
                    script: "/tmp/t.py".to_string(),
                    language: "python".to_string(),
                },
            )
            .with_timeouts(queue_timeout, -1, -1),
        )
    }

    fn queue() -> JobQueue {
        JobQueue::new(Arc::new(TimeoutQueue::new()))
    }

    #[test]
    fn test_fifo_order() {
        let queue = queue();
        queue.push(job(1, -1));
        queue.push(job(2, -1));
        queue.push(job(3, -1));

        assert_eq!(queue.pop().unwrap().job_id, 1);
        assert_eq!(queue.pop().unwrap().job_id, 2);
        assert_eq!(queue.pop().unwrap().job_id, 3);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_delete_skips_tombstone() {
        let queue = queue();
        queue.push(job(1, -1));
        queue.push(job(2, -1));

        assert!(queue.delete(1).is_some());
        assert!(queue.delete(1).is_none());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().unwrap().job_id, 2);
    }

    #[test]
    fn test_queue_timeout_armed_on_push() {
        let timeouts = Arc::new(TimeoutQueue::new());
        let queue = JobQueue::new(timeouts.clone());

        queue.push(job(1, 30));
        assert_eq!(timeouts.len(), 1);

        // Negative queue timeout arms nothing
        queue.push(job(2, -1));
        assert_eq!(timeouts.len(), 1);
    }

    #[test]
    fn test_max_job_id_and_drain() {
        let queue = queue();
        queue.push(job(5, -1));
        queue.push(job(9, -1));
        queue.push(job(7, -1));
        assert_eq!(queue.max_job_id(), Some(9));

        let drained = queue.drain();
        assert_eq!(drained.len(), 3);
        assert!(queue.is_empty());
        assert_eq!(queue.max_job_id(), None);
    }
}
