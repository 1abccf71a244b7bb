//! Deadline-ordered timeout queue
//!
//! Holds `(deadline, event)` entries behind a mutex. A single dispatcher
//! task wakes at most once a second, pops every due entry and hands it to
//! the registered handler with the lock released. Events are tagged
//! variants carrying the identifiers needed to resolve state at fire time,
//! so a stale event on an already-evicted job is harmless.

use crate::scheduler::job::{JobId, WorkerTask};
use crate::scheduler::registry::WorkerCommand;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Dispatcher tick granularity
const TICK: Duration = Duration::from_secs(1);

/// Expired-deadline callbacks, dispatched by kind
#[derive(Debug, Clone)]
pub enum TimeoutEvent {
    /// A task instance exceeded its execution deadline
    TaskTimeout { task: WorkerTask, host_ip: IpAddr },

    /// A job exceeded its execution deadline
    JobTimeout { job_id: JobId },

    /// A job waited too long in the admission queue
    QueueTimeout { job_id: JobId },

    /// Deliver a delayed command to a worker (cooperative task stop)
    StopTask {
        command: WorkerCommand,
        host_ip: IpAddr,
    },
}

/// Receiver side of the dispatcher loop
#[async_trait::async_trait]
pub trait TimeoutHandler: Send + Sync {
    async fn handle_timeout(&self, event: TimeoutEvent);
}

/// Deadline-ordered multimap of pending timeout events
pub struct TimeoutQueue {
    entries: Mutex<BTreeMap<(Instant, u64), TimeoutEvent>>,
    seq: AtomicU64,
    stopped: AtomicBool,
    wakeup: Notify,
}

impl Default for TimeoutQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeoutQueue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            wakeup: Notify::new(),
        }
    }

    /// Register an event `delay_secs` from now; negative delays register nothing
    pub fn push(&self, event: TimeoutEvent, delay_secs: i64) {
        if delay_secs < 0 {
            return;
        }
        let deadline = Instant::now() + Duration::from_secs(delay_secs as u64);
        // seq breaks ties so equal deadlines fire in insertion order
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.entries
            .lock()
            .expect("timeout queue lock poisoned")
            .insert((deadline, seq), event);
    }

    /// Arm a task execution deadline
    pub fn push_task_timeout(&self, task: WorkerTask, host_ip: IpAddr, timeout_secs: i64) {
        self.push(TimeoutEvent::TaskTimeout { task, host_ip }, timeout_secs);
    }

    /// Arm a job execution deadline
    pub fn push_job_timeout(&self, job_id: JobId, timeout_secs: i64) {
        self.push(TimeoutEvent::JobTimeout { job_id }, timeout_secs);
    }

    /// Arm a queue-admission deadline
    pub fn push_queue_timeout(&self, job_id: JobId, timeout_secs: i64) {
        self.push(TimeoutEvent::QueueTimeout { job_id }, timeout_secs);
    }

    /// Schedule a delayed outbound worker command
    pub fn push_stop_command(&self, command: WorkerCommand, host_ip: IpAddr, delay_secs: i64) {
        self.push(TimeoutEvent::StopTask { command, host_ip }, delay_secs);
    }

    /// Number of armed entries
    pub fn len(&self) -> usize {
        self.entries.lock().expect("timeout queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pop every entry whose deadline has passed, in deadline order
    fn pop_due(&self, now: Instant) -> Vec<TimeoutEvent> {
        let mut due = Vec::new();
        let mut entries = self.entries.lock().expect("timeout queue lock poisoned");
        while let Some(entry) = entries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            due.push(entry.remove());
        }
        due
    }

    /// Stop the dispatcher loop; it terminates within one tick
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wakeup.notify_waiters();
        self.wakeup.notify_one();
    }

    /// Dispatcher loop. Run as a dedicated task; events are handled with
    /// the entry lock released.
    pub async fn run(self: Arc<Self>, handler: Arc<dyn TimeoutHandler>) {
        debug!("timeout dispatcher started");
        while !self.stopped.load(Ordering::SeqCst) {
            tokio::select! {
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(TICK) => {}
            }
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            for event in self.pop_due(Instant::now()) {
                handler.handle_timeout(event).await;
            }
        }
        debug!("timeout dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Mutex as StdMutex;

    struct Recorder {
        events: StdMutex<Vec<TimeoutEvent>>,
    }

    #[async_trait::async_trait]
    impl TimeoutHandler for Recorder {
        async fn handle_timeout(&self, event: TimeoutEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
    }

    #[tokio::test]
    async fn test_negative_delay_registers_nothing() {
        let queue = TimeoutQueue::new();
        queue.push_job_timeout(1, -1);
        queue.push_queue_timeout(1, -5);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_pop_due_orders_by_deadline_then_insertion() {
        let queue = TimeoutQueue::new();
        queue.push_job_timeout(1, 0);
        queue.push_job_timeout(2, 0);
        queue.push_job_timeout(3, 1000);

        let due = queue.pop_due(Instant::now());
        let ids: Vec<JobId> = due
            .iter()
            .map(|e| match e {
                TimeoutEvent::JobTimeout { job_id } => *job_id,
                _ => panic!("unexpected event"),
            })
            .collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatcher_fires_due_events() {
        let queue = Arc::new(TimeoutQueue::new());
        let recorder = Arc::new(Recorder {
            events: StdMutex::new(Vec::new()),
        });

        queue.push_task_timeout(WorkerTask::new(7, 0, 1), ip(), 2);
        let handle = tokio::spawn(queue.clone().run(recorder.clone()));

        tokio::time::sleep(Duration::from_secs(4)).await;
        queue.stop();
        handle.await.unwrap();

        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            TimeoutEvent::TaskTimeout { task, .. } => assert_eq!(task.job_id, 7),
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
