//! Worker membership and per-host state
//!
//! The registry tracks every known worker host, its group tag, resolved
//! address, liveness counters and capacity. Capacity counters are only
//! mutated through the scheduler's assignment passes, which serialize all
//! reservations; the ping loop touches liveness counters only.

use crate::scheduler::job::JobId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Known but never heard from
    Init,

    /// Answering pings, eligible for assignment
    Ready,

    /// Stopped answering pings
    NotAvail,

    /// Administratively removed from rotation
    Disabled,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => WorkerState::Ready,
            2 => WorkerState::NotAvail,
            3 => WorkerState::Disabled,
            _ => WorkerState::Init,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            WorkerState::Init => 0,
            WorkerState::Ready => 1,
            WorkerState::NotAvail => 2,
            WorkerState::Disabled => 3,
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Init => write!(f, "init"),
            WorkerState::Ready => write!(f, "ready"),
            WorkerState::NotAvail => write!(f, "not_avail"),
            WorkerState::Disabled => write!(f, "disabled"),
        }
    }
}

/// Command delivered to a worker through the outbound IO layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Abort a running task instance
    StopTask { job_id: JobId, task_id: u32 },
}

/// One remote compute node
pub struct Worker {
    host: String,
    group: String,
    num_cpu: u32,
    state: AtomicU8,
    ip: OnceLock<IpAddr>,
    num_exec: AtomicU32,
    ping_response_count: AtomicU32,
    dropped_count: AtomicU32,
}

impl Worker {
    pub fn new(host: impl Into<String>, group: impl Into<String>, num_cpu: u32) -> Self {
        Self {
            host: host.into(),
            group: group.into(),
            num_cpu,
            state: AtomicU8::new(WorkerState::Init.as_u8()),
            ip: OnceLock::new(),
            num_exec: AtomicU32::new(0),
            ping_response_count: AtomicU32::new(0),
            dropped_count: AtomicU32::new(0),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn num_cpu(&self) -> u32 {
        self.num_cpu
    }

    pub fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: WorkerState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    /// Resolved address, if the first ping round has resolved it
    pub fn ip(&self) -> Option<IpAddr> {
        self.ip.get().copied()
    }

    pub fn num_exec(&self) -> u32 {
        self.num_exec.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == WorkerState::Ready
    }

    pub fn has_capacity(&self) -> bool {
        self.num_exec() < self.num_cpu
    }

    /// Reserve one task slot. Callers hold the scheduler lock.
    pub(crate) fn reserve(&self) {
        self.num_exec.fetch_add(1, Ordering::SeqCst);
    }

    /// Release one task slot; going below zero is an accounting bug that is
    /// logged and clamped.
    pub(crate) fn release(&self) {
        let result = self
            .num_exec
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if result.is_err() {
            error!(host = %self.host, "task slot released on idle worker, clamping at zero");
        }
    }

    /// Drop all reservations (the worker is gone)
    pub(crate) fn zero_exec(&self) {
        self.num_exec.store(0, Ordering::SeqCst);
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("host", &self.host)
            .field("group", &self.group)
            .field("num_cpu", &self.num_cpu)
            .field("state", &self.state())
            .field("ip", &self.ip())
            .field("num_exec", &self.num_exec())
            .finish()
    }
}

/// Aggregate worker counters for reporting
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_workers: usize,
    pub ready_workers: usize,
    pub not_avail_workers: usize,
    pub total_cpu: u32,
    pub used_cpu: u32,
}

/// Membership and state for the whole worker fleet
pub struct WorkerRegistry {
    workers: DashMap<String, Arc<Worker>>,
    by_ip: DashMap<IpAddr, Arc<Worker>>,
    commands: mpsc::UnboundedSender<(WorkerCommand, IpAddr)>,
    max_dropped: u32,
}

impl WorkerRegistry {
    /// Create a registry; the receiver is consumed by the worker IO layer.
    pub fn new(max_dropped: u32) -> (Self, mpsc::UnboundedReceiver<(WorkerCommand, IpAddr)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                workers: DashMap::new(),
                by_ip: DashMap::new(),
                commands: tx,
                max_dropped,
            },
            rx,
        )
    }

    /// Register a host under a group. Returns false if the host is already known.
    pub fn add_worker_host(
        &self,
        group: impl Into<String>,
        host: impl Into<String>,
        num_cpu: u32,
    ) -> bool {
        let host = host.into();
        if self.workers.contains_key(&host) {
            warn!(%host, "worker host already registered");
            return false;
        }
        let worker = Arc::new(Worker::new(host.clone(), group, num_cpu));
        info!(host = %worker.host(), group = %worker.group(), num_cpu, "worker host added");
        self.workers.insert(host, worker);
        true
    }

    /// Register every host of a group in one pass
    pub fn add_worker_group<I, S>(&self, group: &str, hosts: I, num_cpu: u32)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for host in hosts {
            self.add_worker_host(group, host, num_cpu);
        }
    }

    /// Remove a host; the caller is responsible for rescuing its tasks.
    pub fn delete_worker_host(&self, host: &str) -> Option<Arc<Worker>> {
        let removed = self.workers.remove(host).map(|(_, w)| w);
        if let Some(worker) = &removed {
            if let Some(ip) = worker.ip() {
                self.by_ip.remove(&ip);
            }
            info!(%host, "worker host deleted");
        }
        removed
    }

    /// Remove every host of a group; returns the removed workers.
    pub fn delete_worker_group(&self, group: &str) -> Vec<Arc<Worker>> {
        let hosts: Vec<String> = self
            .workers
            .iter()
            .filter(|e| e.value().group() == group)
            .map(|e| e.key().clone())
            .collect();
        hosts
            .iter()
            .filter_map(|host| self.delete_worker_host(host))
            .collect()
    }

    /// Snapshot of workers, optionally restricted to a group
    pub fn get_workers(&self, group: Option<&str>) -> Vec<Arc<Worker>> {
        self.workers
            .iter()
            .filter(|e| group.map_or(true, |g| e.value().group() == g))
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn get_by_host(&self, host: &str) -> Option<Arc<Worker>> {
        self.workers.get(host).map(|e| e.value().clone())
    }

    pub fn get_by_ip(&self, ip: &IpAddr) -> Option<Arc<Worker>> {
        self.by_ip.get(ip).map(|e| e.value().clone())
    }

    /// Record a host's resolved address. Set once; later resolutions are ignored.
    pub fn set_worker_ip(&self, host: &str, ip: IpAddr) {
        if let Some(worker) = self.get_by_host(host) {
            if worker.ip.set(ip).is_ok() {
                info!(%host, %ip, "worker address resolved");
                self.by_ip.insert(ip, worker);
            }
        }
    }

    /// Record a ping reply. Returns the worker if this reply made it Ready.
    pub fn on_ping_response(&self, ip: &IpAddr) -> Option<Arc<Worker>> {
        let worker = self.get_by_ip(ip)?;
        worker.ping_response_count.fetch_add(1, Ordering::SeqCst);
        worker.dropped_count.store(0, Ordering::SeqCst);
        match worker.state() {
            WorkerState::Init | WorkerState::NotAvail => {
                worker.set_state(WorkerState::Ready);
                info!(host = %worker.host(), %ip, "worker became ready");
                Some(worker)
            }
            _ => None,
        }
    }

    /// Periodic liveness sweep. Workers silent for this whole window get
    /// their dropped counter bumped; past the threshold they are marked
    /// unavailable and returned so the scheduler can rescue their tasks.
    pub fn check_dropped_ping_responses(&self) -> Vec<Arc<Worker>> {
        let mut lost = Vec::new();
        for entry in self.workers.iter() {
            let worker = entry.value();
            let responses = worker.ping_response_count.swap(0, Ordering::SeqCst);
            if responses > 0 {
                worker.dropped_count.store(0, Ordering::SeqCst);
                continue;
            }
            let dropped = worker.dropped_count.fetch_add(1, Ordering::SeqCst) + 1;
            if dropped >= self.max_dropped && worker.state() == WorkerState::Ready {
                worker.set_state(WorkerState::NotAvail);
                warn!(host = %worker.host(), dropped, "worker stopped answering pings");
                lost.push(worker.clone());
            }
        }
        lost
    }

    /// Queue an outbound command for a worker
    pub fn add_command(&self, command: WorkerCommand, host_ip: IpAddr) {
        if self.commands.send((command, host_ip)).is_err() {
            warn!(%host_ip, "worker command channel closed, command dropped");
        }
    }

    /// Aggregate counters for the stat report
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in self.workers.iter() {
            let worker = entry.value();
            stats.total_workers += 1;
            match worker.state() {
                WorkerState::Ready => {
                    stats.ready_workers += 1;
                    stats.total_cpu += worker.num_cpu();
                    stats.used_cpu += worker.num_exec();
                }
                WorkerState::NotAvail => stats.not_avail_workers += 1,
                _ => {}
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn registry() -> WorkerRegistry {
        WorkerRegistry::new(3).0
    }

    #[test]
    fn test_add_and_delete_hosts() {
        let registry = registry();
        assert!(registry.add_worker_host("g", "w1", 4));
        assert!(!registry.add_worker_host("g", "w1", 4));
        assert_eq!(registry.get_workers(None).len(), 1);

        assert!(registry.delete_worker_host("w1").is_some());
        assert!(registry.delete_worker_host("w1").is_none());
        assert!(registry.get_workers(None).is_empty());
    }

    #[test]
    fn test_group_membership() {
        let registry = registry();
        registry.add_worker_group("gpu", ["w1", "w2"], 2);
        registry.add_worker_host("cpu", "w3", 8);

        assert_eq!(registry.get_workers(Some("gpu")).len(), 2);
        assert_eq!(registry.get_workers(Some("cpu")).len(), 1);

        let removed = registry.delete_worker_group("gpu");
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.get_workers(None).len(), 1);
    }

    #[test]
    fn test_ip_set_once() {
        let registry = registry();
        registry.add_worker_host("g", "w1", 1);
        registry.set_worker_ip("w1", ip(1));
        registry.set_worker_ip("w1", ip(2));

        let worker = registry.get_by_host("w1").unwrap();
        assert_eq!(worker.ip(), Some(ip(1)));
        assert!(registry.get_by_ip(&ip(1)).is_some());
    }

    #[test]
    fn test_ping_response_promotes_to_ready() {
        let registry = registry();
        registry.add_worker_host("g", "w1", 1);
        registry.set_worker_ip("w1", ip(1));

        let promoted = registry.on_ping_response(&ip(1));
        assert!(promoted.is_some());
        assert!(registry.get_by_host("w1").unwrap().is_ready());

        // Already ready: no transition reported
        assert!(registry.on_ping_response(&ip(1)).is_none());
    }

    #[test]
    fn test_dropped_ping_sweep_marks_not_avail() {
        let registry = registry();
        registry.add_worker_host("g", "w1", 1);
        registry.set_worker_ip("w1", ip(1));
        registry.on_ping_response(&ip(1));

        // The first sweep consumes the reply; two silent sweeps stay
        // under the threshold of three
        assert!(registry.check_dropped_ping_responses().is_empty());
        assert!(registry.check_dropped_ping_responses().is_empty());
        assert!(registry.check_dropped_ping_responses().is_empty());

        let lost = registry.check_dropped_ping_responses();
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].state(), WorkerState::NotAvail);

        // A reply brings the worker back
        let promoted = registry.on_ping_response(&ip(1));
        assert!(promoted.is_some());
        assert!(registry.get_by_host("w1").unwrap().is_ready());
    }

    #[test]
    fn test_capacity_counters_clamp_at_zero() {
        let worker = Worker::new("w1", "g", 2);
        worker.reserve();
        worker.reserve();
        assert_eq!(worker.num_exec(), 2);
        assert!(!worker.has_capacity());

        worker.release();
        worker.release();
        worker.release(); // logged and clamped
        assert_eq!(worker.num_exec(), 0);
    }

    #[tokio::test]
    async fn test_command_channel() {
        let (registry, mut rx) = WorkerRegistry::new(3);
        registry.add_command(
            WorkerCommand::StopTask {
                job_id: 1,
                task_id: 0,
            },
            ip(1),
        );
        let (command, host_ip) = rx.recv().await.unwrap();
        assert_eq!(host_ip, ip(1));
        assert_eq!(
            command,
            WorkerCommand::StopTask {
                job_id: 1,
                task_id: 0
            }
        );
    }
}
