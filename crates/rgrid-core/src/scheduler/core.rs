//! Task-to-worker matching and job lifecycle handling
//!
//! The scheduler drains the admission queue, promotes jobs into the
//! scheduled set, binds task instances to eligible workers and reacts to
//! completions, timeouts, worker loss and administrative stops. The
//! scheduled set, the per-job attempt history and worker capacity
//! reservations share one coarse lock; their invariants (capacity equals
//! in-flight tasks, history is monotone) span all three.

use crate::error::{Error, Result};
use crate::scheduler::job::{
    CompletionStatus, ExecSpec, GroupId, Job, JobCompletion, JobId, TaskOutcome, WorkerTask,
};
use crate::scheduler::meta::MetaGraph;
use crate::scheduler::queue::JobQueue;
use crate::scheduler::registry::{Worker, WorkerCommand, WorkerRegistry};
use crate::scheduler::scheduled::{JobExecHistory, ScheduledJobs};
use crate::scheduler::timeout::{TimeoutEvent, TimeoutHandler, TimeoutQueue};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Task instance handed to the worker IO layer for transmission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task: WorkerTask,
    pub host: String,
    pub host_ip: IpAddr,
    pub exec: ExecSpec,
    pub task_timeout: i64,
}

/// Outbound seam to the worker IO layer
#[async_trait::async_trait]
pub trait TaskDispatch: Send + Sync {
    async fn dispatch(&self, assignment: TaskAssignment) -> Result<()>;
}

/// Default dispatcher: hands assignments to a channel consumed by the
/// worker IO layer.
pub struct ChannelDispatch {
    tx: mpsc::UnboundedSender<TaskAssignment>,
}

impl ChannelDispatch {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TaskAssignment>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl TaskDispatch for ChannelDispatch {
    async fn dispatch(&self, assignment: TaskAssignment) -> Result<()> {
        self.tx
            .send(assignment)
            .map_err(|_| Error::network("task dispatch channel closed"))
    }
}

/// Current binding of one task instance
#[derive(Debug, Clone)]
struct Assignment {
    instance_id: u64,
    host: String,
    host_ip: IpAddr,
}

/// Mutable per-job scheduling state
struct JobRuntime {
    job: Arc<Job>,
    /// Task slots awaiting (re)dispatch
    pending: BTreeSet<u32>,
    /// Task slot -> current worker binding
    in_flight: HashMap<u32, Assignment>,
    next_instance: u64,
    failed_ips: HashSet<IpAddr>,
}

impl JobRuntime {
    fn new(job: Arc<Job>) -> Self {
        let pending = (0..job.num_tasks).collect();
        Self {
            job,
            pending,
            in_flight: HashMap::new(),
            next_instance: 0,
            failed_ips: HashSet::new(),
        }
    }
}

/// Everything guarded by the scheduler's coarse lock
struct SchedulerState {
    scheduled: ScheduledJobs,
    history: JobExecHistory,
    runtimes: HashMap<JobId, JobRuntime>,
}

/// Read-only report for one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: JobId,
    pub group_id: GroupId,
    pub name: Option<String>,
    pub state: String,
    pub priority: i32,
    pub num_tasks: u32,
    pub remaining_executions: i64,
    pub in_flight: usize,
    pub assigned_hosts: Vec<String>,
}

/// Global counters for the stat report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub workers: crate::scheduler::registry::RegistryStats,
    pub queued_jobs: usize,
    pub executing_jobs: usize,
    pub meta_groups: usize,
}

/// The scheduling core. All collaborators are passed at construction;
/// there are no process-wide instances.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    registry: Arc<WorkerRegistry>,
    queue: Arc<JobQueue>,
    timeouts: Arc<TimeoutQueue>,
    meta: Arc<MetaGraph>,
    dispatch: Arc<dyn TaskDispatch>,
    completions: broadcast::Sender<JobCompletion>,
    stop_task_grace: i64,
}

impl Scheduler {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        queue: Arc<JobQueue>,
        timeouts: Arc<TimeoutQueue>,
        meta: Arc<MetaGraph>,
        dispatch: Arc<dyn TaskDispatch>,
        stop_task_grace: i64,
    ) -> Arc<Self> {
        let (completions, _) = broadcast::channel(256);

        let mut scheduled = ScheduledJobs::new();
        let hook_tx = completions.clone();
        scheduled.set_completion_hook(Box::new(move |completion| {
            let _ = hook_tx.send(completion);
        }));

        Arc::new(Self {
            state: Mutex::new(SchedulerState {
                scheduled,
                history: JobExecHistory::new(),
                runtimes: HashMap::new(),
            }),
            registry,
            queue,
            timeouts,
            meta,
            dispatch,
            completions,
            stop_task_grace,
        })
    }

    /// Subscribe to terminal job events
    pub fn subscribe_completions(&self) -> broadcast::Receiver<JobCompletion> {
        self.completions.subscribe()
    }

    /// Completion event for a job that never reached the scheduled set
    fn emit_completion(&self, job: &Job, status: CompletionStatus) {
        info!(job_id = job.job_id, group_id = job.group_id, %status, "job completed");
        let _ = self.completions.send(JobCompletion {
            job_id: job.job_id,
            group_id: job.group_id,
            status,
        });
    }

    /// Feed a terminal job into the dependency graph: push released
    /// children into the queue and report cancelled descendants.
    fn propagate_meta(&self, job: &Job, success: bool) {
        let outcome = self.meta.on_job_done(job.group_id, job.job_id, success);
        for cancelled in &outcome.parent_failed {
            self.emit_completion(cancelled, CompletionStatus::ParentFailed);
        }
        for released in outcome.released {
            self.queue.push(released);
        }
    }

    /// Whether any ready worker has a free task slot
    fn has_free_worker(&self) -> bool {
        self.registry
            .get_workers(None)
            .iter()
            .any(|w| w.is_ready() && w.has_capacity() && w.ip().is_some())
    }

    /// Promote queued jobs into the scheduled set and run a selection
    /// pass. Invoked when the queue becomes non-empty and after any event
    /// that may free capacity. With no free worker slot, jobs stay queued
    /// (where their queue deadline can still expire them).
    pub async fn on_new_job(&self) {
        if !self.queue.is_empty() && !self.has_free_worker() {
            return;
        }

        let mut admitted = Vec::new();
        while let Some(job) = self.queue.pop() {
            admitted.push(job);
        }

        if !admitted.is_empty() {
            let mut state = self.state.lock().await;
            for job in &admitted {
                state.scheduled.add(job.clone(), i64::from(job.num_tasks));
                state
                    .runtimes
                    .insert(job.job_id, JobRuntime::new(job.clone()));
                info!(job_id = job.job_id, priority = job.priority, "job admitted for execution");
            }
        }
        for job in &admitted {
            self.timeouts.push_job_timeout(job.job_id, job.job_timeout);
        }

        self.schedule_tasks().await;
    }

    /// One selection pass: bind pending tasks of scheduled jobs to
    /// eligible workers, in priority order.
    pub async fn schedule_tasks(&self) {
        let assignments = {
            let mut state = self.state.lock().await;
            self.select_assignments(&mut state)
        };
        for assignment in assignments {
            debug!(task = %assignment.task, host = %assignment.host, "task dispatched");
            if let Err(e) = self.dispatch.dispatch(assignment.clone()).await {
                // The armed task timeout rescues the instance later
                error!(task = %assignment.task, error = %e, "task dispatch failed");
            }
        }
    }

    fn select_assignments(&self, state: &mut SchedulerState) -> Vec<TaskAssignment> {
        let mut out = Vec::new();
        let workers = self.registry.get_workers(None);
        let jobs = state.scheduled.jobs_needing_dispatch();

        for job in jobs {
            let SchedulerState {
                scheduled,
                history,
                runtimes,
            } = &mut *state;
            let Some(runtime) = runtimes.get_mut(&job.job_id) else {
                continue;
            };

            loop {
                if runtime.pending.is_empty() {
                    scheduled.set_sent_completely(job.job_id, true);
                    break;
                }
                if job.max_cpu >= 0 && runtime.in_flight.len() >= job.max_cpu as usize {
                    break;
                }

                let assigned_hosts: HashSet<&str> = runtime
                    .in_flight
                    .values()
                    .map(|a| a.host.as_str())
                    .collect();

                // Candidate set: ready workers with free slots, matching
                // the affinity filter, with per-host attempts left, within
                // the distinct-host spread cap.
                let mut best: Option<(&Arc<Worker>, IpAddr, (u32, u32, String))> = None;
                for worker in &workers {
                    if !worker.is_ready() || !worker.has_capacity() {
                        continue;
                    }
                    let Some(ip) = worker.ip() else {
                        continue;
                    };
                    if let Some(host_group) = &job.host_group {
                        if worker.group() != host_group {
                            continue;
                        }
                    }
                    let attempts = history.get_num_exec(job.job_id, &ip);
                    if let Some(bound) = job.attempts_per_host() {
                        if attempts >= bound {
                            continue;
                        }
                    }
                    if job.max_cluster_cpu >= 0
                        && !assigned_hosts.contains(worker.host())
                        && assigned_hosts.len() >= job.max_cluster_cpu as usize
                    {
                        continue;
                    }

                    let key = (worker.num_exec(), attempts, ip.to_string());
                    let better = match &best {
                        None => true,
                        Some((_, _, best_key)) => key < *best_key,
                    };
                    if better {
                        best = Some((worker, ip, key));
                    }
                }

                let Some((worker, host_ip, _)) = best else {
                    break;
                };

                // Reserve the slot and record the attempt
                worker.reserve();
                history.increment(job.job_id, host_ip);
                let task_id = runtime
                    .pending
                    .pop_first()
                    .expect("pending set checked non-empty");
                runtime.next_instance += 1;
                let task = WorkerTask::new(job.job_id, task_id, runtime.next_instance);
                runtime.in_flight.insert(
                    task_id,
                    Assignment {
                        instance_id: task.instance_id,
                        host: worker.host().to_string(),
                        host_ip,
                    },
                );
                self.timeouts
                    .push_task_timeout(task, host_ip, job.task_timeout);
                out.push(TaskAssignment {
                    task,
                    host: worker.host().to_string(),
                    host_ip,
                    exec: job.exec.clone(),
                    task_timeout: job.task_timeout,
                });
            }
        }
        out
    }

    /// Check that a reply or timeout refers to the live binding of a task
    fn is_current_binding(
        state: &SchedulerState,
        task: &WorkerTask,
        host_ip: &IpAddr,
    ) -> Option<bool> {
        let runtime = state.runtimes.get(&task.job_id)?;
        Some(
            runtime
                .in_flight
                .get(&task.task_id)
                .map(|a| a.instance_id == task.instance_id && a.host_ip == *host_ip)
                .unwrap_or(false),
        )
    }

    /// Handle one task reply from the worker IO layer
    pub async fn on_task_completion(&self, outcome: TaskOutcome, task: WorkerTask, host_ip: IpAddr) {
        let mut finished: Option<(Arc<Job>, bool)> = None;
        {
            let mut state = self.state.lock().await;
            match Self::is_current_binding(&state, &task, &host_ip) {
                None => {
                    error!(%task, "task completion for unknown job, dropped");
                    return;
                }
                Some(false) => {
                    debug!(%task, "stale task reply discarded");
                    return;
                }
                Some(true) => {}
            }

            if let Some(runtime) = state.runtimes.get_mut(&task.job_id) {
                runtime.in_flight.remove(&task.task_id);
            }
            if let Some(worker) = self.registry.get_by_ip(&host_ip) {
                worker.release();
            }

            match outcome {
                TaskOutcome::Success => {
                    debug!(%task, %host_ip, "task succeeded");
                    if let Some(job) = state.scheduled.decrement_job_execution(task.job_id, 1) {
                        state.runtimes.remove(&task.job_id);
                        state.history.remove_job(task.job_id);
                        finished = Some((job, true));
                    }
                }
                TaskOutcome::Failed => {
                    if let Some(job) =
                        self.fail_task_locked(&mut state, task.job_id, task.task_id, host_ip)
                    {
                        finished = Some((job, false));
                    }
                }
            }
        }

        if let Some((job, success)) = finished {
            self.propagate_meta(&job, success);
        }
        self.on_new_job().await;
    }

    /// A timed-out task counts as a failed attempt; the runaway instance
    /// is told to stop after a grace period.
    pub async fn on_task_timeout(&self, task: WorkerTask, host_ip: IpAddr) {
        let finished = {
            let mut state = self.state.lock().await;
            if Self::is_current_binding(&state, &task, &host_ip) != Some(true) {
                debug!(%task, "task timeout for finished instance, ignored");
                return;
            }
            warn!(%task, %host_ip, "task timed out");

            if let Some(runtime) = state.runtimes.get_mut(&task.job_id) {
                runtime.in_flight.remove(&task.task_id);
            }
            if let Some(worker) = self.registry.get_by_ip(&host_ip) {
                worker.release();
            }
            self.timeouts.push_stop_command(
                WorkerCommand::StopTask {
                    job_id: task.job_id,
                    task_id: task.task_id,
                },
                host_ip,
                self.stop_task_grace,
            );

            self.fail_task_locked(&mut state, task.job_id, task.task_id, host_ip)
        };

        if let Some(job) = finished {
            self.propagate_meta(&job, false);
        }
        self.on_new_job().await;
    }

    /// Failed attempt bookkeeping. Returns the job if it was terminated.
    fn fail_task_locked(
        &self,
        state: &mut SchedulerState,
        job_id: JobId,
        task_id: u32,
        host_ip: IpAddr,
    ) -> Option<Arc<Job>> {
        let retry = {
            let SchedulerState {
                scheduled,
                history,
                runtimes,
            } = &mut *state;
            let runtime = runtimes.get_mut(&job_id)?;
            runtime.failed_ips.insert(host_ip);
            let job = &runtime.job;

            let attempts = history.total_attempts(job_id);
            let within_budget = job.attempt_budget().map_or(true, |budget| attempts < budget);
            let retry = within_budget
                && runtime.failed_ips.len() as u32 <= job.max_failed_nodes
                && !job.no_reschedule;

            if retry {
                runtime.pending.insert(task_id);
                scheduled.set_sent_completely(job_id, false);
                info!(job_id, task_id, %host_ip, attempts, "task failed, eligible for retry");
            }
            retry
        };

        if retry {
            None
        } else {
            warn!(job_id, task_id, %host_ip, "retry budget exhausted, job failed");
            self.force_remove_locked(state, job_id, false, CompletionStatus::Failed)
        }
    }

    /// Evict a job from the scheduled set: release capacity held by its
    /// in-flight tasks, tell their workers to stop, drop history.
    fn force_remove_locked(
        &self,
        state: &mut SchedulerState,
        job_id: JobId,
        success: bool,
        status: CompletionStatus,
    ) -> Option<Arc<Job>> {
        if let Some(runtime) = state.runtimes.remove(&job_id) {
            for (task_id, assignment) in runtime.in_flight {
                if let Some(worker) = self.registry.get_by_ip(&assignment.host_ip) {
                    worker.release();
                }
                self.registry.add_command(
                    WorkerCommand::StopTask { job_id, task_id },
                    assignment.host_ip,
                );
            }
        }
        state.history.remove_job(job_id);
        state.scheduled.remove_job(job_id, success, status)
    }

    /// Forcible termination on job deadline; late task replies are discarded
    pub async fn on_job_timeout(&self, job_id: JobId) {
        let removed = {
            let mut state = self.state.lock().await;
            self.force_remove_locked(&mut state, job_id, false, CompletionStatus::Timeout)
        };
        let Some(job) = removed else {
            return;
        };
        warn!(job_id, "job timed out");
        self.propagate_meta(&job, false);
        self.on_new_job().await;
    }

    /// Queue-admission deadline: drop the job if it is still queued; once
    /// scheduled this is a no-op.
    pub async fn on_queue_timeout(&self, job_id: JobId) {
        let Some(job) = self.queue.delete(job_id) else {
            return;
        };
        warn!(job_id, "job expired in queue");
        self.emit_completion(&job, CompletionStatus::Timeout);
        self.propagate_meta(&job, false);
    }

    /// Administrative stop of a single job, queued or executing
    pub async fn stop_job(&self, job_id: JobId) -> Result<()> {
        if let Some(job) = self.queue.delete(job_id) {
            self.emit_completion(&job, CompletionStatus::Stopped);
            self.propagate_meta(&job, false);
            return Ok(());
        }

        let removed = {
            let mut state = self.state.lock().await;
            self.force_remove_locked(&mut state, job_id, false, CompletionStatus::Stopped)
        };
        let job = removed.ok_or(Error::UnknownJob(job_id))?;
        self.propagate_meta(&job, false);
        self.on_new_job().await;
        Ok(())
    }

    /// Cancel queued and in-flight jobs sharing a group; unreleased meta
    /// children are dropped without execution.
    pub async fn stop_job_group(&self, group_id: GroupId) -> usize {
        let mut stopped = 0;

        for job in self.meta.cancel_group(group_id) {
            self.emit_completion(&job, CompletionStatus::Cancelled);
            stopped += 1;
        }

        for job in self.queue.delete_group(group_id) {
            self.emit_completion(&job, CompletionStatus::Stopped);
            stopped += 1;
        }

        let removed = {
            let mut state = self.state.lock().await;
            let ids: Vec<JobId> = state
                .scheduled
                .get_job_group(group_id)
                .iter()
                .map(|j| j.job_id)
                .collect();
            let mut removed = Vec::new();
            for job_id in ids {
                if let Some(job) =
                    self.force_remove_locked(&mut state, job_id, false, CompletionStatus::Stopped)
                {
                    removed.push(job);
                }
            }
            removed
        };
        stopped += removed.len();

        self.on_new_job().await;
        stopped
    }

    /// Drain the queue, then the scheduled set, with status `stopped`
    pub async fn stop_all_jobs(&self) -> usize {
        let mut stopped = 0;

        for job in self.meta.cancel_all() {
            self.emit_completion(&job, CompletionStatus::Cancelled);
            stopped += 1;
        }

        for job in self.queue.drain() {
            self.emit_completion(&job, CompletionStatus::Stopped);
            stopped += 1;
        }

        let mut state = self.state.lock().await;
        for job_id in state.scheduled.job_ids() {
            if self
                .force_remove_locked(&mut state, job_id, false, CompletionStatus::Stopped)
                .is_some()
            {
                stopped += 1;
            }
        }
        stopped
    }

    /// Stop every executing job older than the newest still-queued job
    pub async fn stop_previous_jobs(&self) -> usize {
        let Some(newest_queued) = self.queue.max_job_id() else {
            return 0;
        };

        let removed = {
            let mut state = self.state.lock().await;
            let ids: Vec<JobId> = state
                .scheduled
                .job_ids()
                .into_iter()
                .filter(|&id| id < newest_queued)
                .collect();
            let mut removed = Vec::new();
            for job_id in ids {
                if let Some(job) =
                    self.force_remove_locked(&mut state, job_id, false, CompletionStatus::Stopped)
                {
                    removed.push(job);
                }
            }
            removed
        };

        let count = removed.len();
        for job in &removed {
            self.propagate_meta(job, false);
        }
        self.on_new_job().await;
        count
    }

    /// Rescue every task assigned to a lost or deleted worker. Jobs with
    /// rescheduling disabled terminate with status `worker_lost`.
    pub async fn on_worker_lost(&self, worker: &Worker) {
        let host = worker.host().to_string();
        let terminated = {
            let mut state = self.state.lock().await;

            let mut affected: Vec<(JobId, Vec<u32>)> = Vec::new();
            for (job_id, runtime) in state.runtimes.iter_mut() {
                let tasks: Vec<u32> = runtime
                    .in_flight
                    .iter()
                    .filter(|(_, a)| a.host == host)
                    .map(|(task_id, _)| *task_id)
                    .collect();
                if tasks.is_empty() {
                    continue;
                }
                for task_id in &tasks {
                    runtime.in_flight.remove(task_id);
                }
                affected.push((*job_id, tasks));
            }

            let mut terminated = Vec::new();
            for (job_id, tasks) in affected {
                let Some(job) = state.runtimes.get(&job_id).map(|r| r.job.clone()) else {
                    continue;
                };
                if job.no_reschedule {
                    warn!(job_id, %host, "worker lost, job not reschedulable");
                    if let Some(job) = self.force_remove_locked(
                        &mut state,
                        job_id,
                        false,
                        CompletionStatus::WorkerLost,
                    ) {
                        terminated.push(job);
                    }
                } else {
                    warn!(job_id, %host, tasks = tasks.len(), "tasks rescued from lost worker");
                    if let Some(runtime) = state.runtimes.get_mut(&job_id) {
                        for task_id in tasks {
                            runtime.pending.insert(task_id);
                        }
                    }
                    state.scheduled.set_sent_completely(job_id, false);
                }
            }

            worker.zero_exec();
            terminated
        };

        for job in &terminated {
            self.propagate_meta(job, false);
        }
        self.on_new_job().await;
    }

    /// Read-only report for one job
    pub async fn get_job_info(&self, job_id: JobId) -> Result<JobInfo> {
        if let Some(job) = self.queue.get(job_id) {
            return Ok(JobInfo {
                job_id,
                group_id: job.group_id,
                name: job.name.clone(),
                state: "queued".to_string(),
                priority: job.priority,
                num_tasks: job.num_tasks,
                remaining_executions: i64::from(job.num_tasks),
                in_flight: 0,
                assigned_hosts: Vec::new(),
            });
        }

        let state = self.state.lock().await;
        let job = state
            .scheduled
            .find_job_by_job_id(job_id)
            .ok_or(Error::UnknownJob(job_id))?;
        let remaining = state.scheduled.get_num_exec(job_id).unwrap_or(0);
        let (in_flight, assigned_hosts) = state
            .runtimes
            .get(&job_id)
            .map(|r| {
                let hosts: BTreeSet<String> =
                    r.in_flight.values().map(|a| a.host.clone()).collect();
                (r.in_flight.len(), hosts.into_iter().collect())
            })
            .unwrap_or((0, Vec::new()));
        let phase = if state.scheduled.is_sent_completely(job_id) {
            "executing"
        } else {
            "scheduling"
        };

        Ok(JobInfo {
            job_id,
            group_id: job.group_id,
            name: job.name.clone(),
            state: phase.to_string(),
            priority: job.priority,
            num_tasks: job.num_tasks,
            remaining_executions: remaining,
            in_flight,
            assigned_hosts,
        })
    }

    /// Global counters
    pub async fn get_statistics(&self) -> SchedulerStats {
        let state = self.state.lock().await;
        SchedulerStats {
            workers: self.registry.stats(),
            queued_jobs: self.queue.len(),
            executing_jobs: state.scheduled.get_num_jobs(),
            meta_groups: self.meta.num_groups(),
        }
    }
}

#[async_trait::async_trait]
impl TimeoutHandler for Scheduler {
    async fn handle_timeout(&self, event: TimeoutEvent) {
        match event {
            TimeoutEvent::TaskTimeout { task, host_ip } => {
                self.on_task_timeout(task, host_ip).await;
            }
            TimeoutEvent::JobTimeout { job_id } => {
                self.on_job_timeout(job_id).await;
            }
            TimeoutEvent::QueueTimeout { job_id } => {
                self.on_queue_timeout(job_id).await;
            }
            TimeoutEvent::StopTask { command, host_ip } => {
                self.registry.add_command(command, host_ip);
            }
        }
    }
}
