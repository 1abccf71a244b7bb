//! Master assembly
//!
//! Builds every component of the master, hands each one explicit handles
//! to its collaborators and spawns the background loops. There are no
//! process-wide instances; tests construct masters in isolation.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::scheduler::core::{ChannelDispatch, Scheduler, TaskAssignment, TaskDispatch};
use crate::scheduler::descriptor::Submission;
use crate::scheduler::job::{JobCompletion, JobId};
use crate::scheduler::meta::MetaGraph;
use crate::scheduler::pinger::Pinger;
use crate::scheduler::queue::JobQueue;
use crate::scheduler::registry::{WorkerCommand, WorkerRegistry};
use crate::scheduler::timeout::{TimeoutHandler, TimeoutQueue};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::info;

/// Channel ends consumed by the worker IO layer
pub struct MasterChannels {
    /// Task assignments to transmit to workers
    pub assignments: mpsc::UnboundedReceiver<TaskAssignment>,

    /// Control commands to transmit to workers
    pub worker_commands: mpsc::UnboundedReceiver<(WorkerCommand, IpAddr)>,
}

/// The running master: registry, queue, deadlines, graph and scheduler
pub struct Master {
    pub config: Config,
    pub registry: Arc<WorkerRegistry>,
    pub queue: Arc<JobQueue>,
    pub timeouts: Arc<TimeoutQueue>,
    pub meta: Arc<MetaGraph>,
    pub scheduler: Arc<Scheduler>,
    pinger: Option<Arc<Pinger>>,
    job_ids: AtomicI64,
    group_ids: AtomicI64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Master {
    /// Build and start a master with the default channel-backed dispatcher
    pub async fn start(config: Config) -> Result<(Arc<Self>, MasterChannels)> {
        let (dispatch, assignments) = ChannelDispatch::new();
        let (master, worker_commands) = Self::start_with_dispatch(config, Arc::new(dispatch)).await?;
        Ok((
            master,
            MasterChannels {
                assignments,
                worker_commands,
            },
        ))
    }

    /// Build and start a master with a custom outbound dispatcher
    pub async fn start_with_dispatch(
        config: Config,
        dispatch: Arc<dyn TaskDispatch>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<(WorkerCommand, IpAddr)>)> {
        config.validate()?;

        let (registry, worker_commands) = WorkerRegistry::new(config.ping.max_dropped);
        let registry = Arc::new(registry);
        let timeouts = Arc::new(TimeoutQueue::new());
        let queue = Arc::new(JobQueue::new(timeouts.clone()));
        let meta = Arc::new(MetaGraph::new());
        let scheduler = Scheduler::new(
            registry.clone(),
            queue.clone(),
            timeouts.clone(),
            meta.clone(),
            dispatch,
            config.scheduler.stop_task_grace_secs,
        );

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(
            timeouts
                .clone()
                .run(scheduler.clone() as Arc<dyn TimeoutHandler>),
        ));

        let pinger = if config.ping.enabled {
            let pinger = Arc::new(
                Pinger::new(registry.clone(), scheduler.clone(), config.ping.clone()).await?,
            );
            tasks.push(tokio::spawn(pinger.clone().run()));
            Some(pinger)
        } else {
            None
        };

        info!("master started");
        let master = Arc::new(Self {
            config,
            registry,
            queue,
            timeouts,
            meta,
            scheduler,
            pinger,
            job_ids: AtomicI64::new(1),
            group_ids: AtomicI64::new(1),
            tasks: Mutex::new(tasks),
        });
        Ok((master, worker_commands))
    }

    fn next_job_id(&self) -> JobId {
        self.job_ids.fetch_add(1, Ordering::SeqCst)
    }

    fn next_group_id(&self) -> JobId {
        self.group_ids.fetch_add(1, Ordering::SeqCst)
    }

    /// Admit a parsed submission; returns the allocated job ids
    pub async fn submit(&self, submission: Submission) -> Result<Vec<JobId>> {
        match submission {
            Submission::Job(descriptor) => {
                let job_id = self.next_job_id();
                let group_id = self.next_group_id();
                let job = Arc::new(descriptor.into_job(job_id, group_id));
                info!(job_id, group_id, "job submitted");
                self.queue.push(job);
                self.scheduler.on_new_job().await;
                Ok(vec![job_id])
            }
            Submission::Meta(descriptor) => {
                let group_id = self.next_group_id();

                let mut jobs = Vec::with_capacity(descriptor.jobs.len());
                let mut ids = Vec::with_capacity(descriptor.jobs.len());
                let mut by_name: HashMap<String, JobId> = HashMap::new();
                for member in descriptor.jobs {
                    let job_id = self.next_job_id();
                    if let Some(name) = member.name.clone() {
                        by_name.insert(name, job_id);
                    }
                    ids.push(job_id);
                    jobs.push(Arc::new(member.into_job(job_id, group_id)));
                }

                let edges: Vec<(JobId, JobId)> = descriptor
                    .depends
                    .iter()
                    .filter_map(|(parent, child)| {
                        Some((*by_name.get(parent)?, *by_name.get(child)?))
                    })
                    .collect();

                info!(group_id, jobs = ids.len(), "meta-job submitted");
                let roots = self.meta.register(group_id, jobs, &edges);
                for root in roots {
                    self.queue.push(root);
                }
                self.scheduler.on_new_job().await;
                Ok(ids)
            }
        }
    }

    /// Credit a ping reply from the worker IO layer; a worker turning
    /// ready may admit queued jobs and triggers a selection pass.
    pub async fn on_ping_response(&self, ip: IpAddr) {
        if self.registry.on_ping_response(&ip).is_some() {
            self.scheduler.on_new_job().await;
        }
    }

    /// Register a single host under a group
    pub fn add_host(&self, group: &str, host: &str) -> bool {
        self.registry
            .add_worker_host(group, host, self.config.scheduler.worker_num_cpu)
    }

    /// Register every host of a group
    pub fn add_host_group<I, S>(&self, group: &str, hosts: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.registry
            .add_worker_group(group, hosts, self.config.scheduler.worker_num_cpu)
    }

    /// Remove a host and rescue its tasks
    pub async fn delete_host(&self, host: &str) -> Result<()> {
        let worker = self
            .registry
            .delete_worker_host(host)
            .ok_or_else(|| Error::UnknownWorker(host.to_string()))?;
        self.scheduler.on_worker_lost(&worker).await;
        Ok(())
    }

    /// Remove every host of a group and rescue their tasks
    pub async fn delete_host_group(&self, group: &str) -> usize {
        let removed = self.registry.delete_worker_group(group);
        let count = removed.len();
        for worker in removed {
            self.scheduler.on_worker_lost(&worker).await;
        }
        count
    }

    /// Subscribe to terminal job events
    pub fn subscribe_completions(&self) -> broadcast::Receiver<JobCompletion> {
        self.scheduler.subscribe_completions()
    }

    /// Stop the background loops; bounded by one timer tick plus one
    /// ping tick.
    pub async fn shutdown(&self) {
        info!("master shutting down");
        self.timeouts.stop();
        if let Some(pinger) = &self.pinger {
            pinger.stop();
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().expect("task list lock poisoned");
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("master stopped");
    }
}
