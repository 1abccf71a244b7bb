//! Worker liveness probing
//!
//! Every tick the pinger sends a UDP datagram to each registered worker.
//! Replies are processed by the worker IO layer, which credits the
//! registry; the pinger only issues outbound probes and periodically runs
//! the dropped-response sweep. Host addresses are resolved once and
//! cached; a host that never resolves never becomes ready.

use crate::config::PingConfig;
use crate::scheduler::core::Scheduler;
use crate::scheduler::registry::{Worker, WorkerRegistry};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, error, info};

/// Probe payload; the worker echoes it so the reply can be routed back
#[derive(Debug, Serialize, Deserialize)]
pub struct PingMessage {
    /// Resolved address of the probed worker
    pub host: String,
}

/// Periodic liveness prober for the worker fleet
pub struct Pinger {
    registry: Arc<WorkerRegistry>,
    scheduler: Arc<Scheduler>,
    socket: UdpSocket,
    endpoints: DashMap<String, SocketAddr>,
    config: PingConfig,
    stopped: AtomicBool,
    wakeup: Notify,
}

impl Pinger {
    pub async fn new(
        registry: Arc<WorkerRegistry>,
        scheduler: Arc<Scheduler>,
        config: PingConfig,
    ) -> crate::Result<Self> {
        let bind_addr = if config.ipv6_only { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        Ok(Self {
            registry,
            scheduler,
            socket,
            endpoints: DashMap::new(),
            config,
            stopped: AtomicBool::new(false),
            wakeup: Notify::new(),
        })
    }

    /// Stop the ping loop; it terminates within one tick
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wakeup.notify_waiters();
        self.wakeup.notify_one();
    }

    /// Ping loop. Run as a dedicated task.
    pub async fn run(self: Arc<Self>) {
        info!(delay_secs = self.config.delay_secs, "pinger started");
        let mut num_pings = 0u32;
        while !self.stopped.load(Ordering::SeqCst) {
            tokio::select! {
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(self.config.delay()) => {}
            }
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }

            self.ping_workers().await;
            num_pings += 1;

            if num_pings > self.config.max_dropped {
                for worker in self.registry.check_dropped_ping_responses() {
                    self.scheduler.on_worker_lost(&worker).await;
                }
                num_pings = 0;
            }
        }
        info!("pinger stopped");
    }

    /// One probe round over the whole fleet
    pub async fn ping_workers(&self) {
        for worker in self.registry.get_workers(None) {
            self.ping_worker(&worker).await;
        }
    }

    async fn ping_worker(&self, worker: &Worker) {
        let endpoint = match self.endpoints.get(worker.host()) {
            Some(entry) => *entry.value(),
            None => match self.resolve(worker.host()).await {
                Some(addr) => {
                    self.endpoints.insert(worker.host().to_string(), addr);
                    addr
                }
                None => {
                    debug!(host = %worker.host(), "worker address not resolved");
                    return;
                }
            },
        };

        if worker.ip().is_none() {
            self.registry.set_worker_ip(worker.host(), endpoint.ip());
        }

        let message = PingMessage {
            host: endpoint.ip().to_string(),
        };
        let payload = match serde_json::to_vec(&message) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to serialize ping");
                return;
            }
        };
        if let Err(e) = self.socket.send_to(&payload, endpoint).await {
            error!(host = %worker.host(), %endpoint, error = %e, "ping send failed");
        }
    }

    /// Resolve a host to the configured ping port, honoring the address
    /// family restriction. Failures are retried on the next tick.
    async fn resolve(&self, host: &str) -> Option<SocketAddr> {
        let mut candidates = tokio::net::lookup_host((host, self.config.port)).await.ok()?;
        candidates.find(|addr| {
            if self.config.ipv6_only {
                addr.is_ipv6()
            } else {
                addr.is_ipv4()
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::core::{ChannelDispatch, Scheduler};
    use crate::scheduler::meta::MetaGraph;
    use crate::scheduler::queue::JobQueue;
    use crate::scheduler::timeout::TimeoutQueue;

    fn ping_config(port: u16) -> PingConfig {
        PingConfig {
            enabled: true,
            delay_secs: 1,
            max_dropped: 3,
            port,
            ipv6_only: false,
        }
    }

    async fn pinger(registry: Arc<WorkerRegistry>, port: u16) -> Pinger {
        let timeouts = Arc::new(TimeoutQueue::new());
        let queue = Arc::new(JobQueue::new(timeouts.clone()));
        let (dispatch, _rx) = ChannelDispatch::new();
        let scheduler = Scheduler::new(
            registry.clone(),
            queue,
            timeouts,
            Arc::new(MetaGraph::new()),
            Arc::new(dispatch),
            10,
        );
        Pinger::new(registry, scheduler, ping_config(port))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_ping_resolves_and_delivers() {
        // A fake worker endpoint on loopback
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = receiver.local_addr().unwrap().port();

        let (registry, _commands) = WorkerRegistry::new(3);
        let registry = Arc::new(registry);
        registry.add_worker_host("g", "127.0.0.1", 1);

        let pinger = pinger(registry.clone(), port).await;
        pinger.ping_workers().await;

        // Resolution is cached and recorded on the worker
        let worker = registry.get_by_host("127.0.0.1").unwrap();
        assert_eq!(worker.ip().unwrap().to_string(), "127.0.0.1");

        let mut buf = [0u8; 256];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        let message: PingMessage = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(message.host, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_skipped() {
        let (registry, _commands) = WorkerRegistry::new(3);
        let registry = Arc::new(registry);
        registry.add_worker_host("g", "definitely-not-a-real-host.invalid", 1);

        let pinger = pinger(registry.clone(), 5554).await;
        pinger.ping_workers().await;

        let worker = registry
            .get_by_host("definitely-not-a-real-host.invalid")
            .unwrap();
        assert!(worker.ip().is_none());
    }
}
