//! The polling collector: one task per configured device, fanned out
//! under a bounded worker pool.

pub mod client;
pub mod decode;
pub mod sink;

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::config::FleetConfig;
use crate::shutdown::{self, ShutdownRx, SHUTDOWN_GRACE};

pub use client::DeviceCollector;
pub use sink::PointSink;

/// Coordinates the per-device pollers.
pub struct CollectorManager {
    cfg: Arc<FleetConfig>,
}

impl CollectorManager {
    pub fn new(cfg: FleetConfig) -> Self {
        Self { cfg: Arc::new(cfg) }
    }

    /// Spawn a poller per enabled device and block until shutdown, then
    /// drain the pool within the grace window.
    pub async fn run(&self, sink: PointSink, mut shutdown: ShutdownRx) {
        let max_workers = self.cfg.system.processing.max_workers.max(1);
        let pool = Arc::new(Semaphore::new(max_workers));
        let mut tasks = Vec::new();

        for server in self.cfg.servers.iter().filter(|s| s.enabled) {
            for device in &server.devices {
                let mut device = device.clone();
                // Frequency override trumps the per-device interval.
                if let Some(&interval) = self.cfg.frequency.get(&server.server_id) {
                    if !interval.is_zero() {
                        device.poll_interval = Some(interval);
                    }
                }

                let name = format!("{}/{}", server.server_id, device.device_id);
                let collector = DeviceCollector::new(server.clone(), device, sink.clone());
                let pool = Arc::clone(&pool);
                let mut worker_shutdown = shutdown.clone();
                tasks.push((
                    name.clone(),
                    tokio::spawn(async move {
                        let permit = tokio::select! {
                            permit = pool.acquire_owned() => permit,
                            _ = shutdown::wait(&mut worker_shutdown) => return,
                        };
                        let Ok(_permit) = permit else { return };
                        if let Err(e) = collector.run(worker_shutdown).await {
                            warn!("collector {} stopped: {:#}", name, e);
                        }
                    }),
                ));
            }
        }

        info!(
            pollers = tasks.len(),
            max_workers, "collector running"
        );
        shutdown::wait(&mut shutdown).await;
        shutdown::join_with_grace(tasks, SHUTDOWN_GRACE).await;
    }
}
