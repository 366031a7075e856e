//! Fleet manager: reconciles a declarative configuration into running
//! slave engines and CSV drivers.
//!
//! Each slave walks Idle -> Starting -> Running -> Stopping -> Stopped; a
//! bind that keeps failing after `retry_count` attempts parks the slave
//! in Failed without touching its siblings. Start-up concurrency is
//! bounded by a small semaphore.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::{FleetConfig, PointConfig, ServerConfig};
use crate::csvdrive::{CsvDriver, CsvTable, PointBinding};
use crate::error::SimError;
use crate::model::{DeviceSnapshot, PointSnapshot, RegisterKind, ServerSnapshot};
use crate::shutdown::{self, ShutdownRx, SHUTDOWN_GRACE};
use crate::slave::SlaveEngine;
use crate::transport::{open_serial, rtu, tcp::TcpSlaveServer};

/// Maximum number of slaves starting up at once.
const MAX_CONCURRENT_STARTS: usize = 16;
/// Backoff between bind attempts.
const BIND_RETRY_BACKOFF: Duration = Duration::from_secs(1);
/// Default CSV drive period when the frequency map has no entry.
const DEFAULT_DRIVE_PERIOD: Duration = Duration::from_secs(3);

/// Lifecycle state of one fleet member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

pub struct FleetManager {
    cfg: Arc<FleetConfig>,
    engines: Mutex<HashMap<String, Arc<SlaveEngine>>>,
    states: Mutex<HashMap<String, SlaveState>>,
}

impl FleetManager {
    pub fn new(cfg: FleetConfig) -> Arc<Self> {
        let states = cfg
            .servers
            .iter()
            .map(|s| (s.server_id.clone(), SlaveState::Idle))
            .collect();
        Arc::new(Self {
            cfg: Arc::new(cfg),
            engines: Mutex::new(HashMap::new()),
            states: Mutex::new(states),
        })
    }

    pub fn state(&self, server_id: &str) -> Option<SlaveState> {
        self.states.lock().unwrap_or_else(|e| e.into_inner()).get(server_id).copied()
    }

    fn set_state(&self, server_id: &str, state: SlaveState) {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(server_id.to_string(), state);
    }

    /// Start every enabled slave and block until shutdown, then drain all
    /// of them within the grace window.
    pub async fn run(self: &Arc<Self>, mut shutdown: ShutdownRx) {
        let starts = Arc::new(Semaphore::new(MAX_CONCURRENT_STARTS));
        let mut tasks = Vec::new();

        for server in self.cfg.servers.iter().filter(|s| s.enabled).cloned() {
            let manager = Arc::clone(self);
            let starts = Arc::clone(&starts);
            let slave_shutdown = shutdown.clone();
            let name = server.server_id.clone();
            tasks.push((
                name,
                tokio::spawn(async move {
                    manager.run_slave(server, starts, slave_shutdown).await;
                }),
            ));
        }

        shutdown::wait(&mut shutdown).await;
        shutdown::join_with_grace(tasks, SHUTDOWN_GRACE).await;
    }

    async fn run_slave(
        self: Arc<Self>,
        server: ServerConfig,
        starts: Arc<Semaphore>,
        mut shutdown: ShutdownRx,
    ) {
        let permit = tokio::select! {
            permit = starts.acquire() => permit,
            _ = shutdown::wait(&mut shutdown) => return,
        };
        let _permit = match permit {
            Ok(p) => p,
            Err(_) => return,
        };

        self.set_state(&server.server_id, SlaveState::Starting);
        let engine = Arc::new(SlaveEngine::new());
        init_registers(&engine, &server);

        let endpoint = match self.bind_with_retry(&server, &engine, &shutdown).await {
            Some(endpoint) => {
                match &endpoint {
                    BoundEndpoint::Tcp(listener) => info!(
                        server_id = %server.server_id,
                        address = %listener.local_addr(),
                        "slave listening (tcp)"
                    ),
                    BoundEndpoint::Rtu(_) => info!(
                        server_id = %server.server_id,
                        port = %server.address(),
                        "slave serving (rtu)"
                    ),
                }
                endpoint
            }
            None => {
                self.set_state(&server.server_id, SlaveState::Failed);
                return;
            }
        };

        self.engines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(server.server_id.clone(), Arc::clone(&engine));
        self.set_state(&server.server_id, SlaveState::Running);
        drop(_permit);

        // CSV drive, when a data file is configured.
        let driver_task = match self.build_driver(&server, &engine) {
            Some(driver) => Some(tokio::spawn(driver.run(shutdown.clone()))),
            None => None,
        };

        shutdown::wait(&mut shutdown).await;
        self.set_state(&server.server_id, SlaveState::Stopping);

        match endpoint {
            BoundEndpoint::Tcp(listener) => listener.stop().await,
            BoundEndpoint::Rtu(task) => {
                let _ = task.await;
            }
        }
        if let Some(task) = driver_task {
            let _ = task.await;
        }

        self.engines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&server.server_id);
        self.set_state(&server.server_id, SlaveState::Stopped);
        info!(server_id = %server.server_id, "slave stopped");
    }

    async fn bind_with_retry(
        &self,
        server: &ServerConfig,
        engine: &Arc<SlaveEngine>,
        shutdown: &ShutdownRx,
    ) -> Option<BoundEndpoint> {
        let attempts = server.retry_count + 1;
        for attempt in 1..=attempts {
            if shutdown::is_shutdown(shutdown) {
                return None;
            }
            match self.bind_once(server, engine, shutdown).await {
                Ok(endpoint) => return Some(endpoint),
                Err(e) => {
                    if attempt == attempts {
                        error!(
                            server_id = %server.server_id,
                            address = %server.address(),
                            "bind failed after {} attempts: {}",
                            attempts,
                            e
                        );
                        return None;
                    }
                    warn!(
                        server_id = %server.server_id,
                        "bind attempt {}/{} failed: {}, retrying",
                        attempt,
                        attempts,
                        e
                    );
                    tokio::time::sleep(BIND_RETRY_BACKOFF).await;
                }
            }
        }
        None
    }

    async fn bind_once(
        &self,
        server: &ServerConfig,
        engine: &Arc<SlaveEngine>,
        shutdown: &ShutdownRx,
    ) -> anyhow::Result<BoundEndpoint> {
        if server.is_rtu() {
            let stream = open_serial(&server.serial_settings())?;
            let slave_id = server.devices.first().map(|d| d.slave_id).unwrap_or(1);
            let engine = Arc::clone(engine);
            let rx = shutdown.clone();
            let server_id = server.server_id.clone();
            let task = tokio::spawn(async move {
                if let Err(e) = rtu::serve_stream(stream, slave_id, engine, rx).await {
                    warn!(server_id = %server_id, "rtu stream ended: {}", e);
                }
            });
            Ok(BoundEndpoint::Rtu(task))
        } else {
            let address = server.address();
            let listener =
                TcpSlaveServer::bind(&address, Arc::clone(engine), shutdown.clone())
                    .await
                    .map_err(|source| SimError::Bind { address, source })?;
            Ok(BoundEndpoint::Tcp(listener))
        }
    }

    fn build_driver(&self, server: &ServerConfig, engine: &Arc<SlaveEngine>) -> Option<CsvDriver> {
        let path = server.csv_file.as_ref()?;
        let table = match CsvTable::load(path) {
            Ok(t) => t,
            Err(e) => {
                warn!(
                    server_id = %server.server_id,
                    "csv load failed, registers stay static: {:#}",
                    e
                );
                return None;
            }
        };

        let bindings: Vec<PointBinding> = server
            .devices
            .iter()
            .flat_map(|d| d.points.iter())
            .map(point_binding)
            .collect();
        let period = self
            .cfg
            .frequency
            .get(&server.server_id)
            .copied()
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_DRIVE_PERIOD);

        Some(CsvDriver::new(table, bindings, Arc::clone(engine), period))
    }

    /// Project the current register values of every running slave into
    /// snapshots. All entries share one timestamp.
    pub fn snapshot(&self) -> Vec<ServerSnapshot> {
        let engines: HashMap<String, Arc<SlaveEngine>> = self
            .engines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let now = Utc::now();

        let mut out = Vec::new();
        for server in self.cfg.servers.iter().filter(|s| s.enabled) {
            let Some(engine) = engines.get(&server.server_id) else {
                continue;
            };
            let devices = server
                .devices
                .iter()
                .map(|device| DeviceSnapshot {
                    device_id: device.device_id.clone(),
                    vendor: device.vendor.clone(),
                    slave_id: device.slave_id,
                    points: device
                        .points
                        .iter()
                        .map(|p| point_snapshot(engine, p, now))
                        .collect(),
                })
                .collect();
            out.push(ServerSnapshot {
                server_id: server.server_id.clone(),
                server_name: server.server_name.clone(),
                address: server.address(),
                devices,
                timestamp: now,
            });
        }
        out
    }
}

enum BoundEndpoint {
    Tcp(TcpSlaveServer),
    Rtu(tokio::task::JoinHandle<()>),
}

/// Zero out every declared point so reads are well-defined before the
/// first CSV row lands.
fn init_registers(engine: &SlaveEngine, server: &ServerConfig) {
    for device in &server.devices {
        for point in &device.points {
            match point.register_type {
                RegisterKind::Holding => engine.set_holding(point.address, 0),
                RegisterKind::Input => engine.set_input(point.address, 0),
                RegisterKind::Coil => engine.set_coil(point.address, false),
                RegisterKind::Discrete => engine.set_discrete_input(point.address, false),
            }
        }
    }
}

fn point_binding(point: &PointConfig) -> PointBinding {
    PointBinding::new(
        point.name.clone(),
        point.register_type,
        point.address,
        point.data_type,
        point.effective_scale(),
        point.offset,
    )
}

fn point_snapshot(
    engine: &SlaveEngine,
    point: &PointConfig,
    now: chrono::DateTime<Utc>,
) -> PointSnapshot {
    let mut snap = PointSnapshot {
        name: point.name.clone(),
        register_type: point.register_type,
        address: point.address,
        unit: point.unit.clone(),
        value_uint16: None,
        value_bool: None,
        timestamp: now,
    };
    match point.register_type {
        RegisterKind::Holding => snap.value_uint16 = Some(engine.get_holding(point.address)),
        RegisterKind::Input => snap.value_uint16 = Some(engine.get_input(point.address)),
        RegisterKind::Coil => snap.value_bool = Some(engine.get_coil(point.address)),
        RegisterKind::Discrete => snap.value_bool = Some(engine.get_discrete_input(point.address)),
    }
    snap
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, DeviceConfig};
    use std::io::Write;

    fn fleet_with_server(server: ServerConfig) -> FleetConfig {
        FleetConfig {
            servers: vec![server],
            ..Default::default()
        }
    }

    fn tcp_server(id: &str, port: u16) -> ServerConfig {
        ServerConfig {
            server_id: id.to_string(),
            server_name: format!("{} name", id),
            protocol: "modbus-tcp".to_string(),
            connection: ConnectionConfig {
                host: "127.0.0.1".to_string(),
                port,
                ..Default::default()
            },
            timeout: None,
            retry_count: 0,
            enabled: true,
            devices_type: "device".to_string(),
            devices_file: None,
            csv_file: None,
            devices: vec![DeviceConfig {
                device_id: format!("{}-dev", id),
                vendor: "acme".to_string(),
                slave_id: 1,
                poll_interval: None,
                points: vec![PointConfig {
                    name: "x".to_string(),
                    address: 5,
                    data_type: None,
                    byte_order: None,
                    register_type: RegisterKind::Holding,
                    scale: 1.0,
                    offset: 0.0,
                    unit: String::new(),
                }],
            }],
        }
    }

    #[tokio::test]
    async fn failed_bind_marks_slave_failed_without_affecting_others() {
        // Occupy a port so the second slave cannot bind it.
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        let mut cfg = fleet_with_server(tcp_server("ok", 0));
        cfg.servers.push(tcp_server("clash", taken_port));
        let manager = FleetManager::new(cfg);

        let (tx, rx) = shutdown::channel();
        let run = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.run(rx).await })
        };

        // Wait until both slaves settle.
        for _ in 0..100 {
            let ok = manager.state("ok");
            let clash = manager.state("clash");
            if ok == Some(SlaveState::Running) && clash == Some(SlaveState::Failed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(manager.state("ok"), Some(SlaveState::Running));
        assert_eq!(manager.state("clash"), Some(SlaveState::Failed));
        assert_eq!(manager.snapshot().len(), 1);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(6), run)
            .await
            .expect("fleet drains within grace window")
            .unwrap();
        assert_eq!(manager.state("ok"), Some(SlaveState::Stopped));
    }

    #[tokio::test]
    async fn snapshot_projects_driven_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "x\n17").unwrap();
        file.flush().unwrap();

        let mut server = tcp_server("snap", 0);
        server.csv_file = Some(file.path().to_path_buf());
        let manager = FleetManager::new(fleet_with_server(server));

        let (tx, rx) = shutdown::channel();
        let run = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.run(rx).await })
        };

        for _ in 0..100 {
            if manager.state("snap") == Some(SlaveState::Running) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // Give the driver a beat to apply row zero.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snaps = manager.snapshot();
        assert_eq!(snaps.len(), 1);
        let point = &snaps[0].devices[0].points[0];
        assert_eq!(point.value_uint16, Some(17));
        assert_eq!(point.value_bool, None);
        assert_eq!(point.timestamp, snaps[0].timestamp);

        tx.send(true).unwrap();
        let _ = tokio::time::timeout(Duration::from_secs(6), run).await;
    }
}
