//! Per-device polling client.
//!
//! Each device runs its own state machine: Disconnected -> Connecting
//! (bounded retries, 1 s backoff) -> Connected -> Polling (immediate
//! first cycle, then ticker). A transient read error degrades the poller:
//! one reconnect with a 200 ms backoff, one retry of the failing read,
//! then give up on the cycle until the next tick. Cancellation is checked
//! between every point read.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_modbus::client::Context as ModbusContext;
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use crate::collector::decode::{decode_bits, decode_words};
use crate::collector::sink::PointSink;
use crate::config::{DeviceConfig, PointConfig, ServerConfig};
use crate::error::SimError;
use crate::model::{PointValue, RegisterKind};
use crate::shutdown::{self, ShutdownRx};

/// Default per-request timeout when the server config does not set one.
const READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Backoff between connect attempts.
const CONNECT_BACKOFF: Duration = Duration::from_secs(1);
/// Backoff before the single in-cycle reconnect.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollerState {
    Disconnected,
    Connecting,
    Connected,
    Polling,
    Degraded,
}

pub struct DeviceCollector {
    server: ServerConfig,
    device: DeviceConfig,
    sink: PointSink,
    state: PollerState,
    connection: String,
}

impl DeviceCollector {
    pub fn new(server: ServerConfig, device: DeviceConfig, sink: PointSink) -> Self {
        let connection = server.address();
        Self {
            server,
            device,
            sink,
            state: PollerState::Disconnected,
            connection,
        }
    }

    fn set_state(&mut self, state: PollerState) {
        if self.state != state {
            debug!(
                server_id = %self.server.server_id,
                device_id = %self.device.device_id,
                "poller {:?} -> {:?}",
                self.state,
                state
            );
            self.state = state;
        }
    }

    fn read_timeout(&self) -> Duration {
        self.server.timeout.unwrap_or(READ_TIMEOUT)
    }

    /// Run until cancelled. Returns an error only when the device never
    /// becomes reachable within its configured connect attempts.
    pub async fn run(mut self, mut shutdown: ShutdownRx) -> Result<()> {
        self.set_state(PollerState::Connecting);
        let mut ctx = match self.connect_with_retry(&mut shutdown).await? {
            Some(ctx) => ctx,
            None => return Ok(()), // cancelled while connecting
        };
        self.set_state(PollerState::Connected);
        info!(
            server_id = %self.server.server_id,
            device_id = %self.device.device_id,
            connection = %self.connection,
            "device connected"
        );

        let interval = self.device.poll_interval_or_default();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if shutdown::is_shutdown(&shutdown) {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.set_state(PollerState::Polling);
                    if let Err(e) = self.poll_cycle(&mut ctx, &mut shutdown).await {
                        warn!(
                            server_id = %self.server.server_id,
                            device_id = %self.device.device_id,
                            "poll cycle: {:#}",
                            e
                        );
                    }
                    if shutdown::is_shutdown(&shutdown) {
                        break;
                    }
                }
            }
        }

        self.set_state(PollerState::Disconnected);
        let _ = ctx.disconnect().await;
        Ok(())
    }

    /// Attempt the initial connection up to `retry_count + 1` times.
    /// `Ok(None)` means cancellation interrupted the attempts.
    async fn connect_with_retry(
        &self,
        shutdown: &mut ShutdownRx,
    ) -> Result<Option<ModbusContext>> {
        let attempts = self.server.retry_count + 1;
        for attempt in 1..=attempts {
            if shutdown::is_shutdown(shutdown) {
                return Ok(None);
            }
            match self.connect().await {
                Ok(ctx) => return Ok(Some(ctx)),
                Err(e) => {
                    if attempt == attempts {
                        return Err(e.context(format!(
                            "connect {} for device {}",
                            self.connection, self.device.device_id
                        )));
                    }
                    warn!(
                        device_id = %self.device.device_id,
                        "connect attempt {}/{} failed: {:#}, retrying",
                        attempt,
                        attempts,
                        e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(CONNECT_BACKOFF) => {}
                        _ = shutdown::wait(shutdown) => return Ok(None),
                    }
                }
            }
        }
        Ok(None)
    }

    async fn connect(&self) -> Result<ModbusContext> {
        let slave = Slave(self.device.slave_id);
        if self.server.is_rtu() {
            let port = crate::transport::open_serial(&self.server.serial_settings())?;
            Ok(tokio_modbus::client::rtu::attach_slave(port, slave))
        } else {
            let addr: SocketAddr = self
                .connection
                .parse()
                .with_context(|| format!("invalid tcp address {:?}", self.connection))?;
            let ctx = tokio::time::timeout(
                self.read_timeout(),
                tokio_modbus::client::tcp::connect_slave(addr, slave),
            )
            .await
            .map_err(|_| anyhow::anyhow!("connect {} timed out", addr))??;
            Ok(ctx)
        }
    }

    /// One pass over the device's points, in declared order.
    async fn poll_cycle(
        &mut self,
        ctx: &mut ModbusContext,
        shutdown: &mut ShutdownRx,
    ) -> Result<()> {
        let points = self.device.points.clone();
        for point in &points {
            if shutdown::is_shutdown(shutdown) {
                return Ok(());
            }

            let value = match self.read_point(ctx, point).await {
                Ok(v) => v,
                Err(e) if is_decode_error(&e) => {
                    // Bad bytes, not a bad link: skip the point this cycle.
                    warn!(
                        server_id = %self.server.server_id,
                        device_id = %self.device.device_id,
                        point = %point.name,
                        "decode failed: {:#}",
                        e
                    );
                    continue;
                }
                Err(first) => {
                    // Transient fault: one reconnect, one retry.
                    self.set_state(PollerState::Degraded);
                    match self.reconnect(ctx).await {
                        Ok(()) => match self.read_point(ctx, point).await {
                            Ok(v) => {
                                self.set_state(PollerState::Polling);
                                v
                            }
                            Err(second) => {
                                return Err(second.context(format!(
                                    "read point {}@{} after reconnect",
                                    point.name, point.address
                                )));
                            }
                        },
                        Err(_) => {
                            return Err(first.context(format!(
                                "read point {}@{}",
                                point.name, point.address
                            )));
                        }
                    }
                }
            };

            if let Err(e) = self.sink.handle(value).await {
                warn!(
                    server_id = %self.server.server_id,
                    device_id = %self.device.device_id,
                    point = %point.name,
                    "handler error: {}",
                    e
                );
            }
        }
        Ok(())
    }

    async fn read_point(&self, ctx: &mut ModbusContext, point: &PointConfig) -> Result<PointValue> {
        let data_type = point.effective_data_type();
        let byte_order = point.effective_byte_order();
        let timeout = self.read_timeout();

        let (raw, raw_f64) = match point.register_type {
            RegisterKind::Holding => {
                let words = tokio::time::timeout(
                    timeout,
                    ctx.read_holding_registers(point.address, data_type.register_count()),
                )
                .await
                .map_err(|_| anyhow::anyhow!("read timed out"))?
                .context("read holding registers")?
                .map_err(|e| SimError::Protocol(format!("modbus exception: {:?}", e)))?;
                decode_words(&words, data_type, byte_order)?
            }
            RegisterKind::Input => {
                let words = tokio::time::timeout(
                    timeout,
                    ctx.read_input_registers(point.address, data_type.register_count()),
                )
                .await
                .map_err(|_| anyhow::anyhow!("read timed out"))?
                .context("read input registers")?
                .map_err(|e| SimError::Protocol(format!("modbus exception: {:?}", e)))?;
                decode_words(&words, data_type, byte_order)?
            }
            RegisterKind::Coil => {
                let bits = tokio::time::timeout(timeout, ctx.read_coils(point.address, 1))
                    .await
                    .map_err(|_| anyhow::anyhow!("read timed out"))?
                    .context("read coils")?
                    .map_err(|e| SimError::Protocol(format!("modbus exception: {:?}", e)))?;
                decode_bits(&bits)
            }
            RegisterKind::Discrete => {
                let bits =
                    tokio::time::timeout(timeout, ctx.read_discrete_inputs(point.address, 1))
                        .await
                        .map_err(|_| anyhow::anyhow!("read timed out"))?
                        .context("read discrete inputs")?
                        .map_err(|e| SimError::Protocol(format!("modbus exception: {:?}", e)))?;
                decode_bits(&bits)
            }
        };

        let scale = point.effective_scale();
        Ok(PointValue {
            timestamp: Utc::now(),
            server_id: self.server.server_id.clone(),
            device_id: self.device.device_id.clone(),
            connection: self.connection.clone(),
            slave_id: self.device.slave_id,
            point_name: point.name.clone(),
            address: point.address,
            register: point.register_type,
            data_type,
            byte_order,
            unit: point.unit.clone(),
            raw,
            scale,
            offset: point.offset,
            value: raw_f64 * scale + point.offset,
        })
    }

    /// Tear the context down and dial again after a short backoff.
    async fn reconnect(&self, ctx: &mut ModbusContext) -> Result<()> {
        let _ = ctx.disconnect().await;
        tokio::time::sleep(RECONNECT_BACKOFF).await;
        *ctx = self.connect().await?;
        Ok(())
    }
}

fn is_decode_error(error: &anyhow::Error) -> bool {
    matches!(error.downcast_ref::<SimError>(), Some(SimError::Decode(_)))
}
