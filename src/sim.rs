//! Single-server mode: one simulated slave driven by a CSV file, plus a
//! read-only poll client for checking it from the other end.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_modbus::client::Context as ModbusContext;
use tokio_modbus::prelude::*;
use tracing::{info, warn};

use crate::collector::decode::{decode_bits, decode_words};
use crate::config::{EndpointConfig, SimConfig};
use crate::csvdrive::{CsvDriver, CsvTable, PointBinding};
use crate::error::SimError;
use crate::model::{ByteOrder, RegisterKind};
use crate::shutdown::{self, ShutdownRx};
use crate::slave::SlaveEngine;
use crate::transport::{open_serial, rtu, tcp::TcpSlaveServer};

fn bindings(cfg: &SimConfig) -> Vec<PointBinding> {
    cfg.registers
        .iter()
        .map(|r| PointBinding::new(r.csv_column.clone(), r.kind, r.address, r.data_type, r.scale, r.offset))
        .collect()
}

/// Run the single-slave simulator until shutdown.
pub async fn run_simulator(cfg: SimConfig, mut shutdown: ShutdownRx) -> Result<()> {
    let table = CsvTable::load(&cfg.csv_file)
        .with_context(|| format!("load csv {}", cfg.csv_file.display()))?;
    let engine = Arc::new(SlaveEngine::new());
    let driver = CsvDriver::new(table, bindings(&cfg), Arc::clone(&engine), cfg.update_interval);

    if cfg.server.is_rtu() {
        let stream = open_serial(&cfg.server.serial_settings())?;
        info!(
            port = %cfg.server.serial_settings().port,
            slave_id = cfg.server.slave_id,
            "modbus rtu simulator started"
        );
        let serve = tokio::spawn(rtu::serve_stream(
            stream,
            cfg.server.slave_id,
            engine,
            shutdown.clone(),
        ));
        let drive = tokio::spawn(driver.run(shutdown.clone()));
        shutdown::wait(&mut shutdown).await;
        let _ = drive.await;
        if let Ok(Err(e)) = serve.await {
            warn!("rtu stream ended: {}", e);
        }
    } else {
        let listener = TcpSlaveServer::bind(&cfg.server.listen_address, engine, shutdown.clone())
            .await
            .map_err(|source| SimError::Bind {
                address: cfg.server.listen_address.clone(),
                source,
            })?;
        info!(address = %listener.local_addr(), "modbus tcp simulator listening");
        let drive = tokio::spawn(driver.run(shutdown.clone()));
        shutdown::wait(&mut shutdown).await;
        let _ = drive.await;
        listener.stop().await;
    }

    info!("simulator stopped");
    Ok(())
}

/// Run a read-only poll loop against the configured endpoint, logging
/// every decoded register until shutdown.
pub async fn run_poll_client(cfg: SimConfig, mut shutdown: ShutdownRx) -> Result<()> {
    let endpoint = cfg.client.as_ref().unwrap_or(&cfg.server);
    let interval = endpoint.update_interval.unwrap_or(cfg.update_interval);

    let mut ctx = connect(endpoint).await?;
    info!(
        target = %endpoint_label(endpoint),
        slave_id = endpoint.slave_id,
        "poll client connected"
    );

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
                for binding in &cfg.registers {
                    if shutdown::is_shutdown(&shutdown) {
                        break;
                    }
                    match read_register(&mut ctx, binding).await {
                        Ok(value) => info!(
                            column = %binding.csv_column,
                            address = binding.address,
                            kind = %binding.kind,
                            "value {}",
                            value
                        ),
                        Err(e) => warn!(
                            column = %binding.csv_column,
                            address = binding.address,
                            "read failed: {:#}",
                            e
                        ),
                    }
                }
            }
        }
    }

    let _ = ctx.disconnect().await;
    Ok(())
}

async fn connect(endpoint: &EndpointConfig) -> Result<ModbusContext> {
    let slave = Slave(endpoint.slave_id);
    if endpoint.is_rtu() {
        let port = open_serial(&endpoint.serial_settings())?;
        Ok(tokio_modbus::client::rtu::attach_slave(port, slave))
    } else {
        let addr: SocketAddr = endpoint
            .listen_address
            .parse()
            .with_context(|| format!("invalid address {:?}", endpoint.listen_address))?;
        Ok(tokio_modbus::client::tcp::connect_slave(addr, slave).await?)
    }
}

fn endpoint_label(endpoint: &EndpointConfig) -> String {
    if endpoint.is_rtu() {
        endpoint.serial_port.clone().unwrap_or_default()
    } else {
        endpoint.listen_address.clone()
    }
}

async fn read_register(
    ctx: &mut ModbusContext,
    binding: &crate::config::RegisterBinding,
) -> Result<f64> {
    let scale = if binding.scale == 0.0 { 1.0 } else { binding.scale };
    let raw = match binding.kind {
        RegisterKind::Coil => {
            let bits = ctx
                .read_coils(binding.address, 1)
                .await
                .context("read coils")?
                .map_err(|e| SimError::Protocol(format!("modbus exception: {:?}", e)))?;
            decode_bits(&bits).1
        }
        RegisterKind::Discrete => {
            let bits = ctx
                .read_discrete_inputs(binding.address, 1)
                .await
                .context("read discrete inputs")?
                .map_err(|e| SimError::Protocol(format!("modbus exception: {:?}", e)))?;
            decode_bits(&bits).1
        }
        RegisterKind::Holding | RegisterKind::Input => {
            let data_type = binding.data_type.unwrap_or(crate::model::DataType::Uint16);
            let qty = data_type.register_count();
            let words = match binding.kind {
                RegisterKind::Holding => ctx.read_holding_registers(binding.address, qty).await,
                _ => ctx.read_input_registers(binding.address, qty).await,
            }
            .context("read registers")?
            .map_err(|e| SimError::Protocol(format!("modbus exception: {:?}", e)))?;
            decode_words(&words, data_type, ByteOrder::Abcd)?.1
        }
    };
    Ok(raw * scale + binding.offset)
}
