//! modsim command line: one process per role.
//!
//! `server`  - single CSV-driven slave (TOML config)
//! `servers` - slave fleet from YAML config, with snapshot export
//! `client`  - read-only poll loop against one endpoint (TOML config)
//! `collector` - concurrent polling engine with storage sinks
//! `export`  - query the SQLite store (latest / history / stats)

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use modsim::collector::{CollectorManager, PointSink};
use modsim::config::{FleetConfig, SimConfig};
use modsim::export::{write_snapshot_csv, write_snapshot_json};
use modsim::fleet::FleetManager;
use modsim::shutdown;
use modsim::sim;
use modsim::storage::{db::Database, Storage};

#[derive(Parser)]
#[command(name = "modsim", version, about = "Modbus simulation and acquisition toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a single CSV-driven Modbus slave.
    Server {
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
        /// Force RTU (serial) mode regardless of the config.
        #[arg(long)]
        rtu: bool,
    },
    /// Run a fleet of simulated slaves from a YAML config.
    Servers {
        #[arg(long, default_value = "config/config.yaml")]
        config: PathBuf,
        /// Write a JSON snapshot after the wait period and exit.
        #[arg(long)]
        snapshot_json: Option<PathBuf>,
        /// Write a CSV snapshot after the wait period and exit.
        #[arg(long)]
        snapshot_csv: Option<PathBuf>,
        /// How long to let the fleet run before snapshotting.
        #[arg(long, default_value = "3s", value_parser = humantime::parse_duration)]
        snapshot_wait: Duration,
    },
    /// Poll one endpoint and log decoded register values.
    Client {
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Run the concurrent collector.
    Collector {
        #[arg(long, default_value = "config/config.yaml")]
        config: PathBuf,
        /// Enable storage even when the config leaves it off.
        #[arg(long)]
        storage_enabled: bool,
        /// Override the storage directory (implies --storage-enabled).
        #[arg(long)]
        storage_dir: Option<String>,
        /// Override the storage queue depth (implies --storage-enabled).
        #[arg(long)]
        storage_queue: Option<usize>,
    },
    /// Query the SQLite store.
    Export {
        #[arg(long, default_value = "./data.sqlite")]
        db: PathBuf,
        /// Latest value per (server, device, point) triple.
        #[arg(long)]
        latest: bool,
        /// Also refresh the latest_datas_value table.
        #[arg(long)]
        materialize: bool,
        /// Device history, newest first.
        #[arg(long)]
        history: Option<String>,
        /// Aggregated stats for a device.
        #[arg(long)]
        stats: Option<String>,
        /// Optional server filter for --latest.
        #[arg(long)]
        server: Option<String>,
        /// Optional device filter for --latest.
        #[arg(long)]
        device: Option<String>,
        /// Row limit for --history / --stats (0 = unlimited).
        #[arg(long, default_value_t = 0)]
        limit: i64,
        /// Compact JSON output.
        #[arg(long)]
        compact: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .max_blocking_threads(8) // bounded pool for SQLite and file work
        .enable_all()
        .build()
        .expect("build tokio runtime");

    if let Err(e) = runtime.block_on(run(cli)) {
        error!("fatal: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    init_logging();

    match cli.command {
        Command::Server { config, rtu } => {
            let mut cfg = SimConfig::load(&config)?;
            if rtu {
                cfg.server.mode = "rtu".to_string();
            }
            let shutdown = shutdown::install_signal_handlers()?;
            sim::run_simulator(cfg, shutdown).await
        }
        Command::Client { config } => {
            let cfg = SimConfig::load(&config)?;
            let shutdown = shutdown::install_signal_handlers()?;
            sim::run_poll_client(cfg, shutdown).await
        }
        Command::Servers {
            config,
            snapshot_json,
            snapshot_csv,
            snapshot_wait,
        } => {
            let cfg = FleetConfig::load(&config)?;
            run_fleet(cfg, snapshot_json, snapshot_csv, snapshot_wait).await
        }
        Command::Collector {
            config,
            storage_enabled,
            storage_dir,
            storage_queue,
        } => {
            let mut cfg = FleetConfig::load(&config)?;
            if storage_enabled {
                cfg.system.storage.enabled = true;
            }
            if let Some(dir) = storage_dir {
                cfg.system.storage.db_path = dir;
                cfg.system.storage.enabled = true;
            }
            if let Some(queue) = storage_queue {
                cfg.system.storage.max_queue_size = queue;
                cfg.system.storage.enabled = true;
            }
            run_collector(cfg).await
        }
        Command::Export {
            db,
            latest,
            materialize,
            history,
            stats,
            server,
            device,
            limit,
            compact,
        } => run_export(
            db,
            latest,
            materialize,
            history,
            stats,
            server,
            device,
            limit,
            compact,
        ),
    }
}

async fn run_fleet(
    cfg: FleetConfig,
    snapshot_json: Option<PathBuf>,
    snapshot_csv: Option<PathBuf>,
    snapshot_wait: Duration,
) -> Result<()> {
    let snapshot_mode = snapshot_json.is_some() || snapshot_csv.is_some();
    let manager = FleetManager::new(cfg);

    let shutdown = if snapshot_mode {
        // One-shot: run the fleet long enough to take a snapshot, then
        // shut it down ourselves.
        let (tx, rx) = shutdown::channel();
        let run = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.run(rx).await })
        };
        tokio::time::sleep(snapshot_wait).await;

        let snapshots = manager.snapshot();
        if let Some(path) = snapshot_json {
            write_snapshot_json(&path, &snapshots)?;
            info!(path = %path.display(), "wrote json snapshot");
        }
        if let Some(path) = snapshot_csv {
            write_snapshot_csv(&path, &snapshots)?;
            info!(path = %path.display(), "wrote csv snapshot");
        }

        let _ = tx.send(true);
        let _ = run.await;
        return Ok(());
    } else {
        shutdown::install_signal_handlers()?
    };

    info!("fleet running, press Ctrl+C to stop");
    manager.run(shutdown).await;
    Ok(())
}

async fn run_collector(cfg: FleetConfig) -> Result<()> {
    let shutdown = shutdown::install_signal_handlers()?;

    let (sink, storage) = if cfg.system.storage.enabled {
        let storage = Storage::open(&cfg.system.storage, Some(&cfg))
            .context("open storage sink")?;
        (PointSink::Storage(storage.handle()), Some(storage))
    } else {
        (PointSink::Log, None)
    };

    let manager = CollectorManager::new(cfg);
    manager.run(sink, shutdown).await;

    if let Some(storage) = storage {
        storage.close().await;
        info!("storage sink closed");
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_export(
    db: PathBuf,
    latest: bool,
    materialize: bool,
    history: Option<String>,
    stats: Option<String>,
    server: Option<String>,
    device: Option<String>,
    limit: i64,
    compact: bool,
) -> Result<()> {
    let mut database = Database::open(&db)?;

    if let Some(device_id) = history {
        let rows = database.device_history(&device_id, limit)?;
        return print_json(&rows, compact);
    }
    if let Some(device_id) = stats {
        let aggregated = database.stats(&device_id, limit)?;
        return print_json(&aggregated, compact);
    }
    if latest {
        if materialize {
            let rows = database.materialize_latest()?;
            info!(rows, "materialized latest_datas_value");
        }
        let points = database.latest_points(server.as_deref(), device.as_deref())?;
        return print_json(&points, compact);
    }

    anyhow::bail!("nothing to export: pass --latest, --history <device>, or --stats <device>")
}

fn print_json<T: serde::Serialize>(value: &T, compact: bool) -> Result<()> {
    let body = if compact {
        serde_json::to_string(value)?
    } else {
        serde_json::to_string_pretty(value)?
    };
    println!("{}", body);
    Ok(())
}
