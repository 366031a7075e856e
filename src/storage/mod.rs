//! Asynchronous, bounded-queue persistence for collected point values.
//!
//! Producers enqueue through [`StorageHandle::handle`]: a dedup-cache
//! check, a non-blocking send, and a 2-second bounded wait when the queue
//! is full. On timeout the value is dropped with a log entry; bounded
//! loss under sustained overload is the deliberate backpressure policy.
//! A single consumer task drains the queue and fans each value out to the
//! enabled sinks in fixed order: JSONL, CSV, SQLite.

pub mod cache;
pub mod db;

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{FleetConfig, StorageConfig};
use crate::error::SimError;
use crate::model::PointValue;
use cache::ValueCache;
use db::Database;

/// Bounded wait before a value is dropped when the queue is full.
const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(2);
/// JSONL writer buffer size.
const JSON_BUFFER: usize = 64 * 1024;

/// Which sinks a `file_type` value enables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkSet {
    pub json: bool,
    pub csv: bool,
    pub db: bool,
}

impl SinkSet {
    /// Parse the `file_type` enumerated set. `log` enables no sink at
    /// all: emissions are logged by the consumer instead.
    pub fn parse(file_type: &str) -> Result<Self> {
        let normalized = file_type.trim().to_lowercase();
        let set = match normalized.as_str() {
            "log" => Self { json: false, csv: false, db: false },
            "json" | "jsonl" => Self { json: true, csv: false, db: false },
            "csv" => Self { json: false, csv: true, db: false },
            "db" => Self { json: false, csv: false, db: true },
            "json+csv" | "csv+json" | "both" => Self { json: true, csv: true, db: false },
            "json+db" | "db+json" => Self { json: true, csv: false, db: true },
            "csv+db" | "db+csv" => Self { json: false, csv: true, db: true },
            "all" | "" => Self { json: true, csv: true, db: true },
            other => {
                return Err(
                    SimError::config(format!("unsupported storage file_type {:?}", other)).into(),
                )
            }
        };
        Ok(set)
    }

    pub fn log_only(&self) -> bool {
        !self.json && !self.csv && !self.db
    }
}

/// Resolve `db_path` into the output directory and database file:
/// a value with an extension is taken as the database file itself, a
/// bare path as a directory that receives `data.sqlite`.
fn resolve_paths(db_path: &str) -> (PathBuf, PathBuf) {
    let db_path = if db_path.trim().is_empty() { "db.sqlite" } else { db_path };
    let path = Path::new(db_path);
    let looks_like_file = path
        .file_name()
        .map(|name| name.to_string_lossy().contains('.'))
        .unwrap_or(false);
    if looks_like_file {
        let dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        (dir, path.to_path_buf())
    } else {
        (path.to_path_buf(), path.join("data.sqlite"))
    }
}

/// Producer-side handle: dedup cache plus the queue sender.
#[derive(Clone)]
pub struct StorageHandle {
    tx: mpsc::Sender<PointValue>,
    cache: Arc<ValueCache>,
}

impl StorageHandle {
    /// Enqueue a value for the consumer. Dedup hits are silently
    /// successful; a full queue is waited on briefly and then the value
    /// is dropped.
    pub async fn handle(&self, value: PointValue) -> Result<(), SimError> {
        if !self.cache.observe(&value.dedup_key(), value.value) {
            debug!(
                device_id = %value.device_id,
                point = %value.point_name,
                "dedup cache hit, skipping write"
            );
            return Ok(());
        }

        match self.tx.try_send(value) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SimError::Cancelled),
            Err(mpsc::error::TrySendError::Full(value)) => {
                let key = value.dedup_key();
                match tokio::time::timeout(ENQUEUE_TIMEOUT, self.tx.send(value)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(SimError::Cancelled),
                    Err(_) => {
                        warn!(key = %key, "storage queue full, dropping value");
                        Err(SimError::StorageBackpressure(key))
                    }
                }
            }
        }
    }
}

/// The open storage sink. Dropping it without [`Storage::close`] loses
/// whatever the consumer has not flushed yet.
pub struct Storage {
    tx: Option<mpsc::Sender<PointValue>>,
    cache: Arc<ValueCache>,
    consumer: tokio::task::JoinHandle<()>,
}

impl Storage {
    /// Open files and database per the configuration and start the
    /// consumer. When `fleet` is given and the database is enabled, the
    /// `servers`/`devices` tables are seeded on first start.
    pub fn open(cfg: &StorageConfig, fleet: Option<&FleetConfig>) -> Result<Self> {
        let sinks = SinkSet::parse(&cfg.file_type)?;
        let (out_dir, db_file) = resolve_paths(&cfg.db_path);

        let mut writers = SinkWriters::open(sinks, &out_dir, &db_file)?;
        if let (Some(database), Some(fleet)) = (writers.db.as_mut(), fleet) {
            database.seed_fleet(fleet)?;
        }

        let queue_size = if cfg.max_queue_size == 0 { 1000 } else { cfg.max_queue_size };
        let (tx, rx) = mpsc::channel(queue_size);
        let cache = Arc::new(ValueCache::new(cfg.cache_ttl));
        let consumer = tokio::spawn(consume(rx, writers));

        info!(
            queue = queue_size,
            json = sinks.json,
            csv = sinks.csv,
            db = sinks.db,
            dir = %out_dir.display(),
            "storage sink open"
        );
        Ok(Self {
            tx: Some(tx),
            cache,
            consumer,
        })
    }

    pub fn handle(&self) -> StorageHandle {
        StorageHandle {
            tx: self.tx.clone().expect("storage open"),
            cache: Arc::clone(&self.cache),
        }
    }

    /// Close the queue, drain the consumer, flush and close every sink.
    pub async fn close(mut self) {
        drop(self.tx.take());
        if let Err(e) = self.consumer.await {
            warn!("storage consumer panicked: {}", e);
        }
    }
}

struct SinkWriters {
    sinks: SinkSet,
    json: Option<BufWriter<File>>,
    csv: Option<csv::Writer<File>>,
    db: Option<Database>,
}

impl SinkWriters {
    fn open(sinks: SinkSet, out_dir: &Path, db_file: &Path) -> Result<Self> {
        if (sinks.json || sinks.csv) && !out_dir.as_os_str().is_empty() {
            std::fs::create_dir_all(out_dir)
                .with_context(|| format!("create output directory {}", out_dir.display()))?;
        }

        let json = if sinks.json {
            let path = out_dir.join("collector.jsonl");
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("open json output {}", path.display()))?;
            Some(BufWriter::with_capacity(JSON_BUFFER, file))
        } else {
            None
        };

        let csv = if sinks.csv {
            let path = out_dir.join("collector.csv");
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("open csv output {}", path.display()))?;
            let was_empty = file.metadata().map(|m| m.len() == 0).unwrap_or(true);
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(file);
            if was_empty {
                writer
                    .write_record([
                        "timestamp",
                        "server_id",
                        "device_id",
                        "connection",
                        "slave_id",
                        "point_name",
                        "address",
                        "register",
                        "unit",
                        "value",
                    ])
                    .context("write csv header")?;
                writer.flush().context("flush csv header")?;
            }
            Some(writer)
        } else {
            None
        };

        let db = if sinks.db {
            if let Some(parent) = db_file.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("create database directory {}", parent.display())
                    })?;
                }
            }
            Some(Database::open(db_file)?)
        } else {
            None
        };

        Ok(Self { sinks, json, csv, db })
    }

    fn write(&mut self, value: &PointValue) {
        if self.sinks.log_only() {
            info!(
                server_id = %value.server_id,
                device_id = %value.device_id,
                point = %value.point_name,
                "value {}",
                value.value
            );
            return;
        }
        if let Some(writer) = self.json.as_mut() {
            if let Err(e) = write_jsonl(writer, value) {
                warn!(
                    device_id = %value.device_id,
                    point = %value.point_name,
                    "jsonl write failed: {}",
                    e
                );
            }
        }
        if let Some(writer) = self.csv.as_mut() {
            if let Err(e) = write_csv(writer, value) {
                warn!(
                    device_id = %value.device_id,
                    point = %value.point_name,
                    "csv write failed: {}",
                    e
                );
            }
        }
        if let Some(database) = self.db.as_ref() {
            if let Err(e) = database.insert_point_value(value) {
                warn!(
                    device_id = %value.device_id,
                    point = %value.point_name,
                    "db insert failed: {}",
                    e
                );
            }
        }
    }

    fn finish(mut self) {
        if let Some(mut writer) = self.json.take() {
            if let Err(e) = writer.flush() {
                warn!("jsonl flush failed: {}", e);
            }
        }
        if let Some(mut writer) = self.csv.take() {
            if let Err(e) = writer.flush() {
                warn!("csv flush failed: {}", e);
            }
        }
        if let Some(database) = self.db.take() {
            match database.point_value_count() {
                Ok(count) => debug!(rows = count, "database closed"),
                Err(e) => warn!("database count on close failed: {:#}", e),
            }
        }
    }
}

async fn consume(mut rx: mpsc::Receiver<PointValue>, mut writers: SinkWriters) {
    while let Some(value) = rx.recv().await {
        writers.write(&value);
    }
    writers.finish();
    debug!("storage consumer drained");
}

fn write_jsonl(writer: &mut BufWriter<File>, value: &PointValue) -> Result<()> {
    serde_json::to_writer(&mut *writer, value)?;
    writer.write_all(b"\n")?;
    Ok(())
}

fn write_csv(writer: &mut csv::Writer<File>, value: &PointValue) -> Result<()> {
    let record: [String; 10] = [
        value.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
        value.server_id.clone(),
        value.device_id.clone(),
        value.connection.clone(),
        value.slave_id.to_string(),
        value.point_name.clone(),
        value.address.to_string(),
        value.register.as_str().to_string(),
        value.unit.clone(),
        value.value.to_string(),
    ];
    writer.write_record(&record)?;
    Ok(())
}
