//! Embedded SQLite persistence.
//!
//! Schema-managed: `open` creates the tables and indexes when missing, in
//! WAL mode with foreign keys on. Rows are append-only except through the
//! cascade deletes declared in the schema.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::FleetConfig;
use crate::error::SimError;
use crate::model::PointValue;

pub struct Database {
    conn: Connection,
}

/// A `servers` table row as exposed by the query API.
#[derive(Debug, Clone, Serialize)]
pub struct ServerRow {
    pub server_id: String,
    pub server_name: String,
    pub protocol: String,
    pub host: String,
    pub port: u16,
}

/// A `devices` table row as exposed by the query API.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRow {
    pub device_id: String,
    pub server_id: String,
    pub vendor: String,
    pub slave_id: i64,
    pub poll_interval: String,
}

/// One historical `point_values` row.
#[derive(Debug, Clone, Serialize)]
pub struct PointRow {
    pub device_id: String,
    pub name: String,
    pub address: i64,
    pub register_type: String,
    pub data_type: String,
    pub byte_order: String,
    pub unit: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// The freshest row per `(server_id, device_id, name)` triple.
#[derive(Debug, Clone, Serialize)]
pub struct LatestPoint {
    pub server_id: String,
    pub device_id: String,
    pub name: String,
    pub address: i64,
    pub register_type: String,
    pub data_type: String,
    pub byte_order: String,
    pub unit: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Aggregated view for the `export --stats` surface.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub server_count: usize,
    pub servers: Vec<ServerRow>,
    pub device_count: usize,
    pub devices: Vec<DeviceRow>,
    pub device_points_count: usize,
    pub device_points: Vec<PointRow>,
}

impl Database {
    /// Open (or create) the database file and ensure the schema exists.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("open sqlite database {}", path.display()))?;
        let db = Self { conn };
        db.configure()?;
        db.migrate()?;
        debug!("sqlite database ready at {}", path.display());
        Ok(db)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite")?;
        let db = Self { conn };
        db.configure()?;
        db.migrate()?;
        Ok(db)
    }

    fn configure(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "PRAGMA journal_mode=WAL;
                 PRAGMA synchronous=NORMAL;
                 PRAGMA busy_timeout=5000;
                 PRAGMA foreign_keys=ON;",
            )
            .context("configure sqlite pragmas")?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS servers (
                     server_id TEXT PRIMARY KEY,
                     server_name TEXT NOT NULL,
                     protocol TEXT NOT NULL,
                     host TEXT NOT NULL,
                     port INTEGER NOT NULL,
                     timeout TEXT,
                     retry_count INTEGER,
                     enabled BOOLEAN NOT NULL DEFAULT 1,
                     poll_interval TEXT
                 );
                 CREATE TABLE IF NOT EXISTS devices (
                     device_id TEXT PRIMARY KEY,
                     server_id TEXT NOT NULL,
                     vendor TEXT,
                     slave_id INTEGER,
                     poll_interval TEXT,
                     FOREIGN KEY (server_id) REFERENCES servers(server_id) ON DELETE CASCADE
                 );
                 CREATE TABLE IF NOT EXISTS point_values (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     device_id TEXT NOT NULL,
                     name TEXT NOT NULL,
                     address INTEGER NOT NULL,
                     register_type TEXT NOT NULL,
                     data_type TEXT NOT NULL,
                     byte_order TEXT NOT NULL,
                     scale REAL NOT NULL DEFAULT 1.0,
                     offset REAL NOT NULL DEFAULT 0.0,
                     unit TEXT,
                     value REAL,
                     timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
                     FOREIGN KEY (device_id) REFERENCES devices(device_id) ON DELETE CASCADE
                 );
                 CREATE TABLE IF NOT EXISTS latest_datas_value (
                     id INTEGER PRIMARY KEY AUTOINCREMENT,
                     server_id TEXT,
                     device_id TEXT,
                     name TEXT,
                     address INTEGER,
                     register_type TEXT,
                     data_type TEXT,
                     byte_order TEXT,
                     unit TEXT,
                     value REAL,
                     timestamp DATETIME
                 );
                 CREATE INDEX IF NOT EXISTS idx_point_values_device_id ON point_values(device_id);
                 CREATE INDEX IF NOT EXISTS idx_point_values_timestamp ON point_values(timestamp);
                 CREATE INDEX IF NOT EXISTS idx_devices_server_id ON devices(server_id);",
            )
            .context("migrate sqlite schema")?;
        Ok(())
    }

    /// Populate `servers` and `devices` from the fleet configuration on
    /// first start. Idempotent: runs inside one transaction with
    /// primary-key-keyed inserts, and is a no-op when servers exist.
    pub fn seed_fleet(&mut self, cfg: &FleetConfig) -> Result<()> {
        let existing: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM servers", [], |row| row.get(0))?;
        if existing > 0 {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        for server in &cfg.servers {
            tx.execute(
                "INSERT OR IGNORE INTO servers
                     (server_id, server_name, protocol, host, port, timeout, retry_count, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    server.server_id,
                    server.server_name,
                    server.protocol,
                    server.connection.host,
                    server.connection.port,
                    server
                        .timeout
                        .map(|d| humantime::format_duration(d).to_string()),
                    server.retry_count,
                    server.enabled,
                ],
            )?;
            for device in &server.devices {
                tx.execute(
                    "INSERT OR IGNORE INTO devices
                         (device_id, server_id, vendor, slave_id, poll_interval)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        device.device_id,
                        server.server_id,
                        device.vendor,
                        device.slave_id,
                        humantime::format_duration(device.poll_interval_or_default())
                            .to_string(),
                    ],
                )?;
            }
        }
        tx.commit()?;
        info!("seeded servers and devices tables from fleet configuration");
        Ok(())
    }

    /// Persist one decoded reading. Database failures surface as
    /// [`SimError::Storage`]; the consumer logs them and keeps going.
    pub fn insert_point_value(&self, value: &PointValue) -> Result<(), SimError> {
        self.conn.execute(
            "INSERT INTO point_values
                 (device_id, name, address, register_type, data_type, byte_order,
                  scale, offset, unit, value, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                value.device_id,
                value.point_name,
                value.address,
                value.register.as_str(),
                value.data_type.as_str(),
                value.byte_order.as_str(),
                value.scale,
                value.offset,
                value.unit,
                value.value,
                value.timestamp,
            ],
        )?;
        Ok(())
    }

    pub fn list_servers(&self) -> Result<Vec<ServerRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT server_id, server_name, protocol, host, port FROM servers ORDER BY server_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ServerRow {
                    server_id: row.get(0)?,
                    server_name: row.get(1)?,
                    protocol: row.get(2)?,
                    host: row.get(3)?,
                    port: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id, server_id, COALESCE(vendor, ''), COALESCE(slave_id, 0),
                    COALESCE(poll_interval, '')
             FROM devices ORDER BY device_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(DeviceRow {
                    device_id: row.get(0)?,
                    server_id: row.get(1)?,
                    vendor: row.get(2)?,
                    slave_id: row.get(3)?,
                    poll_interval: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// The freshest row per `(server_id, device_id, name)` triple, with
    /// optional server/device filters, ordered by point name. SQLite's
    /// MAX() aggregate picks the row the remaining columns come from, so
    /// timestamp ties resolve to a single arbitrary row.
    pub fn latest_points(
        &self,
        server_id: Option<&str>,
        device_id: Option<&str>,
    ) -> Result<Vec<LatestPoint>> {
        let mut stmt = self.conn.prepare(
            "SELECT d.server_id, p.device_id, p.name, p.address, p.register_type,
                    p.data_type, p.byte_order, COALESCE(p.unit, ''),
                    COALESCE(p.value, 0.0), MAX(p.timestamp)
             FROM point_values p
             JOIN devices d ON d.device_id = p.device_id
             WHERE (?1 IS NULL OR d.server_id = ?1)
               AND (?2 IS NULL OR p.device_id = ?2)
             GROUP BY d.server_id, p.device_id, p.name
             ORDER BY p.name",
        )?;
        let rows = stmt
            .query_map(params![server_id, device_id], |row| {
                Ok(LatestPoint {
                    server_id: row.get(0)?,
                    device_id: row.get(1)?,
                    name: row.get(2)?,
                    address: row.get(3)?,
                    register_type: row.get(4)?,
                    data_type: row.get(5)?,
                    byte_order: row.get(6)?,
                    unit: row.get(7)?,
                    value: row.get(8)?,
                    timestamp: row.get(9)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Historical rows for one device, newest first, names ascending
    /// within a timestamp. `limit == 0` returns everything.
    pub fn device_history(&self, device_id: &str, limit: i64) -> Result<Vec<PointRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT device_id, name, address, register_type, data_type, byte_order,
                    COALESCE(unit, ''), COALESCE(value, 0.0), timestamp
             FROM point_values
             WHERE device_id = ?1
             ORDER BY timestamp DESC, name
             LIMIT ?2",
        )?;
        let limit = if limit <= 0 { -1 } else { limit };
        let rows = stmt
            .query_map(params![device_id, limit], |row| {
                Ok(PointRow {
                    device_id: row.get(0)?,
                    name: row.get(1)?,
                    address: row.get(2)?,
                    register_type: row.get(3)?,
                    data_type: row.get(4)?,
                    byte_order: row.get(5)?,
                    unit: row.get(6)?,
                    value: row.get(7)?,
                    timestamp: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Aggregate servers, devices, and one device's history.
    pub fn stats(&self, device_id: &str, limit: i64) -> Result<Stats> {
        let servers = self.list_servers()?;
        let devices = self.list_devices()?;
        let device_points = self.device_history(device_id, limit)?;
        Ok(Stats {
            server_count: servers.len(),
            device_count: devices.len(),
            device_points_count: device_points.len(),
            servers,
            devices,
            device_points,
        })
    }

    /// Refresh the `latest_datas_value` table from the live data.
    /// Returns the number of materialized rows.
    pub fn materialize_latest(&mut self) -> Result<usize> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM latest_datas_value", [])?;
        let inserted = tx.execute(
            "INSERT INTO latest_datas_value
                 (server_id, device_id, name, address, register_type, data_type,
                  byte_order, unit, value, timestamp)
             SELECT d.server_id, p.device_id, p.name, p.address, p.register_type,
                    p.data_type, p.byte_order, COALESCE(p.unit, ''),
                    COALESCE(p.value, 0.0), MAX(p.timestamp)
             FROM point_values p
             JOIN devices d ON d.device_id = p.device_id
             GROUP BY d.server_id, p.device_id, p.name",
            [],
        )?;
        tx.commit()?;
        Ok(inserted)
    }

    /// Count of stored point values; used by shutdown logging.
    pub fn point_value_count(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM point_values", [], |row| row.get(0))
            .optional()?
            .unwrap_or(0);
        Ok(count)
    }
}
