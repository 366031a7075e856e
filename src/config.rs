//! Configuration loading for the fleet (YAML) and the single-server
//! simulator (TOML).
//!
//! Parsing is plain serde; validation and defaulting happen in `load` so
//! the rest of the system only ever sees well-formed values: slave ids in
//! 1..=247, numeric points with a concrete data type, wide points that
//! fit the register space, and non-zero scales.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SimError;
use crate::model::{ByteOrder, DataType, RegisterKind};

fn default_max_workers() -> usize {
    10
}

fn default_max_queue() -> usize {
    1000
}

fn default_file_type() -> String {
    "csv".to_string()
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_scale() -> f64 {
    1.0
}

/// Deserialize a `server_id -> duration` map with humantime values
/// (`"500ms"`, `"3s"`, ...).
mod frequency_map {
    use super::*;
    use serde::Deserializer;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<String, Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: HashMap<String, humantime_serde::Serde<Duration>> =
            HashMap::deserialize(deserializer)?;
        Ok(raw.into_iter().map(|(k, v)| (k, v.into_inner())).collect())
    }
}

/// Root of the fleet configuration (`servers`, `collector` commands).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default, with = "frequency_map")]
    pub frequency: HashMap<String, Duration>,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_queue")]
    pub max_queue_size: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_workers: default_max_workers(),
            max_queue_size: default_max_queue(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub enabled: bool,
    /// One of: log, csv, json, jsonl, db, json+csv, csv+json, both,
    /// json+db, db+json, csv+db, db+csv, all.
    #[serde(default = "default_file_type")]
    pub file_type: String,
    /// Either a directory (the database lands at `<dir>/data.sqlite`) or
    /// a database file path.
    #[serde(default)]
    pub db_path: String,
    #[serde(default)]
    pub max_workers: usize,
    #[serde(default = "default_max_queue")]
    pub max_queue_size: usize,
    #[serde(default = "default_cache_ttl", with = "humantime_serde")]
    pub cache_ttl: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            file_type: default_file_type(),
            db_path: String::new(),
            max_workers: 0,
            max_queue_size: default_max_queue(),
            cache_ttl: default_cache_ttl(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub server_id: String,
    #[serde(default)]
    pub server_name: String,
    /// `modbus-tcp` or `modbus-rtu` (bare `tcp`/`rtu` accepted).
    pub protocol: String,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub enabled: bool,
    /// `device` (inline `devices` list) or `csvfile` (`devices_file`).
    #[serde(default, rename = "type")]
    pub devices_type: String,
    #[serde(default)]
    pub devices_file: Option<PathBuf>,
    /// Time-series file the fleet simulator feeds into this server's
    /// registers. Without it the registers stay at their initial zeros.
    #[serde(default)]
    pub csv_file: Option<PathBuf>,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl ServerConfig {
    pub fn is_tcp(&self) -> bool {
        matches!(self.protocol.to_lowercase().as_str(), "modbus-tcp" | "tcp")
    }

    pub fn is_rtu(&self) -> bool {
        matches!(self.protocol.to_lowercase().as_str(), "modbus-rtu" | "rtu")
    }

    /// `host:port` for TCP servers, the serial port path for RTU.
    pub fn address(&self) -> String {
        if self.is_rtu() {
            self.connection.serial_port.clone().unwrap_or_default()
        } else {
            format!("{}:{}", self.connection.host, self.connection.port)
        }
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            port: self.connection.serial_port.clone().unwrap_or_default(),
            baud_rate: self.connection.baud_rate,
            data_bits: self.connection.data_bits,
            stop_bits: self.connection.stop_bits,
            parity: self.connection.parity.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub serial_port: Option<String>,
    #[serde(default)]
    pub baud_rate: u32,
    #[serde(default)]
    pub data_bits: u8,
    #[serde(default)]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: String,
}

/// Serial parameters handed to the transport layer.
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub device_id: String,
    #[serde(default)]
    pub vendor: String,
    pub slave_id: u8,
    #[serde(default, with = "humantime_serde")]
    pub poll_interval: Option<Duration>,
    pub points: Vec<PointConfig>,
}

impl DeviceConfig {
    pub fn poll_interval_or_default(&self) -> Duration {
        self.poll_interval.unwrap_or(Duration::from_secs(5))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PointConfig {
    pub name: String,
    pub address: u16,
    #[serde(default)]
    pub data_type: Option<DataType>,
    #[serde(default)]
    pub byte_order: Option<ByteOrder>,
    pub register_type: RegisterKind,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub unit: String,
}

impl PointConfig {
    /// Effective data type after the ambiguity tie-breaks: numeric points
    /// default to uint16, bit points are always bool.
    pub fn effective_data_type(&self) -> DataType {
        if self.register_type.is_bit() {
            DataType::Bool
        } else {
            self.data_type.unwrap_or(DataType::Uint16)
        }
    }

    pub fn effective_byte_order(&self) -> ByteOrder {
        self.byte_order.unwrap_or_default()
    }

    pub fn effective_scale(&self) -> f64 {
        if self.scale == 0.0 {
            1.0
        } else {
            self.scale
        }
    }
}

impl FleetConfig {
    /// Load and validate a fleet configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let mut cfg: FleetConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("parse yaml config {}", path.display()))?;

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        cfg.resolve_devices(base_dir)
            .map_err(|e| SimError::config(format!("{:#}", e)))?;
        cfg.validate()
            .map_err(|e| SimError::config(format!("{:#}", e)))?;
        debug!(
            servers = cfg.servers.len(),
            "fleet configuration loaded from {}",
            path.display()
        );
        Ok(cfg)
    }

    /// Resolve `type: csvfile` servers by loading their device tables.
    fn resolve_devices(&mut self, base_dir: &Path) -> Result<()> {
        for server in &mut self.servers {
            let kind = server.devices_type.trim().to_lowercase();
            match kind.as_str() {
                "" | "device" | "devices" | "points" => {
                    server.devices_type = "device".to_string();
                    if server.devices.is_empty() {
                        bail!("server {}: devices list is empty", server.server_id);
                    }
                }
                "csvfile" | "csv" => {
                    let file = server.devices_file.clone().ok_or_else(|| {
                        anyhow::anyhow!(
                            "server {}: devices_file is required for csvfile type",
                            server.server_id
                        )
                    })?;
                    let resolved = if file.is_absolute() {
                        file
                    } else {
                        base_dir.join(file)
                    };
                    server.devices = load_devices_csv(&resolved)
                        .with_context(|| format!("server {}", server.server_id))?;
                    server.devices_file = Some(resolved);
                    server.devices_type = "csvfile".to_string();
                }
                other => bail!(
                    "server {}: unsupported devices type {:?}",
                    server.server_id,
                    other
                ),
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            bail!("no servers configured");
        }
        let mut device_ids = HashSet::new();
        for server in &self.servers {
            if !server.is_tcp() && !server.is_rtu() {
                bail!(
                    "server {}: unsupported protocol {:?}",
                    server.server_id,
                    server.protocol
                );
            }
            if server.is_rtu() && server.connection.serial_port.is_none() {
                bail!("server {}: serial_port is required for RTU", server.server_id);
            }
            for device in &server.devices {
                if device.slave_id == 0 {
                    bail!(
                        "server {} device {}: slave id 0 is reserved for broadcast",
                        server.server_id,
                        device.device_id
                    );
                }
                if !device_ids.insert(device.device_id.clone()) {
                    bail!("duplicate device id {:?}", device.device_id);
                }
                for point in &device.points {
                    validate_point(&server.server_id, &device.device_id, point)?;
                }
            }
        }
        Ok(())
    }
}

fn validate_point(server_id: &str, device_id: &str, point: &PointConfig) -> Result<()> {
    if point.register_type.is_bit() {
        if point.data_type.is_some() {
            bail!(
                "server {} device {} point {}: data_type is not supported for {} registers",
                server_id,
                device_id,
                point.name,
                point.register_type
            );
        }
    } else if point.effective_data_type().register_count() == 2 && point.address == u16::MAX {
        bail!(
            "server {} device {} point {}: 32-bit value at address {} would overflow the register space",
            server_id,
            device_id,
            point.name,
            point.address
        );
    }
    Ok(())
}

/// Load a device/point table from CSV. Required columns: `device_id`,
/// `address`, `register_type`. Rows are grouped into devices in
/// first-seen order.
fn load_devices_csv(path: &Path) -> Result<Vec<DeviceConfig>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("open devices csv {}", path.display()))?;

    let headers: Vec<String> = reader
        .headers()
        .context("read devices csv header")?
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();
    let index: HashMap<&str, usize> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| (h.as_str(), i))
        .collect();
    for required in ["device_id", "address", "register_type"] {
        if !index.contains_key(required) {
            bail!(
                "devices csv {}: missing required column {:?}",
                path.display(),
                required
            );
        }
    }

    let field = |record: &csv::StringRecord, key: &str| -> String {
        index
            .get(key)
            .and_then(|&i| record.get(i))
            .unwrap_or("")
            .trim()
            .to_string()
    };

    let mut order: Vec<String> = Vec::new();
    let mut devices: HashMap<String, DeviceConfig> = HashMap::new();

    for record in reader.records() {
        let record = record.context("read devices csv row")?;
        let device_id = field(&record, "device_id");
        if device_id.is_empty() {
            bail!("devices csv {}: row without device_id", path.display());
        }

        if !devices.contains_key(&device_id) {
            let slave_id = {
                let raw = field(&record, "slave_id");
                if raw.is_empty() {
                    0
                } else {
                    raw.parse::<u8>().with_context(|| {
                        format!("devices csv: device {} invalid slave_id", device_id)
                    })?
                }
            };
            let poll_interval = {
                let raw = field(&record, "poll_interval");
                if raw.is_empty() {
                    None
                } else {
                    Some(humantime::parse_duration(&raw).with_context(|| {
                        format!("devices csv: device {} invalid poll_interval", device_id)
                    })?)
                }
            };
            order.push(device_id.clone());
            devices.insert(
                device_id.clone(),
                DeviceConfig {
                    device_id: device_id.clone(),
                    vendor: field(&record, "vendor"),
                    slave_id,
                    poll_interval,
                    points: Vec::new(),
                },
            );
        }

        let name = {
            let n = field(&record, "point_name");
            if n.is_empty() {
                field(&record, "name")
            } else {
                n
            }
        };
        if name.is_empty() {
            bail!(
                "devices csv {}: device {} point without name",
                path.display(),
                device_id
            );
        }

        let address: u16 = field(&record, "address")
            .parse()
            .with_context(|| format!("devices csv: device {} point {} invalid address", device_id, name))?;

        let register_type: RegisterKind =
            serde_yaml::from_str(&field(&record, "register_type")).with_context(|| {
                format!(
                    "devices csv: device {} point {} invalid register_type",
                    device_id, name
                )
            })?;

        let data_type = {
            let raw = field(&record, "data_type");
            if raw.is_empty() {
                None
            } else {
                Some(serde_yaml::from_str(&raw).with_context(|| {
                    format!("devices csv: device {} point {} invalid data_type", device_id, name)
                })?)
            }
        };
        let byte_order = {
            let raw = field(&record, "byte_order");
            if raw.is_empty() {
                None
            } else {
                Some(serde_yaml::from_str(&raw).with_context(|| {
                    format!("devices csv: device {} point {} invalid byte_order", device_id, name)
                })?)
            }
        };

        let scale = {
            let raw = field(&record, "scale");
            if raw.is_empty() {
                1.0
            } else {
                raw.parse().with_context(|| {
                    format!("devices csv: device {} point {} invalid scale", device_id, name)
                })?
            }
        };
        let offset = {
            let raw = field(&record, "offset");
            if raw.is_empty() {
                0.0
            } else {
                raw.parse().with_context(|| {
                    format!("devices csv: device {} point {} invalid offset", device_id, name)
                })?
            }
        };

        let device = devices.get_mut(&device_id).expect("device inserted above");
        device.points.push(PointConfig {
            name,
            address,
            data_type,
            byte_order,
            register_type,
            scale,
            offset,
            unit: field(&record, "unit"),
        });
    }

    if order.is_empty() {
        bail!("devices csv {}: no device rows", path.display());
    }
    let out: Vec<DeviceConfig> = order
        .into_iter()
        .map(|id| devices.remove(&id).expect("ordered id present"))
        .collect();
    for device in &out {
        if device.points.is_empty() {
            bail!("devices csv: device {} has no points", device.device_id);
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Single-server simulator configuration (TOML)
// ---------------------------------------------------------------------------

fn default_listen_address() -> String {
    "0.0.0.0:1502".to_string()
}

fn default_update_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_slave_id() -> u8 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimConfig {
    pub csv_file: PathBuf,
    #[serde(default = "default_update_interval", with = "humantime_serde")]
    pub update_interval: Duration,
    #[serde(default)]
    pub server: EndpointConfig,
    /// Optional separate `[client]` section; the poll client falls back
    /// to `[server]` when absent.
    #[serde(default)]
    pub client: Option<EndpointConfig>,
    pub registers: Vec<RegisterBinding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// `tcp` or `rtu`.
    #[serde(default)]
    pub mode: String,
    /// `path` is accepted as a synonym.
    #[serde(default, alias = "path")]
    pub serial_port: Option<String>,
    #[serde(default)]
    pub baud_rate: u32,
    #[serde(default)]
    pub data_bits: u8,
    #[serde(default)]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: String,
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,
    #[serde(default, with = "humantime_serde")]
    pub update_interval: Option<Duration>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            mode: String::new(),
            serial_port: None,
            baud_rate: 0,
            data_bits: 0,
            stop_bits: 0,
            parity: String::new(),
            slave_id: default_slave_id(),
            update_interval: None,
        }
    }
}

impl EndpointConfig {
    pub fn is_rtu(&self) -> bool {
        self.mode.eq_ignore_ascii_case("rtu") || self.serial_port.is_some()
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            port: self.serial_port.clone().unwrap_or_default(),
            baud_rate: self.baud_rate,
            data_bits: self.data_bits,
            stop_bits: self.stop_bits,
            parity: self.parity.clone(),
        }
    }
}

/// One register fed from a CSV column in single-server mode.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterBinding {
    #[serde(rename = "type")]
    pub kind: RegisterKind,
    pub address: u16,
    pub csv_column: String,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub data_type: Option<DataType>,
}

impl SimConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let cfg: SimConfig = toml::from_str(&content)
            .with_context(|| format!("parse toml config {}", path.display()))?;
        cfg.validate()
            .map_err(|e| SimError::config(format!("{:#}", e)))?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.registers.is_empty() {
            bail!("at least one register must be configured");
        }
        for binding in &self.registers {
            if binding.kind.is_bit() {
                if binding.data_type.is_some() {
                    bail!(
                        "register {}: data_type is not supported for {} registers",
                        binding.csv_column,
                        binding.kind
                    );
                }
            } else {
                match binding.data_type.unwrap_or(DataType::Uint16) {
                    DataType::Uint16 | DataType::Int16 | DataType::Float32 => {}
                    other => bail!(
                        "register {}: unsupported data_type {} for {} register",
                        binding.csv_column,
                        other,
                        binding.kind
                    ),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FLEET_YAML: &str = r#"
system:
  processing:
    enabled: true
    max_workers: 4
  storage:
    enabled: true
    file_type: all
    db_path: ./data
    cache_ttl: 10s
frequency:
  plant-a: 500ms
servers:
  - server_id: plant-a
    server_name: Plant A
    protocol: modbus-tcp
    connection:
      host: 127.0.0.1
      port: 15020
    timeout: 5s
    retry_count: 2
    enabled: true
    devices:
      - device_id: meter-1
        vendor: acme
        slave_id: 1
        poll_interval: 1s
        points:
          - name: temperature
            address: 100
            data_type: float32
            byte_order: ABCD
            register_type: holding
            scale: 0.1
            unit: C
          - name: running
            address: 0
            register_type: coil
"#;

    #[test]
    fn parses_fleet_yaml_with_durations() {
        let cfg: FleetConfig = serde_yaml::from_str(FLEET_YAML).unwrap();
        assert_eq!(cfg.system.processing.max_workers, 4);
        assert_eq!(cfg.system.processing.max_queue_size, 1000);
        assert_eq!(cfg.system.storage.cache_ttl, Duration::from_secs(10));
        assert_eq!(cfg.frequency["plant-a"], Duration::from_millis(500));
        let server = &cfg.servers[0];
        assert!(server.is_tcp());
        assert_eq!(server.timeout, Some(Duration::from_secs(5)));
        let device = &server.devices[0];
        assert_eq!(device.poll_interval, Some(Duration::from_secs(1)));
        let point = &device.points[0];
        assert_eq!(point.effective_data_type(), DataType::Float32);
        assert_eq!(point.effective_byte_order(), ByteOrder::Abcd);
        // Bit point without data_type decodes as bool.
        assert_eq!(device.points[1].effective_data_type(), DataType::Bool);
        cfg.validate().unwrap();
    }

    #[test]
    fn slave_id_zero_is_rejected() {
        let mut cfg: FleetConfig = serde_yaml::from_str(FLEET_YAML).unwrap();
        cfg.servers[0].devices[0].slave_id = 0;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("slave id 0"), "{}", err);
    }

    #[test]
    fn bit_point_with_data_type_is_rejected() {
        let mut cfg: FleetConfig = serde_yaml::from_str(FLEET_YAML).unwrap();
        cfg.servers[0].devices[0].points[1].data_type = Some(DataType::Uint16);
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("data_type is not supported"), "{}", err);
    }

    #[test]
    fn wide_point_at_end_of_space_is_rejected() {
        let mut cfg: FleetConfig = serde_yaml::from_str(FLEET_YAML).unwrap();
        cfg.servers[0].devices[0].points[0].address = u16::MAX;
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("overflow"), "{}", err);
    }

    #[test]
    fn scale_zero_coerces_to_one() {
        let point = PointConfig {
            name: "x".into(),
            address: 0,
            data_type: None,
            byte_order: None,
            register_type: RegisterKind::Holding,
            scale: 0.0,
            offset: 0.0,
            unit: String::new(),
        };
        assert_eq!(point.effective_scale(), 1.0);
    }

    #[test]
    fn loads_devices_from_csv_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "device_id,vendor,slave_id,poll_interval,point_name,address,register_type,data_type,byte_order,scale,offset,unit").unwrap();
        writeln!(file, "dev-1,acme,3,2s,temp,10,holding,float32,CDAB,0.1,0,C").unwrap();
        writeln!(file, "dev-1,acme,3,2s,state,0,coil,,,,,").unwrap();
        writeln!(file, "dev-2,other,4,,level,20,input,uint16,,1,-5,%").unwrap();
        file.flush().unwrap();

        let devices = load_devices_csv(file.path()).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].device_id, "dev-1");
        assert_eq!(devices[0].slave_id, 3);
        assert_eq!(devices[0].poll_interval, Some(Duration::from_secs(2)));
        assert_eq!(devices[0].points.len(), 2);
        assert_eq!(devices[0].points[0].byte_order, Some(ByteOrder::Cdab));
        assert_eq!(devices[1].points[0].offset, -5.0);
        assert_eq!(devices[1].poll_interval_or_default(), Duration::from_secs(5));
    }

    #[test]
    fn load_resolves_csvfile_servers_relative_to_the_config() {
        let dir = tempfile::tempdir().unwrap();
        let devices_path = dir.path().join("devices.csv");
        std::fs::write(
            &devices_path,
            "device_id,slave_id,point_name,address,register_type\nd1,4,t,0,holding\n",
        )
        .unwrap();

        let config_path = dir.path().join("config.yaml");
        std::fs::write(
            &config_path,
            r#"
servers:
  - server_id: s1
    server_name: One
    protocol: modbus-tcp
    connection: { host: 127.0.0.1, port: 1502 }
    enabled: true
    type: csvfile
    devices_file: devices.csv
"#,
        )
        .unwrap();

        let cfg = FleetConfig::load(&config_path).unwrap();
        let server = &cfg.servers[0];
        assert_eq!(server.devices_type, "csvfile");
        assert_eq!(server.devices.len(), 1);
        assert_eq!(server.devices[0].device_id, "d1");
        assert_eq!(server.devices[0].slave_id, 4);
        assert_eq!(server.devices[0].points[0].register_type, RegisterKind::Holding);
    }

    #[test]
    fn load_rejects_inline_servers_without_devices() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(
            &config_path,
            r#"
servers:
  - server_id: s1
    server_name: One
    protocol: modbus-tcp
    connection: { host: 127.0.0.1, port: 1502 }
    enabled: true
"#,
        )
        .unwrap();

        let err = FleetConfig::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("devices list is empty"), "{}", err);
    }

    #[test]
    fn sim_config_accepts_path_alias() {
        let cfg: SimConfig = toml::from_str(
            r#"
csv_file = "data/series.csv"
update_interval = "1s"

[server]
mode = "rtu"
path = "/dev/ttyUSB0"
baud_rate = 19200
slave_id = 7

[[registers]]
type = "holding"
address = 0
csv_column = "t"
"#,
        )
        .unwrap();
        assert!(cfg.server.is_rtu());
        assert_eq!(cfg.server.serial_port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(cfg.server.slave_id, 7);
        assert_eq!(cfg.update_interval, Duration::from_secs(1));
        cfg.validate().unwrap();
    }

    #[test]
    fn sim_config_rejects_wide_types_on_bits() {
        let parsed: Result<SimConfig, _> = toml::from_str(
            r#"
csv_file = "x.csv"
[[registers]]
type = "coil"
address = 0
csv_column = "c"
data_type = "uint16"
"#,
        );
        let cfg = parsed.unwrap();
        assert!(cfg.validate().is_err());
    }
}
