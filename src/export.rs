//! Snapshot export: pretty JSON and flat CSV views of the fleet's
//! current register values.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::SecondsFormat;

use crate::model::ServerSnapshot;

pub fn write_snapshot_json(path: &Path, snapshots: &[ServerSnapshot]) -> Result<()> {
    let body = serde_json::to_vec_pretty(snapshots).context("marshal snapshot json")?;
    std::fs::write(path, body).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

pub fn write_snapshot_csv(path: &Path, snapshots: &[ServerSnapshot]) -> Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("create {}", path.display()))?;
    writer.write_record([
        "server_id",
        "server_name",
        "address",
        "device_id",
        "point_name",
        "register_type",
        "address_idx",
        "unit",
        "value_uint16",
        "value_bool",
        "timestamp",
    ])?;

    for server in snapshots {
        for device in &server.devices {
            for point in &device.points {
                let record: [String; 11] = [
                    server.server_id.clone(),
                    server.server_name.clone(),
                    server.address.clone(),
                    device.device_id.clone(),
                    point.name.clone(),
                    point.register_type.as_str().to_string(),
                    point.address.to_string(),
                    point.unit.clone(),
                    point.value_uint16.map(|v| v.to_string()).unwrap_or_default(),
                    point
                        .value_bool
                        .map(|v| if v { "1" } else { "0" }.to_string())
                        .unwrap_or_default(),
                    point.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
                ];
                writer.write_record(&record)?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}
