//! Shared value types: point descriptors, decoded readings, and fleet
//! snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which of the four register banks a point lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    Holding,
    Input,
    Coil,
    Discrete,
}

impl RegisterKind {
    pub fn is_bit(self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::Discrete)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RegisterKind::Holding => "holding",
            RegisterKind::Input => "input",
            RegisterKind::Coil => "coil",
            RegisterKind::Discrete => "discrete",
        }
    }
}

impl std::fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared data type of a numeric point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Uint16,
    Int16,
    Uint32,
    Int32,
    Float32,
    Bool,
}

impl DataType {
    /// Number of 16-bit registers the type occupies.
    pub fn register_count(self) -> u16 {
        match self {
            DataType::Uint32 | DataType::Int32 | DataType::Float32 => 2,
            _ => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Uint16 => "uint16",
            DataType::Int16 => "int16",
            DataType::Uint32 => "uint32",
            DataType::Int32 => "int32",
            DataType::Float32 => "float32",
            DataType::Bool => "bool",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte permutation applied to a four-byte value before big-endian
/// interpretation. ABCD is the identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ByteOrder {
    #[default]
    Abcd,
    Dcba,
    Badc,
    Cdab,
}

impl ByteOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            ByteOrder::Abcd => "ABCD",
            ByteOrder::Dcba => "DCBA",
            ByteOrder::Badc => "BADC",
            ByteOrder::Cdab => "CDAB",
        }
    }
}

impl std::fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The originally-typed value of a reading, before scale/offset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RawValue {
    Bool(bool),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
}

impl RawValue {
    pub fn as_f64(self) -> f64 {
        match self {
            RawValue::Bool(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            }
            RawValue::U16(v) => v as f64,
            RawValue::I16(v) => v as f64,
            RawValue::U32(v) => v as f64,
            RawValue::I32(v) => v as f64,
            RawValue::F32(v) => v as f64,
        }
    }
}

/// A decoded reading emitted by the collector into the handler pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PointValue {
    pub timestamp: DateTime<Utc>,
    pub server_id: String,
    pub device_id: String,
    pub connection: String,
    pub slave_id: u8,
    pub point_name: String,
    pub address: u16,
    pub register: RegisterKind,
    pub data_type: DataType,
    pub byte_order: ByteOrder,
    pub unit: String,
    pub raw: RawValue,
    pub scale: f64,
    pub offset: f64,
    pub value: f64,
}

impl PointValue {
    /// Cache key for the storage dedup map.
    pub fn dedup_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.device_id, self.point_name, self.register, self.server_id
        )
    }
}

/// A single point's current value inside a fleet snapshot. Exactly one of
/// the two value fields is populated, depending on the register kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointSnapshot {
    pub name: String,
    pub register_type: RegisterKind,
    pub address: u16,
    #[serde(default)]
    pub unit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_uint16: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_bool: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device_id: String,
    #[serde(default)]
    pub vendor: String,
    pub slave_id: u8,
    pub points: Vec<PointSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSnapshot {
    pub server_id: String,
    pub server_name: String,
    pub address: String,
    pub devices: Vec<DeviceSnapshot>,
    pub timestamp: DateTime<Utc>,
}
