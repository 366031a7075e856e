//! Transport adapters binding the slave engine to the outside world.
//!
//! Both adapters are thin shells around [`crate::slave::SlaveEngine::handle_pdu`]:
//! TCP speaks MBAP-framed Modbus, the RTU handler speaks address + PDU +
//! CRC over any full-duplex byte stream (a serial port, a pty created by
//! an external pairing tool, or a raw TCP socket).

pub mod rtu;
pub mod tcp;

use anyhow::{Context, Result};
use tokio_serial::SerialPortBuilderExt;

use crate::config::SerialSettings;

/// Open a serial port with the configured parameters, applying the usual
/// defaults (9600 8N1).
pub fn open_serial(settings: &SerialSettings) -> Result<tokio_serial::SerialStream> {
    let baud = if settings.baud_rate == 0 { 9600 } else { settings.baud_rate };

    let data_bits = match settings.data_bits {
        0 | 8 => tokio_serial::DataBits::Eight,
        7 => tokio_serial::DataBits::Seven,
        6 => tokio_serial::DataBits::Six,
        5 => tokio_serial::DataBits::Five,
        other => anyhow::bail!("unsupported data_bits {}", other),
    };
    let stop_bits = match settings.stop_bits {
        0 | 1 => tokio_serial::StopBits::One,
        2 => tokio_serial::StopBits::Two,
        other => anyhow::bail!("unsupported stop_bits {}", other),
    };
    let parity = match settings.parity.to_ascii_uppercase().as_str() {
        "" | "N" => tokio_serial::Parity::None,
        "E" => tokio_serial::Parity::Even,
        "O" => tokio_serial::Parity::Odd,
        other => anyhow::bail!("unsupported parity {:?}", other),
    };

    tokio_serial::new(&settings.port, baud)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity)
        .open_native_async()
        .with_context(|| format!("open serial port {}", settings.port))
}
