//! RTU stream handler.
//!
//! Serves Modbus RTU frames on any full-duplex byte stream. The reader is
//! length-aware by function code: functions 0x01-0x06 are fixed 8-byte
//! frames, 0x0F/0x10 carry a byte count after the 5-byte header. Frames
//! addressed to a different slave id and frames with a bad CRC are
//! silently dropped; the timing gaps of real RS-485 are not enforced,
//! which is what makes the same handler work over a pty or raw TCP.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::error::SimError;
use crate::protocol::{self, crc::crc16};
use crate::shutdown::{self, ShutdownRx};
use crate::slave::SlaveEngine;

/// Serve RTU requests on `stream` until it closes, an unrecoverable frame
/// arrives, or shutdown is signalled. Stream failures surface as
/// [`SimError::Transport`].
pub async fn serve_stream<S>(
    mut stream: S,
    slave_id: u8,
    engine: Arc<SlaveEngine>,
    mut shutdown: ShutdownRx,
) -> Result<(), SimError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => {
                if shutdown::is_shutdown(&shutdown) {
                    return Ok(());
                }
                continue;
            }
            frame = read_frame(&mut stream) => frame?,
        };

        let Some(frame) = frame else {
            // Unknown function code: frame length is unknowable, so the
            // stream cannot be resynchronized.
            debug!("unknown function code on rtu stream, closing");
            return Ok(());
        };

        let Some((address, pdu)) = protocol::decode_rtu_frame(&frame) else {
            trace!("dropping rtu frame with bad crc");
            continue;
        };
        if address != slave_id {
            trace!(address, slave_id, "dropping rtu frame for other slave");
            continue;
        }

        let response = engine.handle_pdu(pdu);
        let out = protocol::encode_rtu_frame(address, &response);
        stream.write_all(&out).await?;
    }
}

/// Read one raw frame (including CRC). Returns `Ok(None)` when the
/// function code is unknown and the frame length cannot be derived.
async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 2];
    reader.read_exact(&mut head).await?;
    let function = head[1];

    match function {
        0x01..=0x06 => {
            // address + fn + start/addr(2) + qty/value(2) + crc(2)
            let mut rest = [0u8; 6];
            reader.read_exact(&mut rest).await?;
            let mut frame = Vec::with_capacity(8);
            frame.extend_from_slice(&head);
            frame.extend_from_slice(&rest);
            Ok(Some(frame))
        }
        0x0F | 0x10 => {
            // start(2) + qty(2) + byteCount(1), then payload + crc(2)
            let mut header = [0u8; 5];
            reader.read_exact(&mut header).await?;
            let byte_count = header[4] as usize;
            let mut tail = vec![0u8; byte_count + 2];
            reader.read_exact(&mut tail).await?;
            let mut frame = Vec::with_capacity(9 + byte_count);
            frame.extend_from_slice(&head);
            frame.extend_from_slice(&header);
            frame.extend_from_slice(&tail);
            Ok(Some(frame))
        }
        _ => Ok(None),
    }
}
