//! Modbus protocol engine: PDU grammar, exception coding, and the two
//! framings (MBAP for TCP, address + CRC-16 for RTU) that share it.
//!
//! Everything in this module is pure byte manipulation; transports live
//! in `crate::transport` and the register-space dispatch in `crate::slave`.

pub mod crc;
pub mod mbap;

/// Read Coils (FC01)
pub const FN_READ_COILS: u8 = 0x01;
/// Read Discrete Inputs (FC02)
pub const FN_READ_DISCRETE_INPUTS: u8 = 0x02;
/// Read Holding Registers (FC03)
pub const FN_READ_HOLDING_REGISTERS: u8 = 0x03;
/// Read Input Registers (FC04)
pub const FN_READ_INPUT_REGISTERS: u8 = 0x04;
/// Write Single Coil (FC05)
pub const FN_WRITE_SINGLE_COIL: u8 = 0x05;
/// Write Single Register (FC06)
pub const FN_WRITE_SINGLE_REGISTER: u8 = 0x06;
/// Write Multiple Coils (FC15)
pub const FN_WRITE_MULTIPLE_COILS: u8 = 0x0F;
/// Write Multiple Registers (FC16)
pub const FN_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Maximum quantity for FC01/FC02 per the Modbus specification.
pub const MAX_READ_BITS: u16 = 2000;
/// Maximum quantity for FC03/FC04.
pub const MAX_READ_REGISTERS: u16 = 125;
/// Maximum quantity for FC15.
pub const MAX_WRITE_BITS: u16 = 1968;
/// Maximum quantity for FC16.
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Register space size shared by all four banks.
pub const REGISTER_SPACE: usize = 65_536;

/// Modbus exception codes produced by the slave engine.
///
/// On the wire the function byte is OR'd with 0x80 and followed by the
/// exception code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
}

impl ExceptionCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExceptionCode::IllegalFunction => "illegal function",
            ExceptionCode::IllegalDataAddress => "illegal data address",
            ExceptionCode::IllegalDataValue => "illegal data value",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Build an exception response PDU for the given request function code.
pub fn exception_pdu(function: u8, code: ExceptionCode) -> Vec<u8> {
    // An unreadable function byte still needs the error bit set.
    let function = if function == 0 { 0x80 } else { function | 0x80 };
    vec![function, code.as_u8()]
}

/// Parse the `start(2) | qty(2)` body shared by all read requests and the
/// write-multiple header. Returns IllegalDataValue on a short body.
pub fn parse_range(body: &[u8]) -> Result<(u16, u16), ExceptionCode> {
    if body.len() < 4 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let start = u16::from_be_bytes([body[0], body[1]]);
    let qty = u16::from_be_bytes([body[2], body[3]]);
    Ok((start, qty))
}

/// Validate a quantity against its function-specific bound and check that
/// the addressed window fits in the register space.
pub fn check_range(start: u16, qty: u16, max_qty: u16) -> Result<(), ExceptionCode> {
    if qty == 0 || qty > max_qty {
        return Err(ExceptionCode::IllegalDataValue);
    }
    if start as usize + qty as usize > REGISTER_SPACE {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(())
}

/// Pack a bit window into the on-wire byte layout (LSB first within each
/// byte, as read responses require).
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; (bits.len() + 7) / 8];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

/// Unpack `qty` bits from a write-multiple-coils payload.
pub fn unpack_bits(payload: &[u8], qty: u16) -> Vec<bool> {
    (0..qty as usize)
        .map(|i| (payload[i / 8] >> (i % 8)) & 0x01 == 0x01)
        .collect()
}

/// Assemble an RTU frame: `address | PDU | crc16-le`.
pub fn encode_rtu_frame(address: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pdu.len() + 3);
    frame.push(address);
    frame.extend_from_slice(pdu);
    let checksum = crc::crc16(&frame);
    frame.extend_from_slice(&checksum.to_le_bytes());
    frame
}

/// Verify the trailing CRC of an RTU frame and split it into address and
/// PDU. Returns `None` when the frame is too short or the CRC does not
/// match; such frames are silently dropped by the stream handler.
pub fn decode_rtu_frame(frame: &[u8]) -> Option<(u8, &[u8])> {
    if frame.len() < 4 {
        return None;
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    if crc::crc16(body) != received {
        return None;
    }
    Some((body[0], &body[1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_pdu_sets_error_bit() {
        assert_eq!(
            exception_pdu(FN_READ_HOLDING_REGISTERS, ExceptionCode::IllegalDataAddress),
            vec![0x83, 0x02]
        );
        // Unparseable function byte maps to bare 0x80.
        assert_eq!(exception_pdu(0, ExceptionCode::IllegalFunction), vec![0x80, 0x01]);
    }

    #[test]
    fn range_bounds() {
        assert!(check_range(0, 2000, MAX_READ_BITS).is_ok());
        assert_eq!(
            check_range(0, 2001, MAX_READ_BITS),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(check_range(0, 0, MAX_READ_BITS), Err(ExceptionCode::IllegalDataValue));
        assert!(check_range(65_533, 3, MAX_READ_REGISTERS).is_ok());
        assert_eq!(
            check_range(65_534, 3, MAX_READ_REGISTERS),
            Err(ExceptionCode::IllegalDataAddress)
        );
    }

    #[test]
    fn bit_packing_round_trip() {
        let bits = [true, false, true, true, false, false, false, false, true];
        let packed = pack_bits(&bits);
        assert_eq!(packed, vec![0x0D, 0x01]);
        assert_eq!(unpack_bits(&packed, 9), bits);
    }

    #[test]
    fn rtu_frame_round_trip() {
        let frame = encode_rtu_frame(1, &[0x03, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(frame[frame.len() - 2..], [0xC5, 0xCD]);
        let (addr, pdu) = decode_rtu_frame(&frame).expect("valid frame");
        assert_eq!(addr, 1);
        assert_eq!(pdu, [0x03, 0x00, 0x00, 0x00, 0x0A]);
    }

    #[test]
    fn rtu_frame_rejects_bad_crc() {
        let mut frame = encode_rtu_frame(1, &[0x03, 0x00, 0x00, 0x00, 0x0A]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(decode_rtu_frame(&frame).is_none());
    }
}
