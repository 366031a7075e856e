//! MBAP framing for Modbus TCP.
//!
//! Every request and response is prefixed with a 7-byte header:
//! `transaction(2) | protocol(2) | length(2) | unit(1)`, where `length`
//! counts the unit id plus the PDU. Responses echo the transaction id and
//! always carry protocol id 0. The unit id is not validated: each
//! listener owns a single register space, so distinct listeners are
//! distinct slaves.

/// MBAP header length in bytes.
pub const HEADER_LEN: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Unit id + PDU byte count.
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Self {
        Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        }
    }

    /// Header for the response to this request: same transaction and unit
    /// id, protocol id forced to 0, length recomputed from the PDU.
    pub fn response(&self, pdu_len: usize) -> Self {
        Self {
            transaction_id: self.transaction_id,
            protocol_id: 0,
            length: (pdu_len + 1) as u16,
            unit_id: self.unit_id,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..2].copy_from_slice(&self.transaction_id.to_be_bytes());
        out[2..4].copy_from_slice(&self.protocol_id.to_be_bytes());
        out[4..6].copy_from_slice(&self.length.to_be_bytes());
        out[6] = self.unit_id;
        out
    }

    /// PDU byte count announced by this header.
    pub fn pdu_len(&self) -> usize {
        (self.length as usize).saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_encode_round_trip() {
        let raw = [0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x11];
        let header = MbapHeader::parse(&raw);
        assert_eq!(header.transaction_id, 0x1234);
        assert_eq!(header.protocol_id, 0);
        assert_eq!(header.length, 6);
        assert_eq!(header.unit_id, 0x11);
        assert_eq!(header.pdu_len(), 5);
        assert_eq!(header.encode(), raw);
    }

    #[test]
    fn response_echoes_transaction_and_resets_protocol() {
        let request = MbapHeader {
            transaction_id: 0xBEEF,
            protocol_id: 7,
            length: 6,
            unit_id: 3,
        };
        let response = request.response(8);
        assert_eq!(response.transaction_id, 0xBEEF);
        assert_eq!(response.protocol_id, 0);
        assert_eq!(response.length, 9);
        assert_eq!(response.unit_id, 3);
    }
}
