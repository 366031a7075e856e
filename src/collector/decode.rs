//! Pure point decoding: `(register words, declared type, byte order)`
//! to `(typed raw value, f64)`.
//!
//! Registers arrive as big-endian 16-bit words. 32-bit types concatenate
//! two words into four bytes, permute them per the declared byte order
//! (ABCD is the identity, DCBA full reverse, BADC swaps within words,
//! CDAB swaps the words), and interpret the result big-endian.

use crate::error::SimError;
use crate::model::{ByteOrder, DataType, RawValue};

/// Reorder four bytes per the declared byte order.
pub fn reorder32(bytes: [u8; 4], order: ByteOrder) -> [u8; 4] {
    let [a, b, c, d] = bytes;
    match order {
        ByteOrder::Abcd => [a, b, c, d],
        ByteOrder::Dcba => [d, c, b, a],
        ByteOrder::Badc => [b, a, d, c],
        ByteOrder::Cdab => [c, d, a, b],
    }
}

/// Decode a register read into its typed raw value and f64 projection
/// (before scale/offset).
pub fn decode_words(
    words: &[u16],
    data_type: DataType,
    order: ByteOrder,
) -> Result<(RawValue, f64), SimError> {
    match data_type {
        DataType::Uint16 => {
            let word = single_word(words, data_type)?;
            Ok((RawValue::U16(word), word as f64))
        }
        DataType::Int16 => {
            let value = single_word(words, data_type)? as i16;
            Ok((RawValue::I16(value), value as f64))
        }
        DataType::Uint32 => {
            let value = u32::from_be_bytes(wide_bytes(words, data_type, order)?);
            Ok((RawValue::U32(value), value as f64))
        }
        DataType::Int32 => {
            let value = u32::from_be_bytes(wide_bytes(words, data_type, order)?) as i32;
            Ok((RawValue::I32(value), value as f64))
        }
        DataType::Float32 => {
            let value = f32::from_be_bytes(wide_bytes(words, data_type, order)?);
            Ok((RawValue::F32(value), value as f64))
        }
        DataType::Bool => Err(SimError::Decode(
            "bool points decode from bit reads, not register words".to_string(),
        )),
    }
}

/// Decode a coil or discrete-input read: the first returned bit.
pub fn decode_bits(bits: &[bool]) -> (RawValue, f64) {
    let value = bits.first().copied().unwrap_or(false);
    (RawValue::Bool(value), if value { 1.0 } else { 0.0 })
}

fn single_word(words: &[u16], data_type: DataType) -> Result<u16, SimError> {
    words
        .first()
        .copied()
        .ok_or_else(|| SimError::Decode(format!("insufficient data for {}", data_type)))
}

fn wide_bytes(words: &[u16], data_type: DataType, order: ByteOrder) -> Result<[u8; 4], SimError> {
    if words.len() < 2 {
        return Err(SimError::Decode(format!("insufficient data for {}", data_type)));
    }
    let hi = words[0].to_be_bytes();
    let lo = words[1].to_be_bytes();
    Ok(reorder32([hi[0], hi[1], lo[0], lo[1]], order))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reorder_permutations() {
        let bytes = [0x12, 0x34, 0x56, 0x78];
        assert_eq!(reorder32(bytes, ByteOrder::Abcd), [0x12, 0x34, 0x56, 0x78]);
        assert_eq!(reorder32(bytes, ByteOrder::Dcba), [0x78, 0x56, 0x34, 0x12]);
        assert_eq!(reorder32(bytes, ByteOrder::Badc), [0x34, 0x12, 0x78, 0x56]);
        assert_eq!(reorder32(bytes, ByteOrder::Cdab), [0x56, 0x78, 0x12, 0x34]);
    }

    #[test]
    fn dcba_and_badc_are_involutions_and_cdab_twice_is_identity() {
        let bytes = [0xDE, 0xAD, 0xBE, 0xEF];
        for order in [ByteOrder::Dcba, ByteOrder::Badc, ByteOrder::Cdab] {
            assert_eq!(reorder32(reorder32(bytes, order), order), bytes);
        }
    }

    #[test]
    fn decodes_float32_pi() {
        let (raw, value) = decode_words(&[0x4049, 0x0FDB], DataType::Float32, ByteOrder::Abcd)
            .unwrap();
        assert!(matches!(raw, RawValue::F32(_)));
        assert!((value - std::f64::consts::PI).abs() < 1e-6);
    }

    #[test]
    fn decodes_float32_word_swapped() {
        // Same value stored CDAB: words arrive swapped.
        let (_, value) = decode_words(&[0x0FDB, 0x4049], DataType::Float32, ByteOrder::Cdab)
            .unwrap();
        assert!((value - std::f64::consts::PI).abs() < 1e-6);
    }

    #[test]
    fn decodes_signed_types() {
        let (raw, value) = decode_words(&[0xFFFE], DataType::Int16, ByteOrder::Abcd).unwrap();
        assert_eq!(raw, RawValue::I16(-2));
        assert_eq!(value, -2.0);

        let (raw, value) =
            decode_words(&[0xFFFF, 0xFFFE], DataType::Int32, ByteOrder::Abcd).unwrap();
        assert_eq!(raw, RawValue::I32(-2));
        assert_eq!(value, -2.0);
    }

    #[test]
    fn decodes_uint32() {
        let (raw, value) =
            decode_words(&[0x0001, 0x0000], DataType::Uint32, ByteOrder::Abcd).unwrap();
        assert_eq!(raw, RawValue::U32(65_536));
        assert_eq!(value, 65_536.0);
    }

    #[test]
    fn insufficient_words_is_a_decode_error() {
        assert!(decode_words(&[], DataType::Uint16, ByteOrder::Abcd).is_err());
        assert!(decode_words(&[1], DataType::Float32, ByteOrder::Abcd).is_err());
    }

    #[test]
    fn bits_decode_first_lsb() {
        assert_eq!(decode_bits(&[true, false]), (RawValue::Bool(true), 1.0));
        assert_eq!(decode_bits(&[]), (RawValue::Bool(false), 0.0));
    }
}
