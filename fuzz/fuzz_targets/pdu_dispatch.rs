//! Fuzz target for the slave engine's PDU dispatch.
//!
//! Malformed requests must come back as well-formed Modbus exceptions,
//! never as panics: bad function codes, truncated bodies, oversized
//! quantities, and byte-count mismatches all land here.

#![no_main]

use libfuzzer_sys::fuzz_target;

use modsim::slave::SlaveEngine;

fuzz_target!(|data: &[u8]| {
    let engine = SlaveEngine::new();
    let response = engine.handle_pdu(data);

    // Every response is either a data response echoing the function code
    // or a two-byte exception with the error bit set.
    assert!(!response.is_empty());
    if response[0] & 0x80 != 0 {
        assert_eq!(response.len(), 2);
        assert!((0x01..=0x03).contains(&response[1]));
    } else if let Some(&function) = data.first() {
        assert_eq!(response[0], function);
    }
});
