//! The slave engine: one register space plus the function-code dispatch
//! that turns a request PDU into a response PDU.
//!
//! The engine is transport-agnostic; the TCP and RTU adapters both call
//! [`SlaveEngine::handle_pdu`]. Read handlers copy the addressed window
//! under the shared lock, write handlers apply the whole frame under the
//! exclusive lock. Malformed requests come back as Modbus exceptions and
//! never poison the connection.

use crate::protocol::{
    self, check_range, exception_pdu, pack_bits, parse_range, unpack_bits, ExceptionCode,
};
use crate::registers::{BitBank, RegisterSpace, WordBank};

pub struct SlaveEngine {
    space: RegisterSpace,
}

impl SlaveEngine {
    pub fn new() -> Self {
        Self {
            space: RegisterSpace::new(),
        }
    }

    /// Dispatch one request PDU and produce the response PDU, which is an
    /// exception PDU for any malformed or unsupported request.
    pub fn handle_pdu(&self, pdu: &[u8]) -> Vec<u8> {
        let Some(&function) = pdu.first() else {
            return exception_pdu(0, ExceptionCode::IllegalFunction);
        };
        match self.dispatch(function, &pdu[1..]) {
            Ok(response) => response,
            Err(code) => exception_pdu(function, code),
        }
    }

    fn dispatch(&self, function: u8, body: &[u8]) -> Result<Vec<u8>, ExceptionCode> {
        match function {
            protocol::FN_READ_COILS => self.read_bits(function, BitBank::Coils, body),
            protocol::FN_READ_DISCRETE_INPUTS => {
                self.read_bits(function, BitBank::DiscreteInputs, body)
            }
            protocol::FN_READ_HOLDING_REGISTERS => {
                self.read_words(function, WordBank::Holding, body)
            }
            protocol::FN_READ_INPUT_REGISTERS => self.read_words(function, WordBank::Input, body),
            protocol::FN_WRITE_SINGLE_COIL => self.write_single_coil(function, body),
            protocol::FN_WRITE_SINGLE_REGISTER => self.write_single_register(function, body),
            protocol::FN_WRITE_MULTIPLE_COILS => self.write_multiple_coils(function, body),
            protocol::FN_WRITE_MULTIPLE_REGISTERS => self.write_multiple_registers(function, body),
            _ => Err(ExceptionCode::IllegalFunction),
        }
    }

    fn read_bits(
        &self,
        function: u8,
        bank: BitBank,
        body: &[u8],
    ) -> Result<Vec<u8>, ExceptionCode> {
        let (start, qty) = parse_range(body)?;
        check_range(start, qty, protocol::MAX_READ_BITS)?;
        let data = pack_bits(&self.space.copy_bits(bank, start, qty));
        let mut response = Vec::with_capacity(2 + data.len());
        response.push(function);
        response.push(data.len() as u8);
        response.extend_from_slice(&data);
        Ok(response)
    }

    fn read_words(
        &self,
        function: u8,
        bank: WordBank,
        body: &[u8],
    ) -> Result<Vec<u8>, ExceptionCode> {
        let (start, qty) = parse_range(body)?;
        check_range(start, qty, protocol::MAX_READ_REGISTERS)?;
        let words = self.space.copy_words(bank, start, qty);
        let mut response = Vec::with_capacity(2 + words.len() * 2);
        response.push(function);
        response.push((words.len() * 2) as u8);
        for word in words {
            response.extend_from_slice(&word.to_be_bytes());
        }
        Ok(response)
    }

    fn write_single_coil(&self, function: u8, body: &[u8]) -> Result<Vec<u8>, ExceptionCode> {
        let (address, value) = parse_range(body)?;
        let state = match value {
            0xFF00 => true,
            0x0000 => false,
            _ => return Err(ExceptionCode::IllegalDataValue),
        };
        self.space.set_coil(address, state);
        Ok(echo_response(function, body))
    }

    fn write_single_register(&self, function: u8, body: &[u8]) -> Result<Vec<u8>, ExceptionCode> {
        let (address, value) = parse_range(body)?;
        self.space.set_holding(address, value);
        Ok(echo_response(function, body))
    }

    fn write_multiple_coils(&self, function: u8, body: &[u8]) -> Result<Vec<u8>, ExceptionCode> {
        let (start, qty) = parse_range(body)?;
        check_range(start, qty, protocol::MAX_WRITE_BITS)?;
        let byte_count = (qty as usize + 7) / 8;
        if body.len() < 5 || body[4] as usize != byte_count || body.len() != 5 + byte_count {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let values = unpack_bits(&body[5..], qty);
        self.space.write_coils(start, &values);
        Ok(write_multiple_response(function, start, qty))
    }

    fn write_multiple_registers(
        &self,
        function: u8,
        body: &[u8],
    ) -> Result<Vec<u8>, ExceptionCode> {
        let (start, qty) = parse_range(body)?;
        check_range(start, qty, protocol::MAX_WRITE_REGISTERS)?;
        let byte_count = qty as usize * 2;
        if body.len() < 5 || body[4] as usize != byte_count || body.len() != 5 + byte_count {
            return Err(ExceptionCode::IllegalDataValue);
        }
        let words: Vec<u16> = body[5..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        self.space.write_holding(start, &words);
        Ok(write_multiple_response(function, start, qty))
    }

    // Typed accessors for the fleet manager, CSV driver, and snapshots.

    pub fn set_holding(&self, address: u16, value: u16) {
        self.space.set_holding(address, value);
    }

    pub fn set_input(&self, address: u16, value: u16) {
        self.space.set_input(address, value);
    }

    pub fn set_coil(&self, address: u16, value: bool) {
        self.space.set_coil(address, value);
    }

    pub fn set_discrete_input(&self, address: u16, value: bool) {
        self.space.set_discrete_input(address, value);
    }

    pub fn get_holding(&self, address: u16) -> u16 {
        self.space.get_holding(address)
    }

    pub fn get_input(&self, address: u16) -> u16 {
        self.space.get_input(address)
    }

    pub fn get_coil(&self, address: u16) -> bool {
        self.space.get_coil(address)
    }

    pub fn get_discrete_input(&self, address: u16) -> bool {
        self.space.get_discrete_input(address)
    }
}

impl Default for SlaveEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn echo_response(function: u8, body: &[u8]) -> Vec<u8> {
    let mut response = Vec::with_capacity(5);
    response.push(function);
    response.extend_from_slice(&body[..4]);
    response
}

fn write_multiple_response(function: u8, start: u16, qty: u16) -> Vec<u8> {
    let mut response = Vec::with_capacity(5);
    response.push(function);
    response.extend_from_slice(&start.to_be_bytes());
    response.extend_from_slice(&qty.to_be_bytes());
    response
}
