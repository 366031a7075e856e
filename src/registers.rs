//! In-memory Modbus register space.
//!
//! Four dense 65 536-entry banks behind a single reader-writer lock.
//! Readers (transport handlers, snapshots) take the shared lock; writers
//! (the CSV driver and write-function handlers) take the exclusive lock,
//! so reads and writes are linearizable and each write frame is applied
//! atomically.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

use crate::protocol::REGISTER_SPACE;

/// The two single-bit banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitBank {
    Coils,
    DiscreteInputs,
}

/// The two 16-bit banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordBank {
    Holding,
    Input,
}

struct Banks {
    coils: Box<[bool]>,
    discrete_inputs: Box<[bool]>,
    holding: Box<[u16]>,
    input: Box<[u16]>,
}

impl Banks {
    fn bits(&self, bank: BitBank) -> &[bool] {
        match bank {
            BitBank::Coils => &self.coils,
            BitBank::DiscreteInputs => &self.discrete_inputs,
        }
    }

    fn words(&self, bank: WordBank) -> &[u16] {
        match bank {
            WordBank::Holding => &self.holding,
            WordBank::Input => &self.input,
        }
    }
}

pub struct RegisterSpace {
    banks: RwLock<Banks>,
}

impl RegisterSpace {
    pub fn new() -> Self {
        Self {
            banks: RwLock::new(Banks {
                coils: vec![false; REGISTER_SPACE].into_boxed_slice(),
                discrete_inputs: vec![false; REGISTER_SPACE].into_boxed_slice(),
                holding: vec![0; REGISTER_SPACE].into_boxed_slice(),
                input: vec![0; REGISTER_SPACE].into_boxed_slice(),
            }),
        }
    }

    /// Shared lock. A poisoned lock means a holder panicked; the banks
    /// are plain arrays so the state is still usable, but the recovery
    /// is loud.
    fn read_banks(&self) -> RwLockReadGuard<'_, Banks> {
        self.banks.read().unwrap_or_else(|poisoned| {
            warn!("register space lock poisoned, continuing with recovered state");
            poisoned.into_inner()
        })
    }

    /// Exclusive lock, with the same loud poison recovery.
    fn write_banks(&self) -> RwLockWriteGuard<'_, Banks> {
        self.banks.write().unwrap_or_else(|poisoned| {
            warn!("register space lock poisoned, continuing with recovered state");
            poisoned.into_inner()
        })
    }

    /// Copy a bit window under the shared lock. The caller has already
    /// range-checked `start + qty <= 65536`.
    pub fn copy_bits(&self, bank: BitBank, start: u16, qty: u16) -> Vec<bool> {
        let banks = self.read_banks();
        banks.bits(bank)[start as usize..start as usize + qty as usize].to_vec()
    }

    /// Copy a word window under the shared lock.
    pub fn copy_words(&self, bank: WordBank, start: u16, qty: u16) -> Vec<u16> {
        let banks = self.read_banks();
        banks.words(bank)[start as usize..start as usize + qty as usize].to_vec()
    }

    /// Write a coil run atomically (FC15, and FC05 with a single value).
    pub fn write_coils(&self, start: u16, values: &[bool]) {
        let mut banks = self.write_banks();
        banks.coils[start as usize..start as usize + values.len()].copy_from_slice(values);
    }

    /// Write a holding-register run atomically (FC16, and FC06 with a
    /// single value).
    pub fn write_holding(&self, start: u16, values: &[u16]) {
        let mut banks = self.write_banks();
        banks.holding[start as usize..start as usize + values.len()].copy_from_slice(values);
    }

    pub fn set_coil(&self, address: u16, value: bool) {
        self.write_banks().coils[address as usize] = value;
    }

    pub fn set_discrete_input(&self, address: u16, value: bool) {
        self.write_banks().discrete_inputs[address as usize] = value;
    }

    pub fn set_holding(&self, address: u16, value: u16) {
        self.write_banks().holding[address as usize] = value;
    }

    pub fn set_input(&self, address: u16, value: u16) {
        self.write_banks().input[address as usize] = value;
    }

    pub fn get_coil(&self, address: u16) -> bool {
        self.read_banks().coils[address as usize]
    }

    pub fn get_discrete_input(&self, address: u16) -> bool {
        self.read_banks().discrete_inputs[address as usize]
    }

    pub fn get_holding(&self, address: u16) -> u16 {
        self.read_banks().holding[address as usize]
    }

    pub fn get_input(&self, address: u16) -> u16 {
        self.read_banks().input[address as usize]
    }
}

impl Default for RegisterSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_address_range_is_usable() {
        let space = RegisterSpace::new();
        space.set_holding(0, 1);
        space.set_holding(65_535, 0xABCD);
        assert_eq!(space.get_holding(0), 1);
        assert_eq!(space.get_holding(65_535), 0xABCD);
        space.set_coil(65_535, true);
        assert!(space.get_coil(65_535));
    }

    #[test]
    fn window_copies_reflect_writes() {
        let space = RegisterSpace::new();
        space.write_holding(100, &[1, 2, 0xABCD]);
        assert_eq!(space.copy_words(WordBank::Holding, 100, 3), vec![1, 2, 0xABCD]);
        space.write_coils(10, &[true, false, true]);
        assert_eq!(
            space.copy_bits(BitBank::Coils, 10, 3),
            vec![true, false, true]
        );
        // Input and discrete banks are independent of their writable twins.
        assert_eq!(space.copy_words(WordBank::Input, 100, 3), vec![0, 0, 0]);
        assert_eq!(
            space.copy_bits(BitBank::DiscreteInputs, 10, 3),
            vec![false, false, false]
        );
    }
}
