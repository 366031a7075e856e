//! modsim: a Modbus simulation and acquisition toolkit.
//!
//! The crate hosts fleets of simulated Modbus slaves (TCP and RTU) whose
//! register spaces are driven by CSV time series, polls real or simulated
//! slaves into engineering-unit readings, and persists those readings to
//! JSONL/CSV files and an embedded SQLite store.
//!
//! Layering, leaves first: [`protocol`] (PDU/CRC/MBAP codec) ->
//! [`registers`] -> [`slave`] -> [`transport`]; [`csvdrive`] and
//! [`fleet`] on the serving side, [`collector`] and [`storage`] on the
//! acquiring side.

pub mod collector;
pub mod config;
pub mod csvdrive;
pub mod error;
pub mod export;
pub mod fleet;
pub mod model;
pub mod protocol;
pub mod registers;
pub mod shutdown;
pub mod sim;
pub mod slave;
pub mod storage;
pub mod transport;
