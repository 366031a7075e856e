//! CSV-driven register updates.
//!
//! A [`CsvTable`] is a finite, restartable sequence of numeric rows; a
//! [`CsvDriver`] binds one table to one slave engine and, on every tick,
//! projects the current row into register space through per-point
//! scale/offset and data-type transforms. The cursor cycles modulo the
//! row count.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use crate::model::{DataType, RegisterKind};
use crate::shutdown::{self, ShutdownRx};
use crate::slave::SlaveEngine;

/// A loaded CSV file: header row of column names, body rows of f64.
pub struct CsvTable {
    columns: HashMap<String, usize>,
    rows: Vec<Vec<f64>>,
}

impl CsvTable {
    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .with_context(|| format!("open csv {}", path.display()))?;

        let columns: HashMap<String, usize> = reader
            .headers()
            .context("read csv header")?
            .iter()
            .enumerate()
            .map(|(i, name)| (name.trim().to_string(), i))
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.context("read csv row")?;
            if record.len() != columns.len() {
                bail!("csv record length mismatch");
            }
            let mut row = Vec::with_capacity(record.len());
            for (i, raw) in record.iter().enumerate() {
                let raw = raw.trim();
                if raw.is_empty() {
                    bail!("empty value in csv column {}", i);
                }
                let value: f64 = raw
                    .parse()
                    .with_context(|| format!("invalid value {:?} in csv column {}", raw, i))?;
                row.push(value);
            }
            rows.push(row);
        }
        if rows.is_empty() {
            bail!("csv must contain a header and at least one data row");
        }
        Ok(Self { columns, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn value(&self, row: usize, column: &str) -> Option<f64> {
        let &col = self.columns.get(column)?;
        self.rows.get(row).map(|r| r[col])
    }
}

/// One register target fed from a CSV column.
#[derive(Debug, Clone)]
pub struct PointBinding {
    pub column: String,
    pub kind: RegisterKind,
    pub address: u16,
    pub data_type: DataType,
    pub scale: f64,
    pub offset: f64,
}

impl PointBinding {
    pub fn new(
        column: impl Into<String>,
        kind: RegisterKind,
        address: u16,
        data_type: Option<DataType>,
        scale: f64,
        offset: f64,
    ) -> Self {
        Self {
            column: column.into(),
            kind,
            address,
            data_type: if kind.is_bit() {
                DataType::Bool
            } else {
                data_type.unwrap_or(DataType::Uint16)
            },
            // A zero scale would zero out every sample; coerce to identity.
            scale: if scale == 0.0 { 1.0 } else { scale },
            offset,
        }
    }
}

/// Drives one slave engine from one CSV table.
pub struct CsvDriver {
    table: CsvTable,
    bindings: Vec<PointBinding>,
    engine: Arc<SlaveEngine>,
    period: Duration,
}

impl CsvDriver {
    pub fn new(
        table: CsvTable,
        bindings: Vec<PointBinding>,
        engine: Arc<SlaveEngine>,
        period: Duration,
    ) -> Self {
        Self {
            table,
            bindings,
            engine,
            period,
        }
    }

    /// Write row `index` into the register space. Per-point failures are
    /// logged and skipped; the row as a whole always completes.
    pub fn apply_row(&self, index: usize) {
        for binding in &self.bindings {
            let Some(raw) = self.table.value(index, &binding.column) else {
                warn!(column = %binding.column, "csv column not found, skipping point");
                continue;
            };
            let scaled = raw * binding.scale + binding.offset;
            if let Err(e) = write_point(&self.engine, binding, scaled) {
                warn!(
                    column = %binding.column,
                    address = binding.address,
                    "cannot write csv value: {}",
                    e
                );
            }
        }
    }

    /// Apply row 0 immediately, then advance the cursor on every tick
    /// until shutdown. The row sequence cycles modulo the table length.
    pub async fn run(self, mut shutdown: ShutdownRx) {
        self.apply_row(0);

        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // completes immediately

        let mut index = 0usize;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if shutdown::is_shutdown(&shutdown) {
                        debug!("csv driver stopping");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    index = (index + 1) % self.table.len();
                    self.apply_row(index);
                }
            }
        }
    }
}

fn write_point(engine: &SlaveEngine, binding: &PointBinding, scaled: f64) -> Result<()> {
    match binding.kind {
        RegisterKind::Coil => {
            engine.set_coil(binding.address, scaled > 0.0);
            Ok(())
        }
        RegisterKind::Discrete => {
            engine.set_discrete_input(binding.address, scaled > 0.0);
            Ok(())
        }
        RegisterKind::Holding | RegisterKind::Input => {
            write_numeric(engine, binding, scaled)
        }
    }
}

fn write_numeric(engine: &SlaveEngine, binding: &PointBinding, scaled: f64) -> Result<()> {
    let set_word = |address: u16, word: u16| match binding.kind {
        RegisterKind::Holding => engine.set_holding(address, word),
        RegisterKind::Input => engine.set_input(address, word),
        _ => unreachable!("bit kinds handled by caller"),
    };

    match binding.data_type {
        DataType::Uint16 => {
            set_word(binding.address, float_to_uint16(scaled)?);
            Ok(())
        }
        DataType::Int16 => {
            set_word(binding.address, float_to_int16(scaled)?);
            Ok(())
        }
        DataType::Float32 => {
            if binding.address == u16::MAX {
                bail!("address {} out of range for float32", binding.address);
            }
            let (hi, lo) = float_to_words(scaled)?;
            set_word(binding.address, hi);
            set_word(binding.address + 1, lo);
            Ok(())
        }
        other => bail!("unsupported data type {} for csv-driven register", other),
    }
}

fn float_to_uint16(value: f64) -> Result<u16> {
    if value.is_nan() || value.is_infinite() {
        bail!("invalid uint16 value");
    }
    let rounded = value.round();
    if !(0.0..=65_535.0).contains(&rounded) {
        bail!("value {} out of range for uint16", value);
    }
    Ok(rounded as u16)
}

fn float_to_int16(value: f64) -> Result<u16> {
    if value.is_nan() || value.is_infinite() {
        bail!("invalid int16 value");
    }
    let rounded = value.round();
    if !(-32_768.0..=32_767.0).contains(&rounded) {
        bail!("value {} out of range for int16", value);
    }
    Ok(rounded as i16 as u16)
}

/// Split a value into the two big-endian words of its float32 encoding:
/// high word first, low word second.
fn float_to_words(value: f64) -> Result<(u16, u16)> {
    if value.is_nan() || value.is_infinite() {
        bail!("invalid float32 value");
    }
    let narrowed = value as f32;
    if narrowed.is_infinite() {
        bail!("value {} overflows float32", value);
    }
    let bits = narrowed.to_bits();
    Ok(((bits >> 16) as u16, (bits & 0xFFFF) as u16))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn table(content: &str) -> CsvTable {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        CsvTable::load(file.path()).unwrap()
    }

    #[test]
    fn table_parses_numeric_rows() {
        let t = table("t,x\n0,10\n1,20\n2,30\n");
        assert_eq!(t.len(), 3);
        assert_eq!(t.value(1, "x"), Some(20.0));
        assert_eq!(t.value(0, "missing"), None);
    }

    #[test]
    fn table_rejects_non_numeric_and_empty() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"a\nnope\n").unwrap();
        file.flush().unwrap();
        assert!(CsvTable::load(file.path()).is_err());

        let mut empty = tempfile::NamedTempFile::new().unwrap();
        empty.write_all(b"a,b\n").unwrap();
        empty.flush().unwrap();
        assert!(CsvTable::load(empty.path()).is_err());
    }

    #[test]
    fn drive_cycle_wraps_modulo_rows() {
        let engine = Arc::new(SlaveEngine::new());
        let driver = CsvDriver::new(
            table("t,x\n0,10\n1,20\n2,30\n"),
            vec![PointBinding::new("x", RegisterKind::Holding, 0, None, 1.0, 0.0)],
            engine.clone(),
            Duration::from_secs(1),
        );

        let mut observed = Vec::new();
        for tick in 0..4 {
            driver.apply_row(tick % 3);
            observed.push(engine.get_holding(0));
        }
        assert_eq!(observed, vec![10, 20, 30, 10]);
    }

    #[test]
    fn scale_and_offset_apply_before_conversion() {
        let engine = Arc::new(SlaveEngine::new());
        let driver = CsvDriver::new(
            table("x\n5\n"),
            vec![PointBinding::new("x", RegisterKind::Input, 7, None, 10.0, 3.0)],
            engine.clone(),
            Duration::from_secs(1),
        );
        driver.apply_row(0);
        assert_eq!(engine.get_input(7), 53);
    }

    #[test]
    fn float32_splits_high_word_first() {
        let engine = Arc::new(SlaveEngine::new());
        let driver = CsvDriver::new(
            table("pi\n3.14159274\n"),
            vec![PointBinding::new(
                "pi",
                RegisterKind::Holding,
                200,
                Some(DataType::Float32),
                1.0,
                0.0,
            )],
            engine.clone(),
            Duration::from_secs(1),
        );
        driver.apply_row(0);
        assert_eq!(engine.get_holding(200), 0x4049);
        assert_eq!(engine.get_holding(201), 0x0FDB);
    }

    #[test]
    fn bool_points_threshold_at_zero() {
        let engine = Arc::new(SlaveEngine::new());
        let driver = CsvDriver::new(
            table("a,b\n1,0\n"),
            vec![
                PointBinding::new("a", RegisterKind::Coil, 0, None, 1.0, 0.0),
                PointBinding::new("b", RegisterKind::Discrete, 0, None, 1.0, 0.0),
            ],
            engine.clone(),
            Duration::from_secs(1),
        );
        driver.apply_row(0);
        assert!(engine.get_coil(0));
        assert!(!engine.get_discrete_input(0));
    }

    #[test]
    fn out_of_range_values_are_skipped() {
        let engine = Arc::new(SlaveEngine::new());
        engine.set_holding(0, 42);
        let driver = CsvDriver::new(
            table("x\n70000\n"),
            vec![PointBinding::new("x", RegisterKind::Holding, 0, None, 1.0, 0.0)],
            engine.clone(),
            Duration::from_secs(1),
        );
        driver.apply_row(0);
        // Rejected write leaves the register untouched.
        assert_eq!(engine.get_holding(0), 42);
    }

    #[test]
    fn int16_uses_twos_complement() {
        let engine = Arc::new(SlaveEngine::new());
        let driver = CsvDriver::new(
            table("x\n-2\n"),
            vec![PointBinding::new(
                "x",
                RegisterKind::Holding,
                1,
                Some(DataType::Int16),
                1.0,
                0.0,
            )],
            engine.clone(),
            Duration::from_secs(1),
        );
        driver.apply_row(0);
        assert_eq!(engine.get_holding(1), 0xFFFE);
    }

    #[test]
    fn conversion_bounds() {
        assert!(float_to_uint16(-1.0).is_err());
        assert!(float_to_uint16(65_536.0).is_err());
        assert_eq!(float_to_uint16(65_535.4).unwrap(), 65_535);
        assert!(float_to_int16(-32_769.0).is_err());
        assert_eq!(float_to_int16(-32_768.0).unwrap(), 0x8000);
        assert!(float_to_words(f64::MAX).is_err());
        assert!(float_to_words(f64::NAN).is_err());
    }
}
