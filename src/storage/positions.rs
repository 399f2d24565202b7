//! Position store (`portfolio.csv`).
//!
//! Entries are appended; monitor ticks and exits rewrite the whole file
//! atomically.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::write_atomic;
use crate::types::Position;

const HEADER: [&str; 10] = [
    "timestamp",
    "ticker",
    "position_size",
    "entry_price",
    "current_price",
    "high_price",
    "stop_price",
    "stop_order_id",
    "pnl",
    "status",
];

pub struct PositionStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl PositionStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path, lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the header row when the file does not exist yet.
    pub fn init(&self) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        let mut w = csv::Writer::from_writer(Vec::new());
        w.write_record(HEADER)?;
        let bytes = w.into_inner().context("Failed to flush position header")?;
        write_atomic(&self.path, &bytes)
    }

    pub fn load_all(&self) -> Result<Vec<Position>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        let mut rows = Vec::new();
        for record in reader.deserialize() {
            let row: Position = record
                .with_context(|| format!("Malformed row in {}", self.path.display()))?;
            rows.push(row);
        }
        Ok(rows)
    }

    pub fn open_positions(&self) -> Result<Vec<Position>> {
        Ok(self.load_all()?.into_iter().filter(Position::is_open).collect())
    }

    pub fn has_open(&self, ticker: &str) -> Result<bool> {
        Ok(self.load_all()?.iter().any(|p| p.is_open() && p.ticker == ticker))
    }

    /// Append one row.
    pub fn append(&self, position: &Position) -> Result<()> {
        let _guard = self.lock.lock();
        self.init()?;
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {} for append", self.path.display()))?;
        let mut w = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        w.serialize(position)?;
        w.flush()?;
        debug!(ticker = %position.ticker, "Position row appended");
        Ok(())
    }

    /// Replace the whole file with `rows`.
    pub fn save_all(&self, rows: &[Position]) -> Result<()> {
        let _guard = self.lock.lock();
        self.write_rows(rows)
    }

    /// Load, mutate, and rewrite under the store lock.
    ///
    /// Nothing is written when `f` fails.
    pub fn update<T>(&self, f: impl FnOnce(&mut Vec<Position>) -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock();
        let mut rows = self.load_all()?;
        let out = f(&mut rows)?;
        self.write_rows(&rows)?;
        Ok(out)
    }

    fn write_rows(&self, rows: &[Position]) -> Result<()> {
        let mut w = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
        w.write_record(HEADER)?;
        for row in rows {
            w.serialize(row)?;
        }
        let bytes = w.into_inner().context("Failed to flush position rows")?;
        write_atomic(&self.path, &bytes)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
