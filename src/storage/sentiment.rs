//! Sentiment history (`sentiment_history.csv`). Append-only.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use super::write_atomic;
use crate::types::SentimentRecord;

const HEADER: [&str; 5] = ["timestamp", "ticker", "sentiment_score", "consensus", "num_sources"];

pub struct SentimentStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SentimentStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path, lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn init(&self) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        let mut w = csv::Writer::from_writer(Vec::new());
        w.write_record(HEADER)?;
        let bytes = w.into_inner().context("Failed to flush sentiment header")?;
        write_atomic(&self.path, &bytes)
    }

    pub fn append(&self, record: &SentimentRecord) -> Result<()> {
        let _guard = self.lock.lock();
        self.init()?;
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {} for append", self.path.display()))?;
        let mut w = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        w.serialize(record)?;
        w.flush()?;
        Ok(())
    }

    pub fn load_all(&self) -> Result<Vec<SentimentRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        reader
            .deserialize()
            .map(|r| r.with_context(|| format!("Malformed row in {}", self.path.display())))
            .collect()
    }

    /// Most recent record for `ticker`, by timestamp.
    pub fn latest_for(&self, ticker: &str) -> Result<Option<SentimentRecord>> {
        Ok(self
            .load_all()?
            .into_iter()
            .filter(|r| r.ticker == ticker)
            .max_by_key(|r| r.timestamp))
    }
}
