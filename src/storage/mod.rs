//! Persistence layer.
//!
//! Flat-file stores under the data directory:
//! - `portfolio.csv`: one row per trade, rewritten wholesale on mutation.
//! - `sentiment_history.csv`: append-only consensus log.
//! - `earnings_dates.json`: per-ticker earnings history, locked and
//!   replaced atomically.
//! - `grok_logs.jsonl`: append-only LLM interaction audit.
//!
//! Every full rewrite goes through [`write_atomic`] so a reader never sees
//! a truncated file.

pub mod earnings;
pub mod interactions;
pub mod positions;
pub mod sentiment;

use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

pub use earnings::EarningsHistoryStore;
pub use interactions::InteractionLog;
pub use positions::PositionStore;
pub use sentiment::SentimentStore;

pub const POSITIONS_FILE: &str = "portfolio.csv";
pub const SENTIMENT_FILE: &str = "sentiment_history.csv";
pub const EARNINGS_FILE: &str = "earnings_dates.json";
pub const INTERACTIONS_FILE: &str = "grok_logs.jsonl";

/// Replace `path` with `contents` via a temp file in the same directory
/// and a rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(contents)
        .with_context(|| format!("Failed to write temp file for {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("Failed to sync temp file for {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// All file-backed stores, opened against one data directory.
pub struct Stores {
    pub positions: PositionStore,
    pub sentiment: SentimentStore,
    pub earnings: EarningsHistoryStore,
    pub interactions: InteractionLog,
}

impl Stores {
    /// Open the stores, creating the directory and empty files as needed.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let stores = Self {
            positions: PositionStore::new(data_dir.join(POSITIONS_FILE)),
            sentiment: SentimentStore::new(data_dir.join(SENTIMENT_FILE)),
            earnings: EarningsHistoryStore::new(data_dir.join(EARNINGS_FILE)),
            interactions: InteractionLog::new(data_dir.join(INTERACTIONS_FILE)),
        };
        stores.positions.init()?;
        stores.sentiment.init()?;

        info!(data_dir = %data_dir.display(), "Stores initialised");
        Ok(stores)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
