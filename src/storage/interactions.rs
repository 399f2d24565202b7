//! LLM interaction audit log (`grok_logs.jsonl`).
//!
//! One JSON object per line: prompts sent, text received, and the scores
//! behind each consensus. Appends from parallel samples are serialised by
//! a lock so lines never interleave.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scores: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_score: Option<f64>,
}

impl InteractionRecord {
    /// A prompt/response exchange.
    pub fn exchange(sent: String, received: String) -> Self {
        Self {
            timestamp: Utc::now(),
            sent: Some(sent),
            received: Some(received),
            ticker: None,
            scores: None,
            avg_score: None,
        }
    }

    /// The scores that produced a ticker's consensus.
    pub fn scores(ticker: &str, scores: Vec<f64>, avg_score: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            sent: None,
            received: None,
            ticker: Some(ticker.to_string()),
            scores: Some(scores),
            avg_score: Some(avg_score),
        }
    }
}

pub struct InteractionLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl InteractionLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path, lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &InteractionRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).context("Failed to serialise interaction")?;
        line.push('\n');

        let _guard = self.lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        Ok(())
    }

    /// Every record; lines that fail to parse are skipped.
    pub fn load_all(&self) -> Result<Vec<InteractionRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        let mut out = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if let Ok(record) = serde_json::from_str(&line) {
                out.push(record);
            }
        }
        Ok(out)
    }
}
