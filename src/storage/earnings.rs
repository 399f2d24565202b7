//! Earnings history store (`earnings_dates.json`).
//!
//! A JSON object keyed by ticker. It is written by the scheduler, the
//! consensus engine and the movement backfill, so every mutation runs
//! load-modify-persist under one lock and lands via an atomic rename.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::write_atomic;
use crate::strategy::exit::exit_date;
use crate::types::{Consensus, EarningsEvent, EarningsHistoryEntry, PriceMovement};

pub type EarningsHistory = BTreeMap<String, EarningsHistoryEntry>;

pub struct EarningsHistoryStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl EarningsHistoryStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path, lock: Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole document; a missing file is an empty history.
    pub fn load(&self) -> Result<EarningsHistory> {
        if !self.path.exists() {
            return Ok(EarningsHistory::new());
        }
        let json = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        if json.trim().is_empty() {
            return Ok(EarningsHistory::new());
        }
        serde_json::from_str(&json).with_context(|| format!("Failed to parse {}", self.path.display()))
    }

    pub fn save(&self, history: &EarningsHistory) -> Result<()> {
        let _guard = self.lock.lock();
        self.persist(history)
    }

    fn persist(&self, history: &EarningsHistory) -> Result<()> {
        let json = serde_json::to_string_pretty(history).context("Failed to serialise earnings history")?;
        write_atomic(&self.path, json.as_bytes())
    }

    /// Load, mutate, and persist under the store lock.
    ///
    /// Nothing is written when `f` fails.
    pub fn update<T>(&self, f: impl FnOnce(&mut EarningsHistory) -> Result<T>) -> Result<T> {
        let _guard = self.lock.lock();
        let mut history = self.load()?;
        let out = f(&mut history)?;
        self.persist(&history)?;
        Ok(out)
    }

    pub fn get(&self, ticker: &str) -> Result<Option<EarningsHistoryEntry>> {
        Ok(self.load()?.remove(ticker))
    }

    /// Drop a ticker's entry when `upcoming` starts a new cycle.
    ///
    /// Returns true when an entry for a different date was removed.
    pub fn clear_for_new_cycle(&self, ticker: &str, upcoming: &EarningsEvent) -> Result<bool> {
        self.update(|history| {
            let stale = history
                .get(ticker)
                .map(|e| e.past_earnings_date != upcoming.date)
                .unwrap_or(false);
            if stale {
                history.remove(ticker);
                info!(ticker, upcoming = %upcoming, "Cleared earnings history for new cycle");
            }
            Ok(stale)
        })
    }

    /// Record an announcement for `ticker`, optionally with its consensus.
    ///
    /// Moving to a different date starts a fresh entry; the same date keeps
    /// anything already computed.
    pub fn record_event(
        &self,
        ticker: &str,
        event: EarningsEvent,
        verdict: Option<(f64, Consensus)>,
    ) -> Result<()> {
        self.update(|history| {
            let entry = history
                .entry(ticker.to_string())
                .or_insert_with(|| EarningsHistoryEntry::new(event));
            if entry.past_earnings_date != event.date {
                *entry = EarningsHistoryEntry::new(event);
            }
            entry.past_earnings_hour = event.timing;
            if let Some((score, consensus)) = verdict {
                entry.sentiment_score = Some(score);
                entry.consensus = Some(consensus);
            }
            debug!(ticker, event = %event, "Earnings history updated");
            Ok(())
        })
    }

    /// Record a past announcement found by a calendar lookback.
    ///
    /// Ignored when the stored entry is for the same or a later date.
    pub fn record_past_event(&self, ticker: &str, event: EarningsEvent) -> Result<bool> {
        self.update(|history| {
            let newer = history
                .get(ticker)
                .map_or(true, |e| e.past_earnings_date < event.date);
            if newer {
                history.insert(ticker.to_string(), EarningsHistoryEntry::new(event));
                debug!(ticker, event = %event, "Past earnings recorded");
            }
            Ok(newer)
        })
    }

    /// True when a consensus is already stored for this exact announcement.
    pub fn has_consensus_for(&self, ticker: &str, date: NaiveDate) -> Result<bool> {
        Ok(self
            .get(ticker)?
            .map(|e| e.past_earnings_date == date && e.consensus.is_some())
            .unwrap_or(false))
    }

    /// Store a computed movement, unless the entry moved to another date.
    pub fn record_movement(
        &self,
        ticker: &str,
        date: NaiveDate,
        movement: PriceMovement,
        calculated_at: chrono::NaiveDateTime,
    ) -> Result<bool> {
        self.update(|history| match history.get_mut(ticker) {
            Some(entry) if entry.past_earnings_date == date => {
                entry.price_movement_pct = Some(movement.movement_pct);
                entry.entry_price = Some(movement.entry_price);
                entry.exit_price = Some(movement.exit_price);
                entry.calculated_date = Some(calculated_at);
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    /// Entries with no movement yet whose reaction session has closed
    /// before `today`.
    pub fn pending_movements(&self, today: NaiveDate) -> Result<Vec<(String, EarningsHistoryEntry)>> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|(_, e)| !e.has_movement() && today > exit_date(&e.event()))
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
