//! Earnings calendar sources.
//!
//! Defines the `EarningsCalendar` trait and the Finnhub implementation.
//! A source only has to return the raw events in a date range; selecting
//! upcoming events and the most recent past event per ticker is shared.

pub mod finnhub;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashMap;

use crate::types::EarningsEvent;

/// One calendar row: a ticker and its announcement.
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarEntry {
    pub ticker: String,
    pub event: EarningsEvent,
}

/// Abstraction over earnings calendar providers.
#[async_trait]
pub trait EarningsCalendar: Send + Sync {
    /// All announcements dated within `[from, to]`, for every symbol the
    /// provider knows. One request regardless of universe size.
    async fn fetch_range(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<CalendarEntry>>;

    /// Next announcement per ticker with `today < date <= until`.
    async fn upcoming(
        &self,
        universe: &[String],
        today: NaiveDate,
        until: NaiveDate,
    ) -> Result<HashMap<String, EarningsEvent>> {
        let entries = self.fetch_range(today, until).await?;
        Ok(select_upcoming(entries, universe, today, until))
    }

    /// Most recent announcement per ticker with `since <= date < today`,
    /// from a single bulk query.
    async fn most_recent_past(
        &self,
        universe: &[String],
        since: NaiveDate,
        today: NaiveDate,
    ) -> Result<HashMap<String, EarningsEvent>> {
        let entries = self.fetch_range(since, today).await?;
        Ok(select_most_recent_past(entries, universe, since, today))
    }

    /// Provider name for logging and identification.
    fn name(&self) -> &str;
}

/// Earliest in-window announcement per universe ticker.
pub fn select_upcoming(
    entries: Vec<CalendarEntry>,
    universe: &[String],
    today: NaiveDate,
    until: NaiveDate,
) -> HashMap<String, EarningsEvent> {
    let mut out: HashMap<String, EarningsEvent> = HashMap::new();
    for entry in entries {
        if !universe.contains(&entry.ticker) {
            continue;
        }
        let date = entry.event.date;
        if date <= today || date > until {
            continue;
        }
        match out.get(&entry.ticker) {
            Some(existing) if existing.date <= date => {}
            _ => {
                out.insert(entry.ticker, entry.event);
            }
        }
    }
    out
}

/// Latest strictly-past announcement per universe ticker.
pub fn select_most_recent_past(
    entries: Vec<CalendarEntry>,
    universe: &[String],
    since: NaiveDate,
    today: NaiveDate,
) -> HashMap<String, EarningsEvent> {
    let mut out: HashMap<String, EarningsEvent> = HashMap::new();
    for entry in entries {
        if !universe.contains(&entry.ticker) {
            continue;
        }
        let date = entry.event.date;
        if date >= today || date < since {
            continue;
        }
        match out.get(&entry.ticker) {
            Some(existing) if existing.date >= date => {}
            _ => {
                out.insert(entry.ticker, entry.event);
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
