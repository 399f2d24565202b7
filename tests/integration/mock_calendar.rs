//! Mock earnings calendar.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::{Arc, Mutex};

use cdem::calendar::{CalendarEntry, EarningsCalendar};
use cdem::types::{AnnouncementTiming, EarningsEvent};

/// In-memory calendar serving a fixed list of announcements.
pub struct MockCalendar {
    entries: Arc<Mutex<Vec<CalendarEntry>>>,
    requests: Arc<Mutex<Vec<(NaiveDate, NaiveDate)>>>,
    force_error: Arc<Mutex<Option<String>>>,
}

impl MockCalendar {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Vec::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
            force_error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_event(self, ticker: &str, date: NaiveDate, timing: AnnouncementTiming) -> Self {
        self.entries.lock().unwrap().push(CalendarEntry {
            ticker: ticker.to_string(),
            event: EarningsEvent::new(date, timing),
        });
        self
    }

    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    /// Ranges requested so far, one per `fetch_range` call.
    pub fn requests(&self) -> Vec<(NaiveDate, NaiveDate)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl EarningsCalendar for MockCalendar {
    async fn fetch_range(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<CalendarEntry>> {
        if let Some(err) = self.force_error.lock().unwrap().as_ref() {
            return Err(anyhow!("{}", err));
        }
        self.requests.lock().unwrap().push((from, to));
        Ok(self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event.date >= from && e.event.date <= to)
            .cloned()
            .collect())
    }

    fn name(&self) -> &str {
        "mock-calendar"
    }
}
