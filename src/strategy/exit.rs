//! Exit timing and trailing stops.
//!
//! The session that carries the earnings reaction decides the exit:
//! before-open announcements trade on day D, after-close announcements on
//! the next session. A position is exited from the configured window
//! start on that day (market-local time) or any time after it.

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc, Weekday};
use chrono_tz::America::New_York;

use crate::types::{round_to, AnnouncementTiming, EarningsEvent};

/// Wall-clock time in the exchange's time zone.
pub fn market_time(now: DateTime<Utc>) -> NaiveDateTime {
    now.with_timezone(&New_York).naive_local()
}

/// Calendar date in the exchange's time zone.
pub fn market_date(now: DateTime<Utc>) -> NaiveDate {
    market_time(now).date()
}

/// First weekday strictly after `date`.
pub fn next_weekday(date: NaiveDate) -> NaiveDate {
    let mut d = date + Duration::days(1);
    while matches!(d.weekday(), Weekday::Sat | Weekday::Sun) {
        d += Duration::days(1);
    }
    d
}

/// Session whose close ends the holding window.
pub fn exit_date(event: &EarningsEvent) -> NaiveDate {
    match event.timing {
        AnnouncementTiming::BeforeOpen => event.date,
        AnnouncementTiming::AfterClose => next_weekday(event.date),
    }
}

/// Parse an "HH:MM" window start.
pub fn parse_window_start(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .with_context(|| format!("Invalid exit window start: {s:?} (expected HH:MM)"))
}

/// True from `window_start` on `exit_date`, and on any later day.
pub fn exit_due(now_market: NaiveDateTime, exit_date: NaiveDate, window_start: NaiveTime) -> bool {
    let today = now_market.date();
    today > exit_date || (today == exit_date && now_market.time() >= window_start)
}

/// Fallback when no earnings record exists: exit once `days` calendar days
/// have passed since `reference`.
pub fn fallback_exit_due(today: NaiveDate, reference: NaiveDate, days: i64) -> bool {
    (today - reference).num_days() >= days
}

/// New trailing levels for a position that has cleared the trigger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingUpdate {
    pub high_price: f64,
    /// `high × (1 − trailing_pct)` rounded to cents.
    pub stop_price: f64,
}

/// Trailing stop for the current price, or `None` while the gain has not
/// exceeded `trigger`.
pub fn trailing_update(
    entry_price: f64,
    current_price: f64,
    stored_high: Option<f64>,
    trigger: f64,
    trailing_pct: f64,
) -> Option<TrailingUpdate> {
    if entry_price <= 0.0 {
        return None;
    }
    let gain_pct = (current_price - entry_price) / entry_price;
    if gain_pct <= trigger {
        return None;
    }
    let high_price = current_price.max(stored_high.unwrap_or(entry_price));
    Some(TrailingUpdate {
        high_price,
        stop_price: round_to(high_price * (1.0 - trailing_pct), 2),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
