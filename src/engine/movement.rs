//! Post-earnings price movement backfill.
//!
//! For announcements that have passed without a recorded reaction, asks
//! the oracle for the open and close of the session that carried it and
//! stores the percentage move in the earnings history.

use anyhow::Result;
use chrono::{NaiveDate, Timelike, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::llm::{parse_open_close, price_prompt, SentimentOracle, PRICE_SYSTEM_PROMPT};
use crate::storage::interactions::InteractionRecord;
use crate::storage::Stores;
use crate::strategy::exit::exit_date;
use crate::types::{AnnouncementTiming, EarningsEvent, PriceMovement};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackfillReport {
    pub success: usize,
    pub failed: usize,
    pub failed_tickers: Vec<String>,
}

pub struct MovementResolver {
    oracle: Arc<dyn SentimentOracle>,
    stores: Arc<Stores>,
    max_attempts: u32,
}

impl MovementResolver {
    pub fn new(oracle: Arc<dyn SentimentOracle>, stores: Arc<Stores>, max_attempts: u32) -> Self {
        Self { oracle, stores, max_attempts: max_attempts.max(1) }
    }

    /// Price reaction to `event`, or `None` once every attempt has failed.
    pub async fn resolve(&self, ticker: &str, event: EarningsEvent) -> Option<PriceMovement> {
        let session = exit_date(&event);
        let after_earnings = event.timing == AnnouncementTiming::AfterClose;
        let prompt = price_prompt(ticker, session, after_earnings);

        for attempt in 1..=self.max_attempts {
            let text = match self.oracle.generate(PRICE_SYSTEM_PROMPT, &prompt).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(ticker, attempt, error = %e, "Price request failed");
                    continue;
                }
            };

            let record = InteractionRecord::exchange(format!("{PRICE_SYSTEM_PROMPT}\n{prompt}"), text.clone());
            if let Err(e) = self.stores.interactions.append(&record) {
                warn!(ticker, error = %e, "Failed to log price exchange");
            }

            match parse_open_close(&text).map(|(open, close)| PriceMovement::from_prices(open, close)) {
                Ok(Some(movement)) => return Some(movement),
                Ok(None) => debug!(ticker, attempt, "Non-positive prices in response"),
                Err(e) => debug!(ticker, attempt, error = %e, "Unusable price response"),
            }
        }
        None
    }

    /// Resolve every past announcement still missing its movement.
    pub async fn backfill(&self, today: NaiveDate) -> Result<BackfillReport> {
        let pending = self.stores.earnings.pending_movements(today)?;
        let mut report = BackfillReport::default();
        if pending.is_empty() {
            debug!("No earnings movements to backfill");
            return Ok(report);
        }
        info!(pending = pending.len(), "Backfilling earnings movements");

        for (ticker, entry) in pending {
            let event = entry.event();
            match self.resolve(&ticker, event).await {
                Some(movement) => {
                    let now = Utc::now().naive_utc();
                    let calculated_at = now.with_nanosecond(0).unwrap_or(now);
                    let stored = self
                        .stores
                        .earnings
                        .record_movement(&ticker, event.date, movement, calculated_at)?;
                    if stored {
                        info!(
                            ticker = %ticker,
                            earnings = %event,
                            movement = format!("{:+.2}%", movement.movement_pct),
                            open = movement.entry_price,
                            close = movement.exit_price,
                            "Earnings movement recorded"
                        );
                        report.success += 1;
                    } else {
                        debug!(ticker = %ticker, "Earnings entry changed during backfill, movement dropped");
                    }
                }
                None => {
                    warn!(ticker = %ticker, earnings = %event, attempts = self.max_attempts, "Could not resolve movement");
                    report.failed += 1;
                    report.failed_tickers.push(ticker);
                }
            }
        }

        info!(success = report.success, failed = report.failed, "Movement backfill complete");
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
