//! Finnhub earnings calendar integration.
//!
//! API docs: https://finnhub.io/docs/api/earnings-calendar
//! Base URL: https://finnhub.io/api/v1
//! Rate limit: 60 calls/minute on the free tier.
//! Auth: `X-Finnhub-Token` header.
//!
//! An empty `symbol` parameter returns every company in the date range,
//! so one request covers the whole universe.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{CalendarEntry, EarningsCalendar};
use crate::config::CalendarSettings;
use crate::types::{AnnouncementTiming, CdemError, EarningsEvent};

const PROVIDER_NAME: &str = "finnhub";

// ---------------------------------------------------------------------------
// API response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CalendarResponse {
    #[serde(default)]
    earnings_calendar: Vec<FinnhubEvent>,
}

#[derive(Debug, Deserialize)]
struct FinnhubEvent {
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    date: String,
    /// "bmo", "amc", "dmh" or empty.
    #[serde(default)]
    hour: Option<String>,
}

impl FinnhubEvent {
    fn into_entry(self) -> Option<CalendarEntry> {
        let date = NaiveDate::parse_from_str(&self.date, "%Y-%m-%d").ok()?;
        if self.symbol.is_empty() {
            return None;
        }
        let timing = AnnouncementTiming::from_tag(self.hour.as_deref().unwrap_or("amc"));
        Some(CalendarEntry {
            ticker: self.symbol,
            event: EarningsEvent::new(date, timing),
        })
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Outcome of one request attempt.
enum Attempt {
    Done(Vec<CalendarEntry>),
    RateLimited(String),
    Failed(String),
}

pub struct FinnhubClient {
    http: Client,
    api_key: SecretString,
    settings: CalendarSettings,
}

impl FinnhubClient {
    pub fn new(api_key: String, settings: &CalendarSettings) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client for Finnhub")?;

        Ok(Self {
            http,
            api_key: SecretString::new(api_key),
            settings: settings.clone(),
        })
    }

    fn url(&self, from: NaiveDate, to: NaiveDate) -> String {
        format!(
            "{}/calendar/earnings?from={from}&to={to}&symbol=",
            self.settings.base_url.trim_end_matches('/'),
        )
    }

    async fn attempt(&self, url: &str) -> Attempt {
        let resp = match self
            .http
            .get(url)
            .header("X-Finnhub-Token", self.api_key.expose_secret())
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return Attempt::Failed(format!("request error: {e}")),
        };

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Attempt::RateLimited(format!("HTTP {status}"));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Attempt::Failed(format!("HTTP {status}: {body}"));
        }

        match resp.json::<CalendarResponse>().await {
            Ok(body) => Attempt::Done(
                body.earnings_calendar
                    .into_iter()
                    .filter_map(FinnhubEvent::into_entry)
                    .collect(),
            ),
            Err(e) => Attempt::Failed(format!("parse error: {e}")),
        }
    }
}

#[async_trait]
impl EarningsCalendar for FinnhubClient {
    async fn fetch_range(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<CalendarEntry>> {
        let url = self.url(from, to);
        let mut last_error = String::new();

        for attempt in 1..=self.settings.max_attempts {
            // Free tier allows one call per second.
            tokio::time::sleep(Duration::from_millis(self.settings.request_spacing_ms)).await;
            debug!(from = %from, to = %to, attempt, "Fetching Finnhub earnings calendar");

            match self.attempt(&url).await {
                Attempt::Done(entries) => {
                    info!(from = %from, to = %to, events = entries.len(), "Earnings calendar fetched");
                    return Ok(entries);
                }
                Attempt::RateLimited(msg) => {
                    warn!(attempt, backoff_secs = self.settings.rate_limit_backoff_secs, "Finnhub rate limit hit");
                    last_error = msg;
                    if attempt < self.settings.max_attempts {
                        tokio::time::sleep(Duration::from_secs(self.settings.rate_limit_backoff_secs)).await;
                    }
                }
                Attempt::Failed(msg) => {
                    warn!(attempt, error = %msg, "Finnhub calendar error");
                    last_error = msg;
                    if attempt < self.settings.max_attempts {
                        tokio::time::sleep(Duration::from_secs(self.settings.error_backoff_secs)).await;
                    }
                }
            }
        }

        Err(CdemError::Calendar(format!(
            "failed after {} attempts: {last_error}",
            self.settings.max_attempts
        ))
        .into())
    }

    fn name(&self) -> &str {
        PROVIDER_NAME
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
