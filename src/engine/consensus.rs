//! Consensus engine.
//!
//! Asks the sentiment oracle the same question several times in parallel,
//! keeps the samples that produced a valid score, and folds them into a
//! Good/Mixed/Bad verdict. A verdict is computed at most once per ticker
//! and announcement date.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::LlmSettings;
use crate::llm::{parse_sentiment, sentiment_prompt, SentimentOracle, SENTIMENT_SYSTEM_PROMPT};
use crate::storage::interactions::InteractionRecord;
use crate::storage::Stores;
use crate::types::{Consensus, ConsensusResult, EarningsEvent, SentimentRecord};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Parallel samples per ticker.
    pub samples: usize,
    /// Attempts per sample.
    pub max_attempts: u32,
    /// Minimum valid scores for a verdict.
    pub min_valid: usize,
    /// Hard timeout for one oracle request.
    pub request_timeout: Duration,
    /// Pause after a network/API failure before the next attempt.
    pub error_backoff: Duration,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self::from(&LlmSettings::default())
    }
}

impl From<&LlmSettings> for ConsensusConfig {
    fn from(s: &LlmSettings) -> Self {
        Self {
            samples: s.samples,
            max_attempts: s.max_attempts,
            min_valid: s.min_valid,
            request_timeout: Duration::from_secs(s.timeout_secs),
            error_backoff: Duration::from_secs(s.error_backoff_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum ConsensusOutcome {
    /// Today is not the evaluation date (the day before earnings).
    NotDue { evaluation_date: NaiveDate },
    /// A verdict for this announcement is already stored.
    AlreadyEvaluated,
    /// Too few samples produced a valid score.
    Insufficient { valid: usize },
    Verdict(ConsensusResult),
}

impl ConsensusOutcome {
    pub fn verdict(&self) -> Option<&ConsensusResult> {
        match self {
            ConsensusOutcome::Verdict(r) => Some(r),
            _ => None,
        }
    }
}

/// Aggregate valid scores into a verdict.
///
/// Fewer than `min_valid` scores (including none) is insufficient data.
pub fn classify(ticker: &str, scores: Vec<f64>, min_valid: usize) -> Option<ConsensusResult> {
    if scores.is_empty() || scores.len() < min_valid {
        return None;
    }
    let average = scores.iter().sum::<f64>() / scores.len() as f64;
    Some(ConsensusResult {
        ticker: ticker.to_string(),
        consensus: Consensus::from_average(average),
        average,
        scores,
    })
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ConsensusEngine {
    oracle: Arc<dyn SentimentOracle>,
    stores: Arc<Stores>,
    config: ConsensusConfig,
}

impl ConsensusEngine {
    pub fn new(oracle: Arc<dyn SentimentOracle>, stores: Arc<Stores>, config: ConsensusConfig) -> Self {
        Self { oracle, stores, config }
    }

    /// Evaluate pre-earnings consensus for `ticker` ahead of `event`.
    ///
    /// Runs only on the day before the announcement (market-local `today`)
    /// unless `test_mode` is set. A verdict is appended to the sentiment
    /// history, folded into the earnings history, and its scores logged.
    pub async fn evaluate(
        &self,
        ticker: &str,
        event: EarningsEvent,
        today: NaiveDate,
        test_mode: bool,
    ) -> Result<ConsensusOutcome> {
        let evaluation_date = event.date - ChronoDuration::days(1);
        if !test_mode && today != evaluation_date {
            debug!(ticker, evaluation_date = %evaluation_date, today = %today, "Not the evaluation day");
            return Ok(ConsensusOutcome::NotDue { evaluation_date });
        }

        if self.stores.earnings.has_consensus_for(ticker, event.date)? {
            info!(ticker, earnings = %event, "Consensus already recorded for this announcement");
            return Ok(ConsensusOutcome::AlreadyEvaluated);
        }

        info!(
            ticker,
            earnings = %event,
            samples = self.config.samples,
            model = self.oracle.model_name(),
            "Gathering sentiment consensus"
        );

        let scores = self.gather(ticker, evaluation_date).await;

        let Some(result) = classify(ticker, scores.clone(), self.config.min_valid) else {
            warn!(
                ticker,
                valid = scores.len(),
                samples = self.config.samples,
                "Insufficient valid scores, skipping"
            );
            return Ok(ConsensusOutcome::Insufficient { valid: scores.len() });
        };

        info!(
            ticker,
            consensus = %result.consensus,
            avg = format!("{:.2}", result.average),
            scores = ?result.scores,
            "{result}"
        );

        if let Err(e) = self
            .stores
            .interactions
            .append(&InteractionRecord::scores(ticker, result.scores.clone(), result.average))
        {
            warn!(ticker, error = %e, "Failed to log consensus scores");
        }
        self.stores
            .sentiment
            .append(&SentimentRecord::from_result(&result, Utc::now()))?;
        self.stores
            .earnings
            .record_event(ticker, event, Some((result.average, result.consensus)))?;

        Ok(ConsensusOutcome::Verdict(result))
    }

    /// Fan out the samples and collect every valid score.
    async fn gather(&self, ticker: &str, as_of: NaiveDate) -> Vec<f64> {
        let user_prompt: Arc<str> = Arc::from(sentiment_prompt(ticker, as_of));
        let mut set = JoinSet::new();

        for run in 1..=self.config.samples {
            let oracle = Arc::clone(&self.oracle);
            let stores = Arc::clone(&self.stores);
            let prompt = Arc::clone(&user_prompt);
            let config = self.config.clone();
            let ticker = ticker.to_string();
            set.spawn(async move { run_sample(oracle, stores, &prompt, &ticker, run, &config).await });
        }

        let mut scores = Vec::with_capacity(self.config.samples);
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Some(score)) => scores.push(score),
                Ok(None) => {}
                Err(e) => warn!(ticker, error = %e, "Sentiment sample task failed"),
            }
        }
        scores
    }
}

/// One sample: retry until a valid score, the attempt budget runs out, or
/// a request times out.
async fn run_sample(
    oracle: Arc<dyn SentimentOracle>,
    stores: Arc<Stores>,
    user_prompt: &str,
    ticker: &str,
    run: usize,
    config: &ConsensusConfig,
) -> Option<f64> {
    for attempt in 1..=config.max_attempts {
        let response = tokio::time::timeout(
            config.request_timeout,
            oracle.generate(SENTIMENT_SYSTEM_PROMPT, user_prompt),
        )
        .await;

        let text = match response {
            Err(_) => {
                warn!(
                    ticker,
                    run,
                    attempt,
                    timeout_secs = config.request_timeout.as_secs(),
                    "Sentiment request timed out, sample dropped"
                );
                return None;
            }
            Ok(Err(e)) => {
                warn!(ticker, run, attempt, error = %e, "Sentiment request failed");
                if attempt < config.max_attempts {
                    tokio::time::sleep(config.error_backoff).await;
                }
                continue;
            }
            Ok(Ok(text)) => text,
        };

        let record = InteractionRecord::exchange(
            format!("{SENTIMENT_SYSTEM_PROMPT}\n{user_prompt}"),
            text.clone(),
        );
        if let Err(e) = stores.interactions.append(&record) {
            warn!(ticker, error = %e, "Failed to log sentiment exchange");
        }

        match parse_sentiment(&text) {
            Ok(sample) => {
                info!(ticker, run, attempt, score = sample.score, classification = %sample.classification, "Sample scored");
                return Some(sample.score);
            }
            Err(e) => {
                debug!(ticker, run, attempt, error = %e, "Unusable sentiment response, retrying");
            }
        }
    }

    warn!(ticker, run, attempts = config.max_attempts, "No valid score for sample");
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
