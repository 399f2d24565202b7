//! LLM integration for pre-earnings sentiment classification.
//!
//! Defines the `SentimentOracle` trait, the fixed prompt templates, and the
//! response parsers shared by the consensus engine and the movement
//! resolver. The concrete client is xAI Grok.

pub mod grok;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use serde::Deserialize;

use crate::types::CdemError;

/// Abstraction over a chat-completion LLM.
///
/// Implementors send a system instruction plus a user prompt and return the
/// raw response text. An `Err` means the service could not be reached or
/// answered with a non-success status; interpreting the text is left to the
/// caller.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SentimentOracle: Send + Sync {
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;

    /// Model identifier string.
    fn model_name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

pub const SENTIMENT_SYSTEM_PROMPT: &str = "You are a financial sentiment analyst. \
Respond ONLY with valid JSON for the classification. \
No additional text, explanations, or formatting.";

pub const PRICE_SYSTEM_PROMPT: &str = "You are a financial data assistant. \
You have access to historical stock price data.\n\
Respond ONLY with valid JSON in this exact format: {\"open\": 123.45, \"close\": 124.56}\n\
No additional text, explanations, or formatting. Just the JSON object.";

/// Pre-earnings sentiment prompt for `ticker` as of `as_of`.
pub fn sentiment_prompt(ticker: &str, as_of: NaiveDate) -> String {
    let since = as_of - Duration::days(1);
    format!(
        "Use your up-to-date knowledge to analyze pre-earnings consensus for {ticker} as of {as_of}. \
Dig deep into available data from sources like X (tweets since {since}), Reddit r/stocks, \
StockTwits, Seeking Alpha, Bloomberg previews, and options IV data for sentiment.\n\
Classify as:\n\
- Good: >70% positive (beat expected, strong growth, hype).\n\
- Mixed: 40-70% positive (balanced views with risks).\n\
- Bad: <40% positive (anticipated weakness).\n\
Detect leaks/hype. Reason step-by-step before classifying. \
Return as JSON: {{\"classification\": \"Good\", \"score\": 75, \"reasoning\": \"...\", \"sources\": []}}."
    )
}

/// Prompt asking for the open and close of `ticker` on `session`.
pub fn price_prompt(ticker: &str, session: NaiveDate, after_earnings: bool) -> String {
    let suffix = if after_earnings { " (the day after earnings)" } else { "" };
    format!(
        "Get the opening and closing prices for {ticker} on {session}{suffix}.\n\
Return JSON with the open and close prices."
    )
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// A single parsed sentiment classification.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SentimentSample {
    pub classification: String,
    pub score: f64,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub sources: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawSample {
    classification: Option<serde_json::Value>,
    score: Option<serde_json::Value>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    sources: Option<Vec<serde_json::Value>>,
}

/// Slice from the first `{` to the last `}` of a response.
///
/// Models occasionally wrap the object in prose or code fences.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Parse a sentiment response into a sample with a score in [0, 100].
pub fn parse_sentiment(text: &str) -> Result<SentimentSample, CdemError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(CdemError::SentimentParse("empty response".into()));
    }
    let json = extract_json_object(trimmed)
        .ok_or_else(|| CdemError::SentimentParse("no JSON object in response".into()))?;
    let raw: RawSample = serde_json::from_str(json)
        .map_err(|e| CdemError::SentimentParse(format!("malformed JSON: {e}")))?;

    let classification = match raw.classification {
        Some(serde_json::Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => return Err(CdemError::SentimentParse("missing classification".into())),
    };
    let score = match raw.score {
        Some(value) => value_as_f64(&value)
            .ok_or_else(|| CdemError::SentimentParse(format!("non-numeric score: {value}")))?,
        None => return Err(CdemError::SentimentParse("missing score".into())),
    };
    if !(0.0..=100.0).contains(&score) {
        return Err(CdemError::SentimentParse(format!("score out of range: {score}")));
    }

    Ok(SentimentSample {
        classification,
        score,
        reasoning: raw.reasoning.unwrap_or_default(),
        sources: raw.sources.unwrap_or_default(),
    })
}

/// Parse an `{"open": .., "close": ..}` response. Both prices must be positive.
pub fn parse_open_close(text: &str) -> Result<(f64, f64), CdemError> {
    let json = extract_json_object(text.trim())
        .ok_or_else(|| CdemError::SentimentParse("no JSON object in price response".into()))?;
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| CdemError::SentimentParse(format!("malformed price JSON: {e}")))?;

    let open = value.get("open").and_then(value_as_f64).unwrap_or(0.0);
    let close = value.get("close").and_then(value_as_f64).unwrap_or(0.0);
    if open <= 0.0 || close <= 0.0 {
        return Err(CdemError::SentimentParse(format!(
            "invalid price data: open={open}, close={close}"
        )));
    }
    Ok((open, close))
}

/// Numbers may arrive as JSON numbers or numeric strings ("75").
fn value_as_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().trim_end_matches('%').parse().ok(),
        _ => None,
    }
    .filter(|v: &f64| v.is_finite())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
