//! Shared types for the CDEM agent.
//!
//! These types form the data model used across all modules: broker
//! snapshots, earnings events, consensus verdicts, and the rows persisted
//! by the storage layer. They carry no behaviour beyond formatting and
//! small derived quantities so that broker, engine, and storage modules
//! can depend on them without circular references.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Trading mode
// ---------------------------------------------------------------------------

/// Which brokerage environment an order or query targets.
///
/// Passed explicitly into every broker call; there is no process-wide mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradingMode {
    Paper,
    Live,
}

impl TradingMode {
    pub fn from_paper_flag(paper_trading: bool) -> Self {
        if paper_trading {
            TradingMode::Paper
        } else {
            TradingMode::Live
        }
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingMode::Paper => write!(f, "PAPER TRADING (Sandbox)"),
            TradingMode::Live => write!(f, "LIVE TRADING (Real Money)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Consensus
// ---------------------------------------------------------------------------

/// Aggregated pre-earnings sentiment classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Consensus {
    Good,
    Mixed,
    Bad,
}

impl Consensus {
    /// Classify an average sentiment score (0-100).
    ///
    /// Strictly above 70 is Good; 70 itself is Mixed.
    pub fn from_average(avg: f64) -> Self {
        if avg > 70.0 {
            Consensus::Good
        } else if avg >= 40.0 {
            Consensus::Mixed
        } else {
            Consensus::Bad
        }
    }
}

impl fmt::Display for Consensus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Consensus::Good => write!(f, "Good"),
            Consensus::Mixed => write!(f, "Mixed"),
            Consensus::Bad => write!(f, "Bad"),
        }
    }
}

/// Outcome of a consensus-gathering pass over parallel sentiment samples.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusResult {
    pub ticker: String,
    /// One entry per sample that produced a valid score.
    pub scores: Vec<f64>,
    pub average: f64,
    pub consensus: Consensus,
}

impl fmt::Display for ConsensusResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} consensus is {} (avg score: {:.2}, {} samples)",
            self.ticker,
            self.consensus,
            self.average,
            self.scores.len(),
        )
    }
}

// ---------------------------------------------------------------------------
// Earnings calendar
// ---------------------------------------------------------------------------

/// When an earnings announcement is released relative to the trading session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnnouncementTiming {
    /// Before market open: the reaction trades on the announcement day.
    #[serde(rename = "bmo")]
    BeforeOpen,
    /// After market close: the reaction trades on the following session.
    #[serde(rename = "amc")]
    AfterClose,
}

impl AnnouncementTiming {
    /// Normalise a calendar provider's hour tag.
    ///
    /// `bmo`/`bmc` mean before the open; everything else (including
    /// `amc`, `dmh` and an empty tag) is treated as after the close.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "bmo" | "bmc" => AnnouncementTiming::BeforeOpen,
            _ => AnnouncementTiming::AfterClose,
        }
    }
}

impl fmt::Display for AnnouncementTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnnouncementTiming::BeforeOpen => write!(f, "bmo"),
            AnnouncementTiming::AfterClose => write!(f, "amc"),
        }
    }
}

/// A single scheduled (or past) earnings announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EarningsEvent {
    pub date: NaiveDate,
    pub timing: AnnouncementTiming,
}

impl EarningsEvent {
    pub fn new(date: NaiveDate, timing: AnnouncementTiming) -> Self {
        Self { date, timing }
    }
}

impl fmt::Display for EarningsEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.date, self.timing)
    }
}

// ---------------------------------------------------------------------------
// Broker snapshots
// ---------------------------------------------------------------------------

/// Account balances reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountBalances {
    /// Total account equity.
    pub equity: f64,
    pub cash: f64,
    pub buying_power: f64,
}

impl fmt::Display for AccountBalances {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "equity=${:.2} cash=${:.2} buying_power=${:.2}",
            self.equity, self.cash, self.buying_power,
        )
    }
}

/// A holding as reported by the broker (not the agent's own position row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub quantity: f64,
    /// Total cost basis of the holding.
    pub cost_basis: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size of a market order: a share count or a dollar amount.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderQuantity {
    Shares(f64),
    Notional(f64),
}

impl fmt::Display for OrderQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderQuantity::Shares(q) => write!(f, "{q} shares"),
            OrderQuantity::Notional(n) => write!(f, "${n:.2}"),
        }
    }
}

/// Receipt returned by the broker after an order is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    /// Share quantity actually submitted.
    pub quantity: f64,
}

impl fmt::Display for OrderReceipt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {} x{}",
            self.order_id, self.side, self.symbol, self.quantity,
        )
    }
}

// ---------------------------------------------------------------------------
// Persisted rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// One row per trade attempt in the position store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub timestamp: DateTime<Utc>,
    pub ticker: String,
    pub position_size: f64,
    pub entry_price: f64,
    pub current_price: f64,
    /// Running high once the trailing trigger has been reached.
    #[serde(default)]
    pub high_price: Option<f64>,
    /// Price of the live protective stop, if one was placed.
    #[serde(default)]
    pub stop_price: Option<f64>,
    #[serde(default)]
    pub stop_order_id: Option<String>,
    /// Unrealised while open, realised once closed.
    pub pnl: f64,
    pub status: PositionStatus,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:.4} @ ${:.2} (now ${:.2}, pnl ${:.2}, {:?})",
            self.ticker,
            self.position_size,
            self.entry_price,
            self.current_price,
            self.pnl,
            self.status,
        )
    }
}

impl Position {
    /// A freshly entered position: current price equals entry, zero P&L.
    pub fn open(
        ticker: &str,
        position_size: f64,
        entry_price: f64,
        stop_price: Option<f64>,
        stop_order_id: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp,
            ticker: ticker.to_string(),
            position_size,
            entry_price,
            current_price: entry_price,
            high_price: None,
            stop_price,
            stop_order_id,
            pnl: 0.0,
            status: PositionStatus::Open,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Market value at the last observed price.
    pub fn market_value(&self) -> f64 {
        self.position_size * self.current_price
    }

    /// Fractional gain from entry to the last observed price.
    pub fn gain_pct(&self) -> f64 {
        if self.entry_price <= 0.0 {
            0.0
        } else {
            (self.current_price - self.entry_price) / self.entry_price
        }
    }

    /// Mark the position at a new price, refreshing unrealised P&L.
    pub fn mark(&mut self, price: f64) {
        self.current_price = price;
        self.pnl = (price - self.entry_price) * self.position_size;
    }

    /// Close the position at the exit price, finalising realised P&L.
    pub fn close(&mut self, exit_price: f64) {
        self.mark(exit_price);
        self.status = PositionStatus::Closed;
    }
}

/// One row of the append-only sentiment history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentRecord {
    pub timestamp: DateTime<Utc>,
    pub ticker: String,
    pub sentiment_score: f64,
    pub consensus: Consensus,
    pub num_sources: usize,
}

impl SentimentRecord {
    pub fn from_result(result: &ConsensusResult, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            ticker: result.ticker.clone(),
            sentiment_score: result.average,
            consensus: result.consensus,
            num_sources: result.scores.len(),
        }
    }
}

/// Per-ticker record of the latest earnings cycle, keyed by ticker in the
/// earnings history document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarningsHistoryEntry {
    pub past_earnings_date: NaiveDate,
    pub past_earnings_hour: AnnouncementTiming,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentiment_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus: Option<Consensus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_movement_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "calculated_date_format")]
    pub calculated_date: Option<NaiveDateTime>,
}

impl EarningsHistoryEntry {
    pub fn new(event: EarningsEvent) -> Self {
        Self {
            past_earnings_date: event.date,
            past_earnings_hour: event.timing,
            sentiment_score: None,
            consensus: None,
            price_movement_pct: None,
            entry_price: None,
            exit_price: None,
            calculated_date: None,
        }
    }

    pub fn event(&self) -> EarningsEvent {
        EarningsEvent::new(self.past_earnings_date, self.past_earnings_hour)
    }

    pub fn has_movement(&self) -> bool {
        self.price_movement_pct.is_some()
    }
}

/// `calculated_date` is stored as "YYYY-MM-DD HH:MM:SS".
mod calculated_date_format {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(value: &Option<NaiveDateTime>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(dt) => s.serialize_str(&dt.format(FORMAT).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveDateTime>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|s| NaiveDateTime::parse_from_str(&s, FORMAT).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Realised price reaction across an announcement's trading session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceMovement {
    pub movement_pct: f64,
    pub entry_price: f64,
    pub exit_price: f64,
}

impl PriceMovement {
    /// Movement from open to close, in percent rounded to 2 dp.
    pub fn from_prices(open: f64, close: f64) -> Option<Self> {
        if open <= 0.0 || close <= 0.0 {
            return None;
        }
        Some(Self {
            movement_pct: round_to(((close - open) / open) * 100.0, 2),
            entry_price: round_to(open, 2),
            exit_price: round_to(close, 2),
        })
    }
}

/// Round to a fixed number of decimal places.
pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for CDEM.
#[derive(Debug, thiserror::Error)]
pub enum CdemError {
    #[error("Broker error ({mode:?}): {message}")]
    Broker { mode: TradingMode, message: String },

    #[error("Order rejected for {symbol}: {message}")]
    OrderRejected { symbol: String, message: String },

    #[error("Invalid quote for {0}")]
    InvalidQuote(String),

    #[error("LLM error ({model}): {message}")]
    Llm { model: String, message: String },

    #[error("Unparseable sentiment response: {0}")]
    SentimentParse(String),

    #[error("Calendar error: {0}")]
    Calendar(String),

    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
