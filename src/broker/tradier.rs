//! Tradier brokerage integration.
//!
//! API docs: https://documentation.tradier.com/brokerage-api
//! Live base URL: https://api.tradier.com
//! Sandbox base URL: https://sandbox.tradier.com
//! Auth: `Authorization: Bearer {token}`, `Accept: application/json`.
//!
//! Paper and live credentials are held side by side; the mode passed to
//! each call picks the environment. Orders are whole-share equity orders;
//! notional orders are converted to shares at the current quote.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::Broker;
use crate::config::{BrokerSettings, Settings};
use crate::types::{
    AccountBalances, BrokerPosition, CdemError, OrderQuantity, OrderReceipt, OrderSide,
    TradingMode,
};

const BROKER_NAME: &str = "tradier";

// ---------------------------------------------------------------------------
// API response types (Tradier JSON → Rust)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct BalancesResponse {
    balances: TradierBalances,
}

#[derive(Debug, Deserialize)]
struct TradierBalances {
    #[serde(default)]
    total_equity: f64,
    #[serde(default)]
    total_cash: f64,
    #[serde(default)]
    option_buying_power: Option<f64>,
    #[serde(default)]
    margin: Option<MarginBalances>,
    #[serde(default)]
    cash: Option<CashBalances>,
}

#[derive(Debug, Deserialize)]
struct MarginBalances {
    #[serde(default)]
    stock_buying_power: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CashBalances {
    #[serde(default)]
    cash_available: Option<f64>,
}

impl TradierBalances {
    /// Margin accounts report option/stock buying power, cash accounts only
    /// cash available.
    fn buying_power(&self) -> f64 {
        self.option_buying_power
            .or_else(|| self.margin.as_ref().and_then(|m| m.stock_buying_power))
            .or_else(|| self.cash.as_ref().and_then(|c| c.cash_available))
            .unwrap_or(self.total_cash)
    }
}

/// Tradier collapses single-element arrays into a bare object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::One(item) => vec![item],
            OneOrMany::Many(items) => items,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PositionsResponse {
    #[serde(default)]
    positions: Option<PositionsField>,
}

/// `"positions": "null"` when the account holds nothing.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PositionsField {
    Held { position: OneOrMany<TradierPosition> },
    Empty(String),
}

#[derive(Debug, Deserialize)]
struct TradierPosition {
    symbol: String,
    #[serde(default)]
    quantity: f64,
    #[serde(default)]
    cost_basis: f64,
}

#[derive(Debug, Deserialize)]
struct QuotesResponse {
    quotes: QuotesField,
}

#[derive(Debug, Deserialize)]
struct QuotesField {
    #[serde(default)]
    quote: Option<OneOrMany<TradierQuote>>,
}

#[derive(Debug, Deserialize)]
struct TradierQuote {
    symbol: String,
    #[serde(default)]
    last: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(default)]
    order: Option<OrderAck>,
    #[serde(default)]
    errors: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OrderAck {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    status: String,
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// API token and account id for one Tradier environment.
pub struct TradierCredentials {
    pub api_key: SecretString,
    pub account_id: String,
}

impl TradierCredentials {
    pub fn new(api_key: String, account_id: String) -> Self {
        Self { api_key: SecretString::new(api_key), account_id }
    }

    /// Read both values from the environment; `None` when either is unset.
    fn from_env(key_env: &str, account_env: &str) -> Option<Self> {
        let key = Settings::resolve_env(key_env).ok()?;
        let account = Settings::resolve_env(account_env).ok()?;
        Some(Self::new(key, account))
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct TradierClient {
    http: Client,
    paper_base_url: String,
    live_base_url: String,
    paper: Option<TradierCredentials>,
    live: Option<TradierCredentials>,
    request_spacing: Duration,
    settings: BrokerSettings,
}

impl TradierClient {
    pub fn new(
        settings: &BrokerSettings,
        paper: Option<TradierCredentials>,
        live: Option<TradierCredentials>,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent("CDEM/0.1.0 (earnings-momentum-agent)")
            .build()
            .context("Failed to build HTTP client for Tradier")?;

        Ok(Self {
            http,
            paper_base_url: settings.paper_base_url.trim_end_matches('/').to_string(),
            live_base_url: settings.live_base_url.trim_end_matches('/').to_string(),
            paper,
            live,
            request_spacing: Duration::from_millis(settings.request_spacing_ms),
            settings: settings.clone(),
        })
    }

    /// Build a client from whichever credential sets are present in the
    /// environment.
    pub fn from_env(settings: &BrokerSettings) -> Result<Self> {
        let paper = TradierCredentials::from_env(&settings.paper_key_env, &settings.paper_account_env);
        let live = TradierCredentials::from_env(&settings.live_key_env, &settings.live_account_env);
        Self::new(settings, paper, live)
    }

    /// Fail unless credentials for `mode` are configured.
    pub fn ensure_credentials(&self, mode: TradingMode) -> Result<()> {
        self.credentials(mode).map(|_| ())
    }

    fn credentials(&self, mode: TradingMode) -> Result<&TradierCredentials> {
        let (creds, key_env, account_env) = match mode {
            TradingMode::Paper => (
                self.paper.as_ref(),
                &self.settings.paper_key_env,
                &self.settings.paper_account_env,
            ),
            TradingMode::Live => (
                self.live.as_ref(),
                &self.settings.live_key_env,
                &self.settings.live_account_env,
            ),
        };
        creds.ok_or_else(|| {
            CdemError::MissingCredentials(format!("{key_env} and {account_env}")).into()
        })
    }

    fn base_url(&self, mode: TradingMode) -> &str {
        match mode {
            TradingMode::Paper => &self.paper_base_url,
            TradingMode::Live => &self.live_base_url,
        }
    }

    // -- Internal helpers ------------------------------------------------

    /// Authenticated request against the account-scoped or market API.
    async fn request(&self, mode: TradingMode, method: Method, path: &str) -> Result<RequestBuilder> {
        let creds = self.credentials(mode)?;
        tokio::time::sleep(self.request_spacing).await;
        let url = format!("{}{}", self.base_url(mode), path);
        debug!(url = %url, method = %method, "Tradier request");
        Ok(self
            .http
            .request(method, url)
            .bearer_auth(creds.api_key.expose_secret())
            .header("Accept", "application/json"))
    }

    fn account_path(&self, mode: TradingMode, suffix: &str) -> Result<String> {
        let creds = self.credentials(mode)?;
        Ok(format!("/v1/accounts/{}{}", creds.account_id, suffix))
    }

    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        mode: TradingMode,
        builder: RequestBuilder,
        what: &str,
    ) -> Result<T> {
        let resp = builder
            .send()
            .await
            .with_context(|| format!("Tradier {what} request failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CdemError::Broker {
                mode,
                message: format!("{what} HTTP {status}: {body}"),
            }
            .into());
        }

        resp.json()
            .await
            .with_context(|| format!("Failed to parse Tradier {what} response"))
    }

    /// Accept an order response only when Tradier reports status "ok".
    fn order_id(resp: OrderResponse, symbol: &str) -> Result<String> {
        match resp.order {
            Some(ack) if ack.status == "ok" => {
                let id = match ack.id {
                    Some(serde_json::Value::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                Ok(id)
            }
            Some(ack) => Err(CdemError::OrderRejected {
                symbol: symbol.to_string(),
                message: format!("status {}", ack.status),
            }
            .into()),
            None => Err(CdemError::OrderRejected {
                symbol: symbol.to_string(),
                message: format!("{}", resp.errors.unwrap_or(serde_json::Value::Null)),
            }
            .into()),
        }
    }

    async fn place_order(
        &self,
        mode: TradingMode,
        symbol: &str,
        side: OrderSide,
        shares: u64,
        stop_price: Option<f64>,
    ) -> Result<OrderReceipt> {
        let quantity = shares.to_string();
        let mut form: Vec<(&str, String)> = vec![
            ("class", "equity".to_string()),
            ("symbol", symbol.to_string()),
            ("side", side.as_str().to_string()),
            ("quantity", quantity),
        ];
        match stop_price {
            Some(stop) => {
                form.push(("type", "stop".to_string()));
                form.push(("duration", "gtc".to_string()));
                form.push(("stop", format_price(stop)));
            }
            None => {
                form.push(("type", "market".to_string()));
                form.push(("duration", "day".to_string()));
            }
        }

        let path = self.account_path(mode, "/orders")?;
        let builder = self.request(mode, Method::POST, &path).await?.form(&form);
        let resp: OrderResponse = self.send_json(mode, builder, "order").await?;
        let order_id = Self::order_id(resp, symbol)?;

        info!(
            broker = BROKER_NAME,
            order_id = %order_id,
            symbol,
            side = %side,
            shares,
            stop = ?stop_price,
            "Tradier order accepted"
        );

        Ok(OrderReceipt {
            order_id,
            symbol: symbol.to_string(),
            side,
            quantity: shares as f64,
        })
    }
}

#[async_trait]
impl Broker for TradierClient {
    async fn get_account_balances(&self, mode: TradingMode) -> Result<AccountBalances> {
        let path = self.account_path(mode, "/balances")?;
        let builder = self.request(mode, Method::GET, &path).await?;
        let resp: BalancesResponse = self.send_json(mode, builder, "balances").await?;
        let b = resp.balances;
        Ok(AccountBalances {
            equity: b.total_equity,
            cash: b.total_cash,
            buying_power: b.buying_power(),
        })
    }

    async fn get_positions(&self, mode: TradingMode) -> Result<Vec<BrokerPosition>> {
        let path = self.account_path(mode, "/positions")?;
        let builder = self.request(mode, Method::GET, &path).await?;
        let resp: PositionsResponse = self.send_json(mode, builder, "positions").await?;
        Ok(parse_positions(resp))
    }

    async fn get_quote(&self, mode: TradingMode, symbol: &str) -> Result<f64> {
        let path = format!("/v1/markets/quotes?symbols={}", urlencoding::encode(symbol));
        let builder = self.request(mode, Method::GET, &path).await?;
        let resp: QuotesResponse = self.send_json(mode, builder, "quote").await?;

        let last = resp
            .quotes
            .quote
            .map(OneOrMany::into_vec)
            .unwrap_or_default()
            .into_iter()
            .find(|q| q.symbol.eq_ignore_ascii_case(symbol))
            .and_then(|q| q.last)
            .unwrap_or(0.0);

        if last <= 0.0 || !last.is_finite() {
            return Err(CdemError::InvalidQuote(symbol.to_string()).into());
        }
        Ok(last)
    }

    async fn submit_market_order(
        &self,
        mode: TradingMode,
        symbol: &str,
        side: OrderSide,
        quantity: OrderQuantity,
    ) -> Result<OrderReceipt> {
        let shares = match quantity {
            OrderQuantity::Shares(q) => whole_shares(q),
            OrderQuantity::Notional(amount) => {
                let price = self.get_quote(mode, symbol).await?;
                whole_shares(amount / price)
            }
        };
        if shares == 0 {
            warn!(symbol, quantity = %quantity, "Order quantity rounds to zero shares");
            return Err(CdemError::OrderRejected {
                symbol: symbol.to_string(),
                message: format!("{quantity} is less than one whole share"),
            }
            .into());
        }
        self.place_order(mode, symbol, side, shares, None).await
    }

    async fn submit_stop_order(
        &self,
        mode: TradingMode,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
    ) -> Result<OrderReceipt> {
        let shares = whole_shares(quantity);
        if shares == 0 || stop_price <= 0.0 {
            return Err(CdemError::OrderRejected {
                symbol: symbol.to_string(),
                message: format!("invalid stop order: qty={quantity} stop={stop_price}"),
            }
            .into());
        }
        self.place_order(mode, symbol, side, shares, Some(stop_price)).await
    }

    async fn modify_stop_order(&self, mode: TradingMode, order_id: &str, stop_price: f64) -> Result<()> {
        let path = self.account_path(mode, &format!("/orders/{order_id}"))?;
        let form = [
            ("type", "stop".to_string()),
            ("duration", "gtc".to_string()),
            ("stop", format_price(stop_price)),
        ];
        let builder = self.request(mode, Method::PUT, &path).await?.form(&form);
        let resp: OrderResponse = self.send_json(mode, builder, "modify order").await?;
        Self::order_id(resp, order_id)?;
        info!(broker = BROKER_NAME, order_id, stop = %format_price(stop_price), "Stop order modified");
        Ok(())
    }

    async fn cancel_order(&self, mode: TradingMode, order_id: &str) -> Result<()> {
        let path = self.account_path(mode, &format!("/orders/{order_id}"))?;
        let builder = self.request(mode, Method::DELETE, &path).await?;
        let resp: OrderResponse = self.send_json(mode, builder, "cancel order").await?;
        Self::order_id(resp, order_id)?;
        info!(broker = BROKER_NAME, order_id, "Order cancelled");
        Ok(())
    }

    fn name(&self) -> &str {
        BROKER_NAME
    }
}

// ---------------------------------------------------------------------------
// Wire formatting
// ---------------------------------------------------------------------------

fn parse_positions(resp: PositionsResponse) -> Vec<BrokerPosition> {
    match resp.positions {
        Some(PositionsField::Held { position }) => position
            .into_vec()
            .into_iter()
            .map(|p| BrokerPosition {
                symbol: p.symbol,
                quantity: p.quantity,
                cost_basis: p.cost_basis,
            })
            .collect(),
        Some(PositionsField::Empty(_)) | None => Vec::new(),
    }
}

/// Round a share quantity down to a whole number.
pub fn whole_shares(quantity: f64) -> u64 {
    if !quantity.is_finite() || quantity <= 0.0 {
        return 0;
    }
    Decimal::from_f64(quantity)
        .map(|d| d.trunc())
        .and_then(|d| d.to_u64())
        .unwrap_or(0)
}

/// Price as a two-decimal string, rounded half away from zero.
pub fn format_price(price: f64) -> String {
    Decimal::from_f64(price)
        .map(|d| d.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
        .map(|d| format!("{d:.2}"))
        .unwrap_or_else(|| format!("{price:.2}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
