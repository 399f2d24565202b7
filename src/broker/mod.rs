//! Brokerage integration.
//!
//! Defines the `Broker` trait consumed by the trade lifecycle manager and
//! the Tradier implementation. Every call names the trading mode it
//! targets; switching between paper and live never touches shared state.

pub mod tradier;

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{
    AccountBalances, BrokerPosition, OrderQuantity, OrderReceipt, OrderSide, TradingMode,
};

/// Abstraction over an equity brokerage.
///
/// Orders are treated as filled once the broker accepts them; partial
/// fills are not modelled.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_account_balances(&self, mode: TradingMode) -> Result<AccountBalances>;

    async fn get_positions(&self, mode: TradingMode) -> Result<Vec<BrokerPosition>>;

    /// Holding for a single symbol, if any.
    async fn get_position(&self, mode: TradingMode, symbol: &str) -> Result<Option<BrokerPosition>> {
        let positions = self.get_positions(mode).await?;
        Ok(positions.into_iter().find(|p| p.symbol == symbol))
    }

    /// Last traded price.
    async fn get_quote(&self, mode: TradingMode, symbol: &str) -> Result<f64>;

    async fn submit_market_order(
        &self,
        mode: TradingMode,
        symbol: &str,
        side: OrderSide,
        quantity: OrderQuantity,
    ) -> Result<OrderReceipt>;

    async fn submit_stop_order(
        &self,
        mode: TradingMode,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
    ) -> Result<OrderReceipt>;

    /// Move the trigger price of a resting stop order.
    async fn modify_stop_order(&self, mode: TradingMode, order_id: &str, stop_price: f64) -> Result<()>;

    async fn cancel_order(&self, mode: TradingMode, order_id: &str) -> Result<()>;

    /// Broker name for logging and identification.
    fn name(&self) -> &str;
}
