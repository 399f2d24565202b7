//! Trade lifecycle manager.
//!
//! Turns a Good consensus into a sized, stop-protected position, marks
//! open positions every cycle, trails their stops, exits them around the
//! earnings reaction, and keeps idle cash parked in the configured
//! instrument.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::config::{AgentSettings, TradingConfig};
use crate::storage::earnings::EarningsHistory;
use crate::storage::Stores;
use crate::strategy::exit::{
    exit_date, exit_due, fallback_exit_due, market_date, market_time, parse_window_start,
    trailing_update,
};
use crate::strategy::risk::{active_exposure, check_exposure};
use crate::strategy::{plan_entry, RejectionReason};
use crate::types::{
    round_to, Consensus, ConsensusResult, OrderQuantity, OrderReceipt, OrderSide, Position,
    TradingMode,
};

// ---------------------------------------------------------------------------
// Settings and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Market-local time from which a due exit is executed.
    pub exit_window_start: NaiveTime,
    /// Days without an earnings record before a position is exited anyway.
    pub fallback_exit_days: i64,
}

impl LifecycleSettings {
    pub fn from_agent(agent: &AgentSettings) -> Result<Self> {
        Ok(Self {
            exit_window_start: parse_window_start(&agent.exit_window_start)?,
            fallback_exit_days: agent.fallback_exit_days,
        })
    }
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            exit_window_start: NaiveTime::from_hms_opt(15, 0, 0).unwrap_or(NaiveTime::MIN),
            fallback_exit_days: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Entered(Position),
    Skipped(RejectionReason),
}

/// What one monitoring pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorReport {
    pub checked: usize,
    /// Positions left untouched because their quote was unusable.
    pub skipped: usize,
    pub stops_raised: usize,
    pub exited: Vec<String>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct TradeLifecycleManager {
    broker: Arc<dyn Broker>,
    stores: Arc<Stores>,
    settings: LifecycleSettings,
}

impl TradeLifecycleManager {
    pub fn new(broker: Arc<dyn Broker>, stores: Arc<Stores>, settings: LifecycleSettings) -> Self {
        Self { broker, stores, settings }
    }

    // -- Entry -----------------------------------------------------------

    /// Open a position for a Good verdict, or report why not.
    pub async fn enter(&self, verdict: &ConsensusResult, config: &TradingConfig) -> Result<EntryOutcome> {
        let ticker = verdict.ticker.as_str();
        let mode = config.mode();

        if verdict.consensus != Consensus::Good {
            return Ok(self.skip(ticker, RejectionReason::NotGood));
        }
        if self.stores.positions.has_open(ticker)? {
            return Ok(self.skip(ticker, RejectionReason::AlreadyOpen));
        }
        if config.use_options {
            warn!(
                ticker,
                exp_weeks = config.option_exp_weeks,
                leverage = config.option_leverage,
                "Options entries are not implemented"
            );
            return Ok(self.skip(ticker, RejectionReason::OptionsUnsupported));
        }

        let balances = self
            .broker
            .get_account_balances(mode)
            .await
            .with_context(|| format!("Failed to fetch balances for {ticker} entry"))?;
        info!(ticker, mode = %mode, balances = %balances, "Sizing entry");

        let price = match self.broker.get_quote(mode, ticker).await {
            Ok(p) if p > 0.0 && p.is_finite() => p,
            Ok(p) => return Ok(self.skip(ticker, RejectionReason::InvalidPrice { price: p })),
            Err(e) => {
                warn!(ticker, error = %e, "Quote unavailable");
                return Ok(self.skip(ticker, RejectionReason::InvalidPrice { price: 0.0 }));
            }
        };

        let plan = match plan_entry(&balances, price, config) {
            Ok(plan) => plan,
            Err(reason) => return Ok(self.skip(ticker, reason)),
        };

        let open = self.stores.positions.open_positions()?;
        let current = active_exposure(&open, balances.equity);
        let exposure_after =
            match check_exposure(current, plan.required_amount, balances.equity, config.max_exposure) {
                Ok(e) => e,
                Err(reason) => return Ok(self.skip(ticker, reason)),
            };

        let shares = plan.whole_shares();
        if shares < 1.0 {
            return Ok(self.skip(ticker, RejectionReason::DegenerateSize { size: plan.position_size }));
        }

        if config.sp_on && balances.cash < plan.required_amount {
            let shortfall = plan.required_amount - balances.cash;
            info!(
                ticker,
                shortfall = format!("${shortfall:.2}"),
                target = %config.idle_capital_target,
                "Freeing idle capital for entry"
            );
            if let Err(e) = self.manage_idle(shortfall, OrderSide::Sell, config).await {
                warn!(ticker, error = %e, "Failed to free idle capital, entering anyway");
            }
        }

        let receipt = self
            .broker
            .submit_market_order(mode, ticker, OrderSide::Buy, OrderQuantity::Shares(shares))
            .await
            .with_context(|| format!("Market buy failed for {ticker}"))?;
        let quantity = receipt.quantity;
        info!(
            ticker,
            order = %receipt,
            price = format!("${price:.2}"),
            risk = format!("${:.2}", plan.risk_amount),
            exposure = format!("{:.1}%", exposure_after * 100.0),
            "Entered position"
        );

        let (stop_price, stop_order_id) = match self
            .broker
            .submit_stop_order(mode, ticker, OrderSide::Sell, quantity, plan.stop_price)
            .await
        {
            Ok(stop) => {
                info!(ticker, order_id = %stop.order_id, stop = format!("${:.2}", plan.stop_price), "Protective stop placed");
                (Some(plan.stop_price), Some(stop.order_id))
            }
            Err(e) => {
                error!(ticker, quantity, error = %e, "UNPROTECTED: protective stop order failed");
                (None, None)
            }
        };

        let position = Position::open(ticker, quantity, price, stop_price, stop_order_id, Utc::now());
        self.stores.positions.append(&position)?;
        Ok(EntryOutcome::Entered(position))
    }

    fn skip(&self, ticker: &str, reason: RejectionReason) -> EntryOutcome {
        info!(ticker, reason = %reason, "Skipping entry");
        EntryOutcome::Skipped(reason)
    }

    // -- Monitoring ------------------------------------------------------

    /// Mark, trail and (when due) exit every open position.
    pub async fn monitor(&self, now: DateTime<Utc>, config: &TradingConfig) -> Result<MonitorReport> {
        let mut report = MonitorReport::default();
        let open = self.stores.positions.open_positions()?;
        if open.is_empty() {
            debug!("No open positions to monitor");
            return Ok(report);
        }

        let mode = config.mode();
        let history = self.stores.earnings.load()?;
        let mut changed = Vec::with_capacity(open.len());

        for mut position in open {
            report.checked += 1;
            let ticker = position.ticker.clone();

            let price = match self.broker.get_quote(mode, &ticker).await {
                Ok(p) if p > 0.0 && p.is_finite() => p,
                Ok(p) => {
                    warn!(ticker = %ticker, price = p, "Invalid quote, skipping position");
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(ticker = %ticker, error = %e, "Quote failed, skipping position");
                    report.skipped += 1;
                    continue;
                }
            };
            position.mark(price);
            debug!(
                ticker = %ticker,
                price = format!("${price:.2}"),
                gain = format!("{:.2}%", position.gain_pct() * 100.0),
                pnl = format!("${:.2}", position.pnl),
                "Position marked"
            );

            if let Some(update) = trailing_update(
                position.entry_price,
                price,
                position.high_price,
                config.trailing_trigger,
                config.trailing_pct,
            ) {
                position.high_price = Some(update.high_price);
                if position.stop_price.map_or(true, |s| update.stop_price > s)
                    && self.raise_stop(&mut position, update.stop_price, mode).await
                {
                    report.stops_raised += 1;
                }
            }

            if self.exit_is_due(&position, &history, now)? {
                match self.exit(&mut position, price, config).await {
                    Ok(()) => report.exited.push(ticker.clone()),
                    Err(e) => error!(ticker = %ticker, error = %e, "Exit failed, position stays open"),
                }
            }

            changed.push(position);
        }

        self.persist(&changed)?;
        info!(
            checked = report.checked,
            skipped = report.skipped,
            stops_raised = report.stops_raised,
            exited = report.exited.len(),
            "Monitoring pass complete"
        );
        Ok(report)
    }

    /// Move the live stop to `new_stop`, placing one if the position has none.
    async fn raise_stop(&self, position: &mut Position, new_stop: f64, mode: TradingMode) -> bool {
        let ticker = position.ticker.clone();
        let previous = position.stop_price;

        let result = match position.stop_order_id.as_deref() {
            Some(order_id) => self.broker.modify_stop_order(mode, order_id, new_stop).await,
            None => self
                .broker
                .submit_stop_order(mode, &ticker, OrderSide::Sell, position.position_size, new_stop)
                .await
                .map(|receipt| position.stop_order_id = Some(receipt.order_id)),
        };

        match result {
            Ok(()) => {
                position.stop_price = Some(new_stop);
                info!(
                    ticker = %ticker,
                    high = format!("${:.2}", position.high_price.unwrap_or(position.current_price)),
                    from = ?previous,
                    to = format!("${new_stop:.2}"),
                    "Trailing stop raised"
                );
                true
            }
            Err(e) => {
                warn!(ticker = %ticker, stop = new_stop, error = %e, "Failed to raise trailing stop");
                false
            }
        }
    }

    fn exit_is_due(&self, position: &Position, history: &EarningsHistory, now: DateTime<Utc>) -> Result<bool> {
        if let Some(entry) = history.get(&position.ticker) {
            let exit_on = exit_date(&entry.event());
            return Ok(exit_due(market_time(now), exit_on, self.settings.exit_window_start));
        }

        let reference = match self.stores.sentiment.latest_for(&position.ticker)? {
            Some(record) => market_date(record.timestamp),
            None => market_date(position.timestamp),
        };
        let due = fallback_exit_due(market_date(now), reference, self.settings.fallback_exit_days);
        if due {
            info!(ticker = %position.ticker, since = %reference, "No earnings record, fallback exit due");
        }
        Ok(due)
    }

    /// Close `position` at `price`: cancel its stop, sell, persist, and park
    /// the proceeds.
    pub async fn exit(&self, position: &mut Position, price: f64, config: &TradingConfig) -> Result<()> {
        let mode = config.mode();
        let ticker = position.ticker.clone();

        // Level of a stop cancelled here, to put back if the sell fails.
        let mut cancelled_stop = None;
        if let Some(order_id) = position.stop_order_id.clone() {
            match self.broker.cancel_order(mode, &order_id).await {
                Ok(()) => {
                    position.stop_order_id = None;
                    cancelled_stop = position.stop_price.take();
                }
                Err(e) => warn!(ticker = %ticker, order_id = %order_id, error = %e, "Failed to cancel protective stop"),
            }
        }

        let receipt = match self
            .broker
            .submit_market_order(
                mode,
                &ticker,
                OrderSide::Sell,
                OrderQuantity::Shares(position.position_size),
            )
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                if let Some(stop) = cancelled_stop {
                    self.restore_stop(position, stop, mode).await;
                }
                return Err(e).with_context(|| format!("Market sell failed for {ticker}"));
            }
        };

        position.close(price);
        info!(
            ticker = %ticker,
            order = %receipt,
            entry = format!("${:.2}", position.entry_price),
            exit = format!("${price:.2}"),
            pnl = format!("${:.2}", position.pnl),
            "Exited position"
        );
        self.persist(std::slice::from_ref(position))?;

        if config.sp_on {
            let freed = position.position_size * price;
            if let Err(e) = self.manage_idle(freed, OrderSide::Buy, config).await {
                warn!(ticker = %ticker, error = %e, "Failed to reinvest exit proceeds");
            }
        }
        Ok(())
    }

    /// Re-place a stop cancelled ahead of an exit sell that then failed.
    async fn restore_stop(&self, position: &mut Position, stop: f64, mode: TradingMode) {
        let ticker = position.ticker.clone();
        match self
            .broker
            .submit_stop_order(mode, &ticker, OrderSide::Sell, position.position_size, stop)
            .await
        {
            Ok(receipt) => {
                warn!(ticker = %ticker, order_id = %receipt.order_id, stop = format!("${stop:.2}"), "Exit failed, protective stop restored");
                position.stop_order_id = Some(receipt.order_id);
                position.stop_price = Some(stop);
            }
            Err(e) => {
                error!(ticker = %ticker, stop, error = %e, "UNPROTECTED: exit failed and protective stop could not be restored");
            }
        }
    }

    /// Write `updated` over the stored rows with the same ticker and open time.
    fn persist(&self, updated: &[Position]) -> Result<()> {
        if updated.is_empty() {
            return Ok(());
        }
        self.stores.positions.update(|rows| {
            for row in rows.iter_mut() {
                if let Some(new) = updated
                    .iter()
                    .find(|p| p.ticker == row.ticker && p.timestamp == row.timestamp)
                {
                    *row = new.clone();
                }
            }
            Ok(())
        })
    }

    // -- Idle capital ----------------------------------------------------

    /// Buy or sell `amount` dollars of the idle-capital instrument.
    ///
    /// Sells are capped at the value currently held. Returns `None` when
    /// there was nothing to trade.
    pub async fn manage_idle(
        &self,
        amount: f64,
        side: OrderSide,
        config: &TradingConfig,
    ) -> Result<Option<OrderReceipt>> {
        let mode = config.mode();
        let symbol = config.idle_capital_target.as_str();

        let price = self.broker.get_quote(mode, symbol).await?;
        if price <= 0.0 {
            warn!(symbol, price, "Invalid idle-capital quote, skipping");
            return Ok(None);
        }

        let amount = match side {
            OrderSide::Buy => amount,
            OrderSide::Sell => {
                let held = self
                    .broker
                    .get_position(mode, symbol)
                    .await?
                    .map(|p| p.quantity * price)
                    .unwrap_or(0.0);
                amount.min(held)
            }
        };
        let amount = round_to(amount, 2);
        if amount <= 0.0 {
            debug!(symbol, side = %side, "Nothing to trade in idle capital");
            return Ok(None);
        }

        let receipt = self
            .broker
            .submit_market_order(mode, symbol, side, OrderQuantity::Notional(amount))
            .await
            .with_context(|| format!("Idle-capital {side} of {symbol} failed"))?;
        info!(symbol, side = %side, amount = format!("${amount:.2}"), order = %receipt, "Idle capital rebalanced");
        Ok(Some(receipt))
    }

    /// React to the idle-capital switch: park all cash when turned on,
    /// liquidate the holding when turned off. No-op while trades are open.
    pub async fn handle_idle_toggle(&self, config: &TradingConfig) -> Result<()> {
        let open = self.stores.positions.open_positions()?;
        if !open.is_empty() {
            warn!(open = open.len(), "Cannot toggle idle capital: active trades open");
            return Ok(());
        }

        let mode = config.mode();
        let symbol = config.idle_capital_target.as_str();
        if config.sp_on {
            let balances = self.broker.get_account_balances(mode).await?;
            if balances.cash > 0.0 {
                self.manage_idle(balances.cash, OrderSide::Buy, config).await?;
            }
        } else if let Some(holding) = self.broker.get_position(mode, symbol).await? {
            if holding.quantity > 0.0 {
                let receipt = self
                    .broker
                    .submit_market_order(mode, symbol, OrderSide::Sell, OrderQuantity::Shares(holding.quantity))
                    .await
                    .with_context(|| format!("Failed to liquidate {symbol}"))?;
                info!(symbol, order = %receipt, "Idle capital moved to cash");
            }
        }
        Ok(())
    }

    /// Park cash at startup when the account holds nothing yet.
    pub async fn seed_idle(&self, config: &TradingConfig) -> Result<bool> {
        if !config.sp_on {
            return Ok(false);
        }
        let mode = config.mode();
        let balances = self.broker.get_account_balances(mode).await?;
        let positions = self.broker.get_positions(mode).await?;

        if balances.cash > 0.0 && positions.is_empty() && balances.buying_power >= balances.cash {
            let amount = balances.cash.min(balances.buying_power);
            info!(
                target = %config.idle_capital_target,
                amount = format!("${amount:.2}"),
                "Seeding idle capital"
            );
            return Ok(self.manage_idle(amount, OrderSide::Buy, config).await?.is_some());
        }
        debug!(positions = positions.len(), cash = balances.cash, "Idle capital seed not needed");
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
