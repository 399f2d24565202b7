//! Risk-based position sizing.
//!
//! The amount at risk is a fixed fraction of equity (capped by buying
//! power). Dividing it by the per-share loss to the stop, plus a slippage
//! buffer, gives the share count.

use tracing::debug;

use super::risk::RejectionReason;
use crate::config::TradingConfig;
use crate::types::{round_to, AccountBalances};

/// Fraction of price added to the per-share risk to absorb slippage.
pub const SLIPPAGE_PCT: f64 = 0.005;

/// Sized entry, before the exposure check and whole-share rounding.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryPlan {
    pub risk_amount: f64,
    pub price: f64,
    /// Protective stop, rounded to cents.
    pub stop_price: f64,
    pub slippage: f64,
    /// Fractional share count.
    pub position_size: f64,
    pub required_amount: f64,
}

impl EntryPlan {
    /// Share count actually submitted: the fractional size rounded down.
    pub fn whole_shares(&self) -> f64 {
        self.position_size.floor()
    }
}

/// Amount at risk: `min(equity × risk_per_trade, buying_power)`.
pub fn risk_amount(balances: &AccountBalances, risk_per_trade: f64) -> f64 {
    (balances.equity * risk_per_trade).min(balances.buying_power)
}

/// Stop price `price × (1 − stop_loss_pct)` rounded to cents.
pub fn stop_price(price: f64, stop_loss_pct: f64) -> f64 {
    round_to(price * (1.0 - stop_loss_pct), 2)
}

/// Size an entry at `price`, or say why it cannot be taken.
pub fn plan_entry(
    balances: &AccountBalances,
    price: f64,
    config: &TradingConfig,
) -> Result<EntryPlan, RejectionReason> {
    let risk_amount = risk_amount(balances, config.risk_per_trade);
    if risk_amount <= 0.0 || !risk_amount.is_finite() {
        return Err(RejectionReason::NoRiskBudget { risk_amount });
    }
    if price <= 0.0 || !price.is_finite() {
        return Err(RejectionReason::InvalidPrice { price });
    }

    let stop = stop_price(price, config.stop_loss_pct);
    let slippage = price * SLIPPAGE_PCT;
    let per_share_risk = price - stop + slippage;
    if per_share_risk <= 0.0 {
        return Err(RejectionReason::DegenerateSize { size: 0.0 });
    }

    let position_size = risk_amount / per_share_risk;
    if position_size <= 0.0 || !position_size.is_finite() {
        return Err(RejectionReason::DegenerateSize { size: position_size });
    }

    let required_amount = position_size * price;
    if required_amount > balances.buying_power {
        return Err(RejectionReason::InsufficientBuyingPower {
            required: required_amount,
            available: balances.buying_power,
        });
    }

    debug!(
        risk = format!("${risk_amount:.2}"),
        price = format!("${price:.2}"),
        stop = format!("${stop:.2}"),
        size = format!("{position_size:.4}"),
        required = format!("${required_amount:.2}"),
        "Entry sized"
    );

    Ok(EntryPlan {
        risk_amount,
        price,
        stop_price: stop,
        slippage,
        position_size,
        required_amount,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
