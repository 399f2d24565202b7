//! Risk gates.
//!
//! Every reason an entry can be refused is a `RejectionReason`. These are
//! business outcomes, logged and skipped until the next natural cycle,
//! never errors.

use std::fmt;

use crate::types::Position;

#[derive(Debug, Clone, PartialEq)]
pub enum RejectionReason {
    /// Verdict other than Good.
    NotGood,
    /// An open position for the ticker already exists.
    AlreadyOpen,
    /// Options-leveraged entries are not supported.
    OptionsUnsupported,
    /// `min(equity × risk_per_trade, buying_power)` is not positive.
    NoRiskBudget { risk_amount: f64 },
    /// Quote missing, zero or negative.
    InvalidPrice { price: f64 },
    /// Position size is not positive, or rounds down to zero whole shares.
    DegenerateSize { size: f64 },
    InsufficientBuyingPower { required: f64, available: f64 },
    /// Adding the trade would push exposure past the cap.
    ExposureCap { current: f64, added: f64, max: f64 },
    /// Account equity is zero or negative, so exposure is undefined.
    NoEquity,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::NotGood => write!(f, "consensus is not Good"),
            RejectionReason::AlreadyOpen => write!(f, "an open position already exists"),
            RejectionReason::OptionsUnsupported => {
                write!(f, "options entries are unsupported")
            }
            RejectionReason::NoRiskBudget { risk_amount } => {
                write!(f, "no risk amount available (${risk_amount:.2})")
            }
            RejectionReason::InvalidPrice { price } => write!(f, "invalid price ${price:.2}"),
            RejectionReason::DegenerateSize { size } => {
                write!(f, "degenerate position size {size:.4}")
            }
            RejectionReason::InsufficientBuyingPower { required, available } => write!(
                f,
                "insufficient buying power (${available:.2}) for required ${required:.2}"
            ),
            RejectionReason::ExposureCap { current, added, max } => write!(
                f,
                "would exceed max exposure: {:.1}% + {:.1}% > {:.1}%",
                current * 100.0,
                added * 100.0,
                max * 100.0
            ),
            RejectionReason::NoEquity => write!(f, "account equity is not positive"),
        }
    }
}

/// Fraction of equity held in open active-strategy positions, valued at
/// their last observed price.
pub fn active_exposure(open_positions: &[Position], equity: f64) -> f64 {
    if equity <= 0.0 {
        return 0.0;
    }
    let value: f64 = open_positions
        .iter()
        .filter(|p| p.is_open())
        .map(Position::market_value)
        .sum();
    value / equity
}

/// Admit a trade of `required_amount` only if total exposure stays within
/// `max_exposure`. Returns the exposure after the trade.
pub fn check_exposure(
    current: f64,
    required_amount: f64,
    equity: f64,
    max_exposure: f64,
) -> Result<f64, RejectionReason> {
    if equity <= 0.0 {
        return Err(RejectionReason::NoEquity);
    }
    let added = required_amount / equity;
    if current + added > max_exposure {
        return Err(RejectionReason::ExposureCap { current, added, max: max_exposure });
    }
    Ok(current + added)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
