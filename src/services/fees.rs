//! Fee and margin arithmetic.
//!
//! Pure functions over prices and quantities. Non-finite or non-positive
//! inputs are treated as zero exposure, so nothing here can fail.

use serde::{Deserialize, Serialize};

/// Taker fee charged on notional, both on open and on close.
pub const DEFAULT_FEE_RATE: f64 = 0.0004;

/// Leverage applied to margin requirements.
pub const DEFAULT_LEVERAGE: f64 = 1.0;

/// Slack for floating-point noise in balance comparisons.
pub const BALANCE_EPSILON: f64 = 1e-9;

/// Fee rate and leverage used by both ledgers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeSchedule {
    pub fee_rate: f64,
    pub leverage: f64,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            fee_rate: DEFAULT_FEE_RATE,
            leverage: DEFAULT_LEVERAGE,
        }
    }
}

impl FeeSchedule {
    pub fn new(fee_rate: f64, leverage: f64) -> Self {
        Self { fee_rate, leverage }
    }

    /// `price * qty`, or 0 unless both are finite and positive.
    pub fn notional(&self, price: f64, qty: f64) -> f64 {
        notional(price, qty)
    }

    /// Margin locked by a position of the given notional.
    pub fn margin_requirement(&self, notional: f64) -> f64 {
        if !notional.is_finite() || notional <= 0.0 {
            return 0.0;
        }
        if !self.leverage.is_finite() || self.leverage <= 0.0 {
            return notional;
        }
        notional / self.leverage
    }

    /// Fee rate actually applied; a non-finite or negative rate charges nothing.
    pub fn effective_rate(&self) -> f64 {
        if self.fee_rate.is_finite() && self.fee_rate > 0.0 {
            self.fee_rate
        } else {
            0.0
        }
    }

    /// Fee charged on the given notional.
    pub fn fee(&self, notional: f64) -> f64 {
        if !notional.is_finite() || notional <= 0.0 {
            return 0.0;
        }
        notional * self.effective_rate()
    }

    /// Margin, fee and notional for an order at `price`.
    pub fn quote(&self, price: f64, qty: f64) -> OrderCost {
        let notional = self.notional(price, qty);
        OrderCost {
            notional,
            margin: self.margin_requirement(notional),
            fee: self.fee(notional),
        }
    }
}

/// Cost breakdown of opening an order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCost {
    pub notional: f64,
    pub margin: f64,
    pub fee: f64,
}

impl OrderCost {
    /// Cash that must be free to open: margin plus fee.
    pub fn required(&self) -> f64 {
        self.margin + self.fee
    }
}

/// `price * qty`, or 0 unless both are finite and positive.
pub fn notional(price: f64, qty: f64) -> f64 {
    if price.is_finite() && qty.is_finite() && price > 0.0 && qty > 0.0 {
        price * qty
    } else {
        0.0
    }
}
