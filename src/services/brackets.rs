//! Bracket and order validation.
//!
//! Shared by the server repository and the client replica; runs at order
//! submission, at fill time and on every bracket edit.

use crate::types::PositionSide;
use thiserror::Error;

/// Rejections raised before any state is touched.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Quantity must be positive, got {0}")]
    InvalidQuantity(f64),

    #[error("Price must be positive, got {0}")]
    InvalidPrice(f64),

    #[error("Symbol must not be empty")]
    EmptySymbol,

    #[error("Stop loss {stop_loss} must be {expected} entry price {entry_price} for a {side} position")]
    StopLossOrdering {
        side: PositionSide,
        entry_price: f64,
        stop_loss: f64,
        expected: &'static str,
    },

    #[error("Take profit {take_profit} must be {expected} entry price {entry_price} for a {side} position")]
    TakeProfitOrdering {
        side: PositionSide,
        entry_price: f64,
        take_profit: f64,
        expected: &'static str,
    },

    #[error("{0} must be a finite positive price")]
    InvalidBracket(&'static str),
}

/// Check stop-loss / take-profit placement relative to the entry.
///
/// Long: `stop_loss <= entry <= take_profit`. Short: inverted.
pub fn validate_brackets(
    side: PositionSide,
    entry_price: f64,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
) -> Result<(), ValidationError> {
    if let Some(sl) = stop_loss {
        if !sl.is_finite() || sl <= 0.0 {
            return Err(ValidationError::InvalidBracket("Stop loss"));
        }
        let ok = match side {
            PositionSide::Long => sl <= entry_price,
            PositionSide::Short => sl >= entry_price,
        };
        if !ok {
            return Err(ValidationError::StopLossOrdering {
                side,
                entry_price,
                stop_loss: sl,
                expected: match side {
                    PositionSide::Long => "at or below",
                    PositionSide::Short => "at or above",
                },
            });
        }
    }

    if let Some(tp) = take_profit {
        if !tp.is_finite() || tp <= 0.0 {
            return Err(ValidationError::InvalidBracket("Take profit"));
        }
        let ok = match side {
            PositionSide::Long => tp >= entry_price,
            PositionSide::Short => tp <= entry_price,
        };
        if !ok {
            return Err(ValidationError::TakeProfitOrdering {
                side,
                entry_price,
                take_profit: tp,
                expected: match side {
                    PositionSide::Long => "at or above",
                    PositionSide::Short => "at or below",
                },
            });
        }
    }

    Ok(())
}

/// Quantity and price must both be finite and positive.
pub fn validate_order(qty: f64, price: f64) -> Result<(), ValidationError> {
    if !qty.is_finite() || qty <= 0.0 {
        return Err(ValidationError::InvalidQuantity(qty));
    }
    if !price.is_finite() || price <= 0.0 {
        return Err(ValidationError::InvalidPrice(price));
    }
    Ok(())
}
