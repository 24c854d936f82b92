// src/utils/precision.rs
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::types::PositionSide;

/// Rounds a quantity DOWN to a multiple of `step_size`.
/// amount=10.999, step=1.0 -> 10.0
pub fn normalize_quantity(amount: Decimal, step_size: Decimal) -> Decimal {
    if step_size.is_zero() {
        return amount;
    }
    (amount / step_size).floor() * step_size
}

/// Rounds a price to the NEAREST multiple of `tick_size`.
/// price=100.16, tick=0.1 -> 100.2
pub fn normalize_price(price: Decimal, tick_size: Decimal) -> Decimal {
    if tick_size.is_zero() {
        return price;
    }
    (price / tick_size).round() * tick_size
}

/// Converts an indicator price into a `Decimal`; `None` for NaN/inf or non-positive values.
/// Prices too small for `Decimal` round to zero and are rejected as well.
pub fn price_to_decimal(price: f64) -> Option<Decimal> {
    if !price.is_finite() || price <= 0.0 {
        return None;
    }
    Decimal::from_f64(price).filter(|d| *d > Decimal::ZERO)
}

/// P&L of a position marked at `price`, as a fraction of the entry price.
/// LONG: (price - entry) / entry, SHORT: (entry - price) / entry.
pub fn pnl_fraction(side: PositionSide, entry_price: Decimal, price: Decimal) -> f64 {
    if entry_price.is_zero() {
        return 0.0;
    }
    let diff = match side {
        PositionSide::Long => price - entry_price,
        PositionSide::Short => entry_price - price,
        PositionSide::Flat => return 0.0,
    };
    (diff / entry_price).to_f64().unwrap_or(0.0)
}

/// Realized P&L in quote currency for `quantity` closed at `price`.
pub fn realized_pnl(side: PositionSide, entry_price: Decimal, price: Decimal, quantity: Decimal) -> Decimal {
    match side {
        PositionSide::Long => (price - entry_price) * quantity,
        PositionSide::Short => (entry_price - price) * quantity,
        PositionSide::Flat => Decimal::ZERO,
    }
}
