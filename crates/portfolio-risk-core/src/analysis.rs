use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::model::{OptionType, Position, CONTRACT_MULTIPLIER};
use crate::types::Money;

// ---------------------------------------------------------------------------
// Breakevens
// ---------------------------------------------------------------------------

/// Find breakeven prices by scanning the combined P&L curve for sign changes
/// between adjacent samples and linearly interpolating the zero crossing.
///
/// A sample that is exactly zero counts only when the adjacent samples
/// change sign around it — a flat zero region is not a crossing.
pub fn find_breakevens(price_points: &[Money], pnl_values: &[Money]) -> Vec<Money> {
    let n = price_points.len().min(pnl_values.len());
    let mut breakevens: Vec<Money> = Vec::new();

    for i in 0..n {
        if pnl_values[i].is_zero() {
            // Zero sample: a breakeven only if bounded by a sign change
            if i > 0 && i + 1 < n {
                let prev = pnl_values[i - 1];
                let next = pnl_values[i + 1];
                if !prev.is_zero() && !next.is_zero() && (prev > Decimal::ZERO) != (next > Decimal::ZERO) {
                    let price = price_points[i];
                    if !breakevens.contains(&price) {
                        breakevens.push(price);
                    }
                }
            }
            continue;
        }

        if i == 0 {
            continue;
        }

        let prev = pnl_values[i - 1];
        let curr = pnl_values[i];
        if prev.is_zero() {
            continue;
        }
        if (prev > Decimal::ZERO) != (curr > Decimal::ZERO) {
            // Linear interpolation: t = -prev / (curr - prev)
            let denom = curr - prev;
            if !denom.is_zero() {
                let t = -prev / denom;
                let be = price_points[i - 1] + t * (price_points[i] - price_points[i - 1]);
                if !breakevens.contains(&be) {
                    breakevens.push(be);
                }
            }
        }
    }

    breakevens.sort();
    breakevens
}

// ---------------------------------------------------------------------------
// Sampled extremes
// ---------------------------------------------------------------------------

/// Extreme P&L values and the prices at which they were observed. These are
/// sampled extrema: resolution is bounded by the grid density, and a true
/// closed-form maximum between two samples is not recovered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampledExtremes {
    pub max_profit: Money,
    pub max_profit_price: Money,
    pub max_loss: Money,
    pub max_loss_price: Money,
}

pub fn sampled_extremes(price_points: &[Money], pnl_values: &[Money]) -> Option<SampledExtremes> {
    let n = price_points.len().min(pnl_values.len());
    if n == 0 {
        return None;
    }

    let mut max_idx = 0;
    let mut min_idx = 0;
    for i in 1..n {
        if pnl_values[i] > pnl_values[max_idx] {
            max_idx = i;
        }
        if pnl_values[i] < pnl_values[min_idx] {
            min_idx = i;
        }
    }

    Some(SampledExtremes {
        max_profit: pnl_values[max_idx],
        max_profit_price: price_points[max_idx],
        max_loss: pnl_values[min_idx],
        max_loss_price: price_points[min_idx],
    })
}

// ---------------------------------------------------------------------------
// Asymptotic behavior
// ---------------------------------------------------------------------------

/// Unbounded-P&L classification from the aggregate per-share delta of the
/// full position set in the price→∞ and price→0 limits.
///
/// The finite sampled curve's edges are arbitrary and mislead on strategies
/// like a stock plus many short calls; the limit deltas are exact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsymptoticBehavior {
    /// Net share-equivalent delta as price → ∞.
    pub net_delta_high: Decimal,
    /// Net share-equivalent delta as price → 0.
    pub net_delta_low: Decimal,
    pub unbounded_profit_high: bool,
    pub unbounded_loss_high: bool,
    pub unbounded_profit_low: bool,
    pub unbounded_loss_low: bool,
}

impl AsymptoticBehavior {
    pub fn unbounded_profit(&self) -> bool {
        self.unbounded_profit_high || self.unbounded_profit_low
    }

    pub fn unbounded_loss(&self) -> bool {
        self.unbounded_loss_high || self.unbounded_loss_low
    }
}

/// In the limits, stock delta is ±1 per share; a call's delta goes to 1 as
/// price → ∞ and 0 as price → 0, a put's to 0 and −1 respectively, each
/// scaled by quantity × 100.
pub fn asymptotic_behavior(positions: &[Position]) -> AsymptoticBehavior {
    let mut net_delta_high = Decimal::ZERO;
    let mut net_delta_low = Decimal::ZERO;

    for position in positions {
        match position {
            Position::Stock(stock) => {
                let shares = Decimal::from(stock.quantity);
                net_delta_high += shares;
                net_delta_low += shares;
            }
            Position::Option(option) => {
                let contracts = Decimal::from(option.quantity) * CONTRACT_MULTIPLIER;
                match option.option_type {
                    OptionType::Call => net_delta_high += contracts,
                    OptionType::Put => net_delta_low -= contracts,
                }
            }
        }
    }

    AsymptoticBehavior {
        net_delta_high,
        net_delta_low,
        // Positive net delta at the high extreme: P&L rises without bound
        unbounded_profit_high: net_delta_high > Decimal::ZERO,
        unbounded_loss_high: net_delta_high < Decimal::ZERO,
        // At the low extreme the roles swap: negative net delta profits as
        // the price collapses
        unbounded_profit_low: net_delta_low < Decimal::ZERO,
        unbounded_loss_low: net_delta_low > Decimal::ZERO,
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PnlSummary {
    pub breakeven_points: Vec<Money>,
    pub max_profit: Money,
    pub max_profit_price: Money,
    pub max_loss: Money,
    pub max_loss_price: Money,
    /// Combined P&L interpolated at the current underlying price.
    pub current_pnl: Money,
    pub unbounded_profit: bool,
    pub unbounded_loss: bool,
    pub asymptotic: AsymptoticBehavior,
}

/// Linear interpolation of the curve at an arbitrary price; clamps to the
/// nearest endpoint outside the grid.
pub fn interpolate_at(price_points: &[Money], pnl_values: &[Money], price: Money) -> Money {
    let n = price_points.len().min(pnl_values.len());
    if n == 0 {
        return Decimal::ZERO;
    }
    if price <= price_points[0] {
        return pnl_values[0];
    }
    if price >= price_points[n - 1] {
        return pnl_values[n - 1];
    }
    for i in 1..n {
        if price_points[i] >= price {
            let span = price_points[i] - price_points[i - 1];
            if span.is_zero() {
                return pnl_values[i];
            }
            let t = (price - price_points[i - 1]) / span;
            return pnl_values[i - 1] + t * (pnl_values[i] - pnl_values[i - 1]);
        }
    }
    pnl_values[n - 1]
}

/// Assemble the strategy summary from the sampled combined curve and the
/// full position set (asymptotics never rely on the truncated grid).
pub fn summarize_curve(
    price_points: &[Money],
    pnl_values: &[Money],
    positions: &[Position],
    current_price: Money,
) -> PnlSummary {
    let breakeven_points = find_breakevens(price_points, pnl_values);
    let extremes = sampled_extremes(price_points, pnl_values).unwrap_or(SampledExtremes {
        max_profit: Decimal::ZERO,
        max_profit_price: current_price,
        max_loss: Decimal::ZERO,
        max_loss_price: current_price,
    });
    let asymptotic = asymptotic_behavior(positions);
    let current_pnl = interpolate_at(price_points, pnl_values, current_price);

    PnlSummary {
        breakeven_points,
        max_profit: extremes.max_profit,
        max_profit_price: extremes.max_profit_price,
        max_loss: extremes.max_loss,
        max_loss_price: extremes.max_loss_price,
        current_pnl,
        unbounded_profit: asymptotic.unbounded_profit(),
        unbounded_loss: asymptotic.unbounded_loss(),
        asymptotic,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
