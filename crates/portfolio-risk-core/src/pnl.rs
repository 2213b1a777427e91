use chrono::NaiveDate;
use rayon::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::warn;

use crate::analysis::{summarize_curve, PnlSummary};
use crate::error::PortfolioError;
use crate::model::{OptionPosition, Position, StockPosition, CONTRACT_MULTIPLIER};
use crate::pricing::{american_option_price, position_volatility, year_fraction, PricingConfig};
use crate::types::*;
use crate::PortfolioResult;

// ---------------------------------------------------------------------------
// Input types
// ---------------------------------------------------------------------------

/// Which entry price P&L is measured against. One mode governs an entire
/// calculation; curves never mix modes between legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PnlMode {
    /// P&L relative to each position's current mark.
    MarkToMarket,
    /// P&L relative to each position's cost basis.
    CostBasis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PnlInput {
    /// Positions sharing one underlying.
    pub positions: Vec<Position>,
    /// Current price of the underlying.
    pub underlying_price: Money,
    /// Overrides the default grid of ±30% around the current price, widened
    /// to cover every strike at 0.8×/1.2×.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_range: Option<(Money, Money)>,
    /// Sample count across the range; defaults to 50.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_points: Option<u32>,
    pub mode: PnlMode,
    pub valuation_date: NaiveDate,
    #[serde(default)]
    pub config: PricingConfig,
}

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionPnl {
    /// Ticker for stock legs, the full description for option legs.
    pub label: String,
    pub pnl_values: Vec<Money>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PnlOutput {
    pub price_points: Vec<Money>,
    /// Combined strategy P&L: the elementwise sum of `individual_pnls`,
    /// always recomputed by summation so it stays consistent with the
    /// per-position detail.
    pub pnl_values: Vec<Money>,
    pub individual_pnls: Vec<PositionPnl>,
    /// Legs that could not be priced; excluded from the curves.
    pub skipped: Vec<String>,
    pub summary: PnlSummary,
}

// ---------------------------------------------------------------------------
// Grid construction
// ---------------------------------------------------------------------------

const DEFAULT_NUM_POINTS: u32 = 50;
const RANGE_WIDTH_FACTOR: Decimal = dec!(0.30);
const STRIKE_LOW_FACTOR: Decimal = dec!(0.8);
const STRIKE_HIGH_FACTOR: Decimal = dec!(1.2);
/// The tree cannot price at a zero spot; the grid floor is one cent.
const MIN_GRID_PRICE: Decimal = dec!(0.01);

fn default_price_range(positions: &[Position], current_price: Money) -> (Money, Money) {
    let width = current_price * RANGE_WIDTH_FACTOR;
    let mut low = current_price - width;
    let mut high = current_price + width;

    // Widen so every option strike sits comfortably inside the grid
    for position in positions {
        if let Position::Option(option) = position {
            low = low.min(option.strike * STRIKE_LOW_FACTOR);
            high = high.max(option.strike * STRIKE_HIGH_FACTOR);
        }
    }

    (low.max(MIN_GRID_PRICE), high)
}

fn build_price_grid(low: Money, high: Money, num_points: u32) -> Vec<Money> {
    let n = num_points.max(2);
    let step = (high - low) / Decimal::from(n - 1);
    (0..n).map(|i| low + step * Decimal::from(i)).collect()
}

// ---------------------------------------------------------------------------
// Per-position curves
// ---------------------------------------------------------------------------

fn stock_entry_price(stock: &StockPosition, mode: PnlMode) -> Money {
    match mode {
        PnlMode::MarkToMarket => stock.price,
        PnlMode::CostBasis => stock.cost_basis,
    }
}

fn option_entry_price(option: &OptionPosition, mode: PnlMode) -> Money {
    match mode {
        PnlMode::MarkToMarket => option.current_price,
        PnlMode::CostBasis => option.cost_basis,
    }
}

fn stock_pnl_curve(stock: &StockPosition, grid: &[Money], mode: PnlMode) -> Vec<Money> {
    let entry = stock_entry_price(stock, mode);
    let quantity = Decimal::from(stock.quantity);
    grid.iter().map(|price| (price - entry) * quantity).collect()
}

fn option_pnl_curve(
    option: &OptionPosition,
    grid: &[Money],
    mode: PnlMode,
    underlying_price: Money,
    valuation_date: NaiveDate,
    config: &PricingConfig,
) -> PortfolioResult<Vec<Money>> {
    let t = year_fraction(valuation_date, option.expiry);
    if t <= Decimal::ZERO {
        return Err(PortfolioError::PricingFailure {
            position: option.description.clone(),
            reason: "option is expired at the valuation date".into(),
        });
    }

    // Volatility is solved once at the current spot and held flat across
    // the grid, so the curve passes through ~zero P&L at the spot in
    // mark-to-market mode.
    let volatility = position_volatility(
        underlying_price,
        option.strike,
        t,
        option.current_price,
        option.option_type,
        config,
    );

    let entry = option_entry_price(option, mode);
    let quantity = Decimal::from(option.quantity);
    let mut curve = Vec::with_capacity(grid.len());
    for price in grid {
        let theoretical =
            american_option_price(*price, option.strike, t, volatility, option.option_type, config)
                .map_err(|e| PortfolioError::PricingFailure {
                    position: option.description.clone(),
                    reason: e.to_string(),
                })?;
        curve.push((theoretical - entry) * quantity * CONTRACT_MULTIPLIER);
    }
    Ok(curve)
}

fn position_label(position: &Position) -> String {
    match position {
        Position::Stock(s) => s.ticker.clone(),
        Position::Option(o) => o.description.clone(),
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Compute per-position and combined-strategy P&L across a price grid.
///
/// Option legs are repriced on the binomial tree at every grid point; legs
/// that fail to price are logged and dropped from the curves while the rest
/// of the strategy proceeds. The summary's unbounded-P&L flags come from the
/// full position set, never from the truncated grid.
pub fn calculate_pnl(input: &PnlInput) -> PortfolioResult<ComputationOutput<PnlOutput>> {
    let start = Instant::now();
    let mut warnings: Vec<String> = Vec::new();

    if input.positions.is_empty() {
        return Err(PortfolioError::InvalidInput {
            field: "positions".into(),
            reason: "at least one position is required".into(),
        });
    }
    if input.underlying_price <= Decimal::ZERO {
        return Err(PortfolioError::InvalidInput {
            field: "underlying_price".into(),
            reason: "must be positive".into(),
        });
    }

    let (low, high) = match input.price_range {
        Some((low, high)) => (low.max(MIN_GRID_PRICE), high),
        None => default_price_range(&input.positions, input.underlying_price),
    };
    if low >= high {
        return Err(PortfolioError::InvalidInput {
            field: "price_range".into(),
            reason: "low price must be less than high price".into(),
        });
    }
    let num_points = input.num_points.unwrap_or(DEFAULT_NUM_POINTS);
    if num_points < 2 {
        return Err(PortfolioError::InvalidInput {
            field: "num_points".into(),
            reason: "at least 2 sample points are required".into(),
        });
    }

    let grid = build_price_grid(low, high, num_points);

    // Each leg's curve is independent: fan out over the rayon pool and join
    // before summation.
    let curves: Vec<(String, PortfolioResult<Vec<Money>>)> = input
        .positions
        .par_iter()
        .map(|position| {
            let label = position_label(position);
            let curve = match position {
                Position::Stock(stock) => Ok(stock_pnl_curve(stock, &grid, input.mode)),
                Position::Option(option) => option_pnl_curve(
                    option,
                    &grid,
                    input.mode,
                    input.underlying_price,
                    input.valuation_date,
                    &input.config,
                ),
            };
            (label, curve)
        })
        .collect();

    let mut individual_pnls: Vec<PositionPnl> = Vec::new();
    let mut skipped: Vec<String> = Vec::new();
    for (label, curve) in curves {
        match curve {
            Ok(pnl_values) => individual_pnls.push(PositionPnl { label, pnl_values }),
            Err(e) => {
                warn!(position = %label, reason = %e, "skipping position in P&L curve");
                warnings.push(format!("Skipped {label}: {e}"));
                skipped.push(label);
            }
        }
    }

    if individual_pnls.is_empty() {
        return Err(PortfolioError::PricingFailure {
            position: "all positions".into(),
            reason: "every leg failed to price".into(),
        });
    }

    // Combined curve: elementwise sum, recomputed from the per-leg detail
    let mut pnl_values = vec![Decimal::ZERO; grid.len()];
    for position_pnl in &individual_pnls {
        for (total, v) in pnl_values.iter_mut().zip(position_pnl.pnl_values.iter()) {
            *total += v;
        }
    }

    let summary = summarize_curve(&grid, &pnl_values, &input.positions, input.underlying_price);

    let output = PnlOutput {
        price_points: grid,
        pnl_values,
        individual_pnls,
        skipped,
        summary,
    };

    let elapsed = start.elapsed().as_micros() as u64;
    let assumptions = serde_json::json!({
        "mode": format!("{:?}", input.mode),
        "valuation_date": input.valuation_date.to_string(),
        "price_range": format!("{low} - {high}"),
        "num_points": num_points,
        "risk_free_rate": input.config.risk_free_rate.to_string(),
        "tree_steps": input.config.tree_steps,
    });

    Ok(with_metadata(
        "Strategy P&L surface (CRR binomial repricing across price grid)",
        &assumptions,
        warnings,
        elapsed,
        output,
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
