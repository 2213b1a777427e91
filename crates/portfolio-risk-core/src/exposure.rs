use chrono::NaiveDate;
use rayon::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::warn;

use crate::classify::is_cash_or_short_term;
use crate::error::PortfolioError;
use crate::model::*;
use crate::pricing::{
    option_delta, position_delta, position_volatility, year_fraction, PricingConfig,
};
use crate::types::*;
use crate::PortfolioResult;

// ---------------------------------------------------------------------------
// Input types
// ---------------------------------------------------------------------------

/// A validated stock row from the upstream ingestion layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockRecord {
    pub ticker: String,
    pub quantity: i64,
    pub price: Money,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_basis: Option<Money>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A validated option row. Contract terms are carried in the broker
/// description (`TICKER MON DD YYYY $STRIKE CALL|PUT`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionRecord {
    pub description: String,
    pub quantity: i64,
    /// Per-contract-share mark.
    pub current_price: Money,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_basis: Option<Money>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioAnalysisInput {
    pub stocks: Vec<StockRecord>,
    pub options: Vec<OptionRecord>,
    /// Underlying spot prices, resolved once per distinct ticker before the
    /// numeric stage. Options whose underlying has no spot (and no stock
    /// row) are skipped.
    #[serde(default)]
    pub prices: BTreeMap<String, Money>,
    /// Pre-resolved betas per ticker; missing tickers default to 1.0.
    #[serde(default)]
    pub betas: BTreeMap<String, Decimal>,
    pub valuation_date: NaiveDate,
    #[serde(default)]
    pub config: PricingConfig,
}

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

/// A position dropped at the batch boundary, with enough structure for the
/// UI to render a warning instead of a blank screen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedPosition {
    pub description: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioAnalysisOutput {
    pub groups: Vec<PortfolioGroup>,
    pub summary: PortfolioSummary,
    pub skipped: Vec<SkippedPosition>,
}

// ---------------------------------------------------------------------------
// Position construction
// ---------------------------------------------------------------------------

const DEFAULT_BETA: Decimal = Decimal::ONE;

fn lookup_beta(betas: &BTreeMap<String, Decimal>, ticker: &str) -> Decimal {
    betas.get(ticker).copied().unwrap_or(DEFAULT_BETA)
}

/// An option record with its description already parsed. Format errors are
/// raised before pricing begins; only numeric failures are skippable.
struct ParsedOptionRecord {
    record: OptionRecord,
    contract: ParsedOptionDescription,
}

fn parse_option_records(options: &[OptionRecord]) -> PortfolioResult<Vec<ParsedOptionRecord>> {
    options
        .iter()
        .map(|record| {
            let contract = parse_option_description(&record.description)?;
            Ok(ParsedOptionRecord {
                record: record.clone(),
                contract,
            })
        })
        .collect()
}

fn price_option_record(
    parsed: &ParsedOptionRecord,
    spot: Money,
    beta: Decimal,
    valuation_date: NaiveDate,
    config: &PricingConfig,
) -> PortfolioResult<OptionPosition> {
    let record = &parsed.record;
    let contract = &parsed.contract;

    let t = year_fraction(valuation_date, contract.expiry);
    let volatility = position_volatility(
        spot,
        contract.strike,
        t,
        record.current_price,
        contract.option_type,
        config,
    );
    let raw_delta = option_delta(
        spot,
        contract.strike,
        t,
        volatility,
        contract.option_type,
        config,
    )
    .map_err(|e| PortfolioError::PricingFailure {
        position: record.description.clone(),
        reason: e.to_string(),
    })?;
    let delta = position_delta(raw_delta, record.quantity);

    OptionPosition::new(
        contract.underlying.clone(),
        contract.expiry,
        contract.strike,
        contract.option_type,
        record.quantity,
        record.current_price,
        record.cost_basis,
        record.description.clone(),
        beta,
        delta,
    )
}

// ---------------------------------------------------------------------------
// Breakdown accumulation
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BreakdownAccumulator {
    stock_exposure: Money,
    stock_beta_adjusted: Money,
    option_delta_exposure: Money,
    option_beta_adjusted: Money,
    components: BTreeMap<String, Money>,
}

impl BreakdownAccumulator {
    fn add_stock(&mut self, ticker: &str, exposure: Money, beta_adjusted: Money) {
        self.stock_exposure += exposure;
        self.stock_beta_adjusted += beta_adjusted;
        *self.components.entry(ticker.to_string()).or_default() += exposure;
    }

    fn add_option(&mut self, ticker: &str, exposure: Money, beta_adjusted: Money) {
        self.option_delta_exposure += exposure;
        self.option_beta_adjusted += beta_adjusted;
        *self.components.entry(ticker.to_string()).or_default() += exposure;
    }

    fn build(self) -> ExposureBreakdown {
        ExposureBreakdown::new(
            self.stock_exposure,
            self.stock_beta_adjusted,
            self.option_delta_exposure,
            self.option_beta_adjusted,
            self.components,
        )
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Build portfolio groups, exposure breakdowns, and the portfolio summary
/// from validated position records.
///
/// Malformed option descriptions abort the whole analysis (upstream data
/// corruption); per-position pricing failures are logged and skipped so one
/// bad leg cannot blank the portfolio view.
pub fn analyze_portfolio(
    input: &PortfolioAnalysisInput,
) -> PortfolioResult<ComputationOutput<PortfolioAnalysisOutput>> {
    let start = Instant::now();
    let mut warnings: Vec<String> = Vec::new();

    if input.stocks.is_empty() && input.options.is_empty() {
        return Err(PortfolioError::InvalidInput {
            field: "positions".into(),
            reason: "portfolio must contain at least one position".into(),
        });
    }

    // Format errors surface before any pricing work starts.
    let parsed_options = parse_option_records(&input.options)?;

    // Spot per ticker: explicit price map first, then any stock row.
    let mut spots: BTreeMap<String, Money> = input.prices.clone();
    for stock in &input.stocks {
        spots.entry(stock.ticker.clone()).or_insert(stock.price);
    }

    // Stock positions: cash-like holdings go to the cash tally, everything
    // else into the exposure pipeline.
    let mut stock_positions: Vec<StockPosition> = Vec::new();
    let mut cash_like_value = Decimal::ZERO;
    let mut cash_like_count: u32 = 0;
    for record in &input.stocks {
        let beta = input.betas.get(&record.ticker).copied();
        if is_cash_or_short_term(&record.ticker, beta, record.description.as_deref()) {
            cash_like_value += record.price * Decimal::from(record.quantity);
            cash_like_count += 1;
            continue;
        }
        let position = StockPosition::new(
            record.ticker.clone(),
            record.quantity,
            record.price,
            record.cost_basis,
            beta.unwrap_or(DEFAULT_BETA),
        )?;
        stock_positions.push(position);
    }

    // Option positions: per-position pricing is independent, so dispatch
    // across the rayon pool and join before aggregation.
    let priced: Vec<Result<OptionPosition, SkippedPosition>> = parsed_options
        .par_iter()
        .map(|parsed| {
            let ticker = &parsed.contract.underlying;
            let spot = spots.get(ticker).copied().ok_or_else(|| SkippedPosition {
                description: parsed.record.description.clone(),
                reason: format!("no spot price available for underlying {ticker}"),
            })?;
            let beta = lookup_beta(&input.betas, ticker);
            price_option_record(parsed, spot, beta, input.valuation_date, &input.config).map_err(
                |e| SkippedPosition {
                    description: parsed.record.description.clone(),
                    reason: e.to_string(),
                },
            )
        })
        .collect();

    let mut option_positions: Vec<OptionPosition> = Vec::new();
    let mut skipped: Vec<SkippedPosition> = Vec::new();
    for result in priced {
        match result {
            Ok(position) => option_positions.push(position),
            Err(skip) => {
                warn!(
                    position = %skip.description,
                    reason = %skip.reason,
                    "skipping option position"
                );
                warnings.push(format!("Skipped {}: {}", skip.description, skip.reason));
                skipped.push(skip);
            }
        }
    }

    // Group by ticker
    let mut by_ticker: BTreeMap<String, (Option<StockPosition>, Vec<OptionPosition>)> =
        BTreeMap::new();
    for stock in stock_positions {
        by_ticker
            .entry(stock.ticker.clone())
            .or_default()
            .0
            .replace(stock);
    }
    for option in option_positions {
        by_ticker
            .entry(option.ticker.clone())
            .or_default()
            .1
            .push(option);
    }
    let groups: Vec<PortfolioGroup> = by_ticker
        .into_iter()
        .map(|(ticker, (stock, options))| PortfolioGroup::new(ticker, stock, options))
        .collect();

    // Long/short classification keys off the sign of each position's own
    // exposure value, not its raw quantity: a short put has positive delta
    // exposure and belongs on the long side.
    let mut long_acc = BreakdownAccumulator::default();
    let mut short_acc = BreakdownAccumulator::default();
    let mut options_acc = BreakdownAccumulator::default();

    for group in &groups {
        if let Some(stock) = &group.stock_position {
            if stock.market_exposure >= Decimal::ZERO {
                long_acc.add_stock(
                    &stock.ticker,
                    stock.market_exposure,
                    stock.beta_adjusted_exposure,
                );
            } else {
                short_acc.add_stock(
                    &stock.ticker,
                    -stock.market_exposure,
                    -stock.beta_adjusted_exposure,
                );
            }
        }
        for option in &group.option_positions {
            if option.delta_exposure >= Decimal::ZERO {
                long_acc.add_option(
                    &option.ticker,
                    option.delta_exposure,
                    option.beta_adjusted_exposure,
                );
            } else {
                short_acc.add_option(
                    &option.ticker,
                    -option.delta_exposure,
                    -option.beta_adjusted_exposure,
                );
            }
            // Net option delta exposure across all legs, signed
            options_acc.add_option(
                &option.ticker,
                option.delta_exposure,
                option.beta_adjusted_exposure,
            );
        }
    }

    let long_exposure = long_acc.build();
    let short_exposure = short_acc.build();
    let options_exposure = options_acc.build();

    let net_market_exposure = long_exposure.total_exposure - short_exposure.total_exposure;
    let net_beta_adjusted = long_exposure.total_beta_adjusted - short_exposure.total_beta_adjusted;
    let portfolio_beta = if net_market_exposure.is_zero() {
        Decimal::ZERO
    } else {
        net_beta_adjusted / net_market_exposure
    };

    let gross_exposure = long_exposure.total_exposure + short_exposure.total_exposure;
    let short_percentage = if gross_exposure.is_zero() {
        Decimal::ZERO
    } else {
        short_exposure.total_exposure / gross_exposure
    };

    let portfolio_estimate_value = net_market_exposure + cash_like_value;
    let cash_percentage = if portfolio_estimate_value.is_zero() {
        Decimal::ZERO
    } else {
        cash_like_value / portfolio_estimate_value
    };

    let summary = PortfolioSummary {
        net_market_exposure,
        portfolio_beta,
        long_exposure,
        short_exposure,
        options_exposure,
        cash_like_value,
        cash_like_count,
        cash_percentage,
        short_percentage,
        portfolio_estimate_value,
    };

    let output = PortfolioAnalysisOutput {
        groups,
        summary,
        skipped,
    };

    let elapsed = start.elapsed().as_micros() as u64;
    let assumptions = serde_json::json!({
        "valuation_date": input.valuation_date.to_string(),
        "stock_records": input.stocks.len(),
        "option_records": input.options.len(),
        "default_beta": DEFAULT_BETA.to_string(),
        "risk_free_rate": input.config.risk_free_rate.to_string(),
        "default_volatility": input.config.default_volatility.to_string(),
        "tree_steps": input.config.tree_steps,
    });

    Ok(with_metadata(
        "Delta-based portfolio exposure aggregation (CRR binomial deltas)",
        &assumptions,
        warnings,
        elapsed,
        output,
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
