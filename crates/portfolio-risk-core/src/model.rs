use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::PortfolioError;
use crate::types::*;
use crate::PortfolioResult;

/// Shares per option contract.
pub const CONTRACT_MULTIPLIER: Decimal = dec!(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionType {
    Call,
    Put,
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// A stock holding. Derived exposure fields are computed at construction and
/// the struct is treated as immutable: rebuild on any input change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockPosition {
    pub ticker: String,
    /// Signed share count: positive long, negative short.
    pub quantity: i64,
    /// Current market price per share.
    pub price: Money,
    /// Entry price per share; defaults to the current price.
    pub cost_basis: Money,
    /// Beta of the ticker; may be zero for cash-like holdings.
    pub beta: Decimal,
    pub market_exposure: Money,
    pub beta_adjusted_exposure: Money,
}

impl StockPosition {
    pub fn new(
        ticker: impl Into<String>,
        quantity: i64,
        price: Money,
        cost_basis: Option<Money>,
        beta: Decimal,
    ) -> PortfolioResult<Self> {
        if price <= Decimal::ZERO {
            return Err(PortfolioError::InvalidInput {
                field: "price".into(),
                reason: "must be positive".into(),
            });
        }
        let market_exposure = price * Decimal::from(quantity);
        Ok(StockPosition {
            ticker: ticker.into(),
            quantity,
            price,
            cost_basis: cost_basis.unwrap_or(price),
            beta,
            market_exposure,
            beta_adjusted_exposure: market_exposure * beta,
        })
    }
}

/// An option holding. `delta` is the position-level delta: the raw unit delta
/// for a long contract, negated when the quantity is short.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionPosition {
    pub ticker: String,
    pub expiry: NaiveDate,
    pub strike: Money,
    pub option_type: OptionType,
    /// Signed contract count; each contract covers 100 underlying shares.
    pub quantity: i64,
    /// Per-contract-share market price.
    pub current_price: Money,
    /// Entry price per contract share; defaults to the current price.
    pub cost_basis: Money,
    /// Free-text source label, e.g. "AAPL JUN 20 2025 $150 CALL".
    pub description: String,
    pub beta: Decimal,
    pub delta: Decimal,
    /// strike * 100 * |quantity| — a sizing metric, never directional.
    pub notional_value: Money,
    /// strike * 100 * quantity.
    pub signed_notional_value: Money,
    /// current_price * 100 * quantity.
    pub market_value: Money,
    pub delta_exposure: Money,
    pub beta_adjusted_exposure: Money,
}

impl OptionPosition {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ticker: impl Into<String>,
        expiry: NaiveDate,
        strike: Money,
        option_type: OptionType,
        quantity: i64,
        current_price: Money,
        cost_basis: Option<Money>,
        description: impl Into<String>,
        beta: Decimal,
        delta: Decimal,
    ) -> PortfolioResult<Self> {
        if strike <= Decimal::ZERO {
            return Err(PortfolioError::InvalidInput {
                field: "strike".into(),
                reason: "must be positive".into(),
            });
        }
        if current_price < Decimal::ZERO {
            return Err(PortfolioError::InvalidInput {
                field: "current_price".into(),
                reason: "must be non-negative".into(),
            });
        }
        let qty = Decimal::from(quantity);
        let notional_value = strike * CONTRACT_MULTIPLIER * qty.abs();
        let delta_exposure = delta * notional_value;
        Ok(OptionPosition {
            ticker: ticker.into(),
            expiry,
            strike,
            option_type,
            quantity,
            current_price,
            cost_basis: cost_basis.unwrap_or(current_price),
            description: description.into(),
            beta,
            delta,
            notional_value,
            signed_notional_value: strike * CONTRACT_MULTIPLIER * qty,
            market_value: current_price * CONTRACT_MULTIPLIER * qty,
            delta_exposure,
            beta_adjusted_exposure: delta_exposure * beta,
        })
    }
}

/// A stock or option position. Pricing and P&L code dispatches with an
/// exhaustive match on this tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Position {
    Stock(StockPosition),
    Option(OptionPosition),
}

impl Position {
    pub fn ticker(&self) -> &str {
        match self {
            Position::Stock(s) => &s.ticker,
            Position::Option(o) => &o.ticker,
        }
    }

    /// Directional exposure: market exposure for stock, delta exposure for
    /// options. Long/short classification keys off the sign of this value.
    pub fn exposure(&self) -> Money {
        match self {
            Position::Stock(s) => s.market_exposure,
            Position::Option(o) => o.delta_exposure,
        }
    }

    pub fn beta_adjusted_exposure(&self) -> Money {
        match self {
            Position::Stock(s) => s.beta_adjusted_exposure,
            Position::Option(o) => o.beta_adjusted_exposure,
        }
    }
}

// ---------------------------------------------------------------------------
// Groups and breakdowns
// ---------------------------------------------------------------------------

/// All positions sharing one underlying ticker. Aggregates are derived by
/// summation at construction and are never independently settable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioGroup {
    pub ticker: String,
    pub stock_position: Option<StockPosition>,
    pub option_positions: Vec<OptionPosition>,
    pub net_exposure: Money,
    pub beta: Decimal,
    pub beta_adjusted_exposure: Money,
    pub total_delta_exposure: Money,
    pub options_delta_exposure: Money,
}

impl PortfolioGroup {
    pub fn new(
        ticker: impl Into<String>,
        stock_position: Option<StockPosition>,
        option_positions: Vec<OptionPosition>,
    ) -> Self {
        let stock_exposure = stock_position
            .as_ref()
            .map(|s| s.market_exposure)
            .unwrap_or(Decimal::ZERO);
        let stock_beta_adj = stock_position
            .as_ref()
            .map(|s| s.beta_adjusted_exposure)
            .unwrap_or(Decimal::ZERO);
        let options_delta_exposure: Money =
            option_positions.iter().map(|o| o.delta_exposure).sum();
        let options_beta_adj: Money = option_positions
            .iter()
            .map(|o| o.beta_adjusted_exposure)
            .sum();

        let net_exposure = stock_exposure + options_delta_exposure;
        let beta_adjusted_exposure = stock_beta_adj + options_beta_adj;
        let beta = if net_exposure.is_zero() {
            Decimal::ZERO
        } else {
            beta_adjusted_exposure / net_exposure
        };

        PortfolioGroup {
            ticker: ticker.into(),
            stock_position,
            option_positions,
            net_exposure,
            beta,
            beta_adjusted_exposure,
            total_delta_exposure: net_exposure,
            options_delta_exposure,
        }
    }

    pub fn positions(&self) -> Vec<Position> {
        let mut out = Vec::new();
        if let Some(s) = &self.stock_position {
            out.push(Position::Stock(s.clone()));
        }
        for o in &self.option_positions {
            out.push(Position::Option(o.clone()));
        }
        out
    }
}

/// One side of the portfolio's exposure (long, short, or net options).
/// Long/short breakdowns store non-negative magnitudes; direction is implied
/// by the label.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExposureBreakdown {
    pub stock_exposure: Money,
    pub stock_beta_adjusted: Money,
    pub option_delta_exposure: Money,
    pub option_beta_adjusted: Money,
    pub total_exposure: Money,
    pub total_beta_adjusted: Money,
    /// Per-component attribution for UI display.
    pub components: BTreeMap<String, Money>,
}

impl ExposureBreakdown {
    pub fn new(
        stock_exposure: Money,
        stock_beta_adjusted: Money,
        option_delta_exposure: Money,
        option_beta_adjusted: Money,
        components: BTreeMap<String, Money>,
    ) -> Self {
        ExposureBreakdown {
            stock_exposure,
            stock_beta_adjusted,
            option_delta_exposure,
            option_beta_adjusted,
            total_exposure: stock_exposure + option_delta_exposure,
            total_beta_adjusted: stock_beta_adjusted + option_beta_adjusted,
            components,
        }
    }
}

/// Whole-portfolio rollup. Built once per load/refresh from the full
/// position list; rebuilt wholesale on any data change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioSummary {
    pub net_market_exposure: Money,
    /// Beta-adjusted net exposure / net market exposure; 0 when the
    /// denominator is 0.
    pub portfolio_beta: Decimal,
    pub long_exposure: ExposureBreakdown,
    pub short_exposure: ExposureBreakdown,
    pub options_exposure: ExposureBreakdown,
    pub cash_like_value: Money,
    pub cash_like_count: u32,
    pub cash_percentage: Rate,
    pub short_percentage: Rate,
    /// net_market_exposure + cash_like_value.
    pub portfolio_estimate_value: Money,
}

// ---------------------------------------------------------------------------
// Option description parsing
// ---------------------------------------------------------------------------

/// Contract fields recovered from a broker description string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedOptionDescription {
    pub underlying: String,
    pub expiry: NaiveDate,
    pub strike: Money,
    pub option_type: OptionType,
}

fn month_number(token: &str) -> Option<u32> {
    match token.to_ascii_uppercase().as_str() {
        "JAN" => Some(1),
        "FEB" => Some(2),
        "MAR" => Some(3),
        "APR" => Some(4),
        "MAY" => Some(5),
        "JUN" => Some(6),
        "JUL" => Some(7),
        "AUG" => Some(8),
        "SEP" => Some(9),
        "OCT" => Some(10),
        "NOV" => Some(11),
        "DEC" => Some(12),
        _ => None,
    }
}

/// Parse the fixed 6-token grammar `TICKER MON DD YYYY $STRIKE CALL|PUT`.
///
/// Any other token count, a strike without the `$` prefix, or an
/// unrecognized month abbreviation is a format error — these indicate
/// upstream data corruption and are never silently defaulted.
pub fn parse_option_description(description: &str) -> PortfolioResult<ParsedOptionDescription> {
    let tokens: Vec<&str> = description.split_whitespace().collect();
    if tokens.len() != 6 {
        return Err(PortfolioError::DescriptionFormat(format!(
            "expected 6 tokens (TICKER MON DD YYYY $STRIKE CALL|PUT), got {} in '{}'",
            tokens.len(),
            description
        )));
    }

    let underlying = tokens[0].to_ascii_uppercase();

    let month = month_number(tokens[1]).ok_or_else(|| {
        PortfolioError::DescriptionFormat(format!("unrecognized month '{}'", tokens[1]))
    })?;
    let day: u32 = tokens[2].parse().map_err(|_| {
        PortfolioError::DescriptionFormat(format!("unparseable day '{}'", tokens[2]))
    })?;
    let year: i32 = tokens[3].parse().map_err(|_| {
        PortfolioError::DescriptionFormat(format!("unparseable year '{}'", tokens[3]))
    })?;
    let expiry = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| {
        PortfolioError::DescriptionFormat(format!(
            "invalid calendar date {year}-{month:02}-{day:02}"
        ))
    })?;

    let strike_token = tokens[4];
    let strike: Money = strike_token
        .strip_prefix('$')
        .ok_or_else(|| {
            PortfolioError::DescriptionFormat(format!(
                "strike '{strike_token}' must be $-prefixed"
            ))
        })?
        .parse()
        .map_err(|_| {
            PortfolioError::DescriptionFormat(format!("unparseable strike '{strike_token}'"))
        })?;
    if strike <= Decimal::ZERO {
        return Err(PortfolioError::DescriptionFormat(format!(
            "strike '{strike_token}' must be positive"
        )));
    }

    let option_type = match tokens[5].to_ascii_uppercase().as_str() {
        "CALL" => OptionType::Call,
        "PUT" => OptionType::Put,
        other => {
            return Err(PortfolioError::DescriptionFormat(format!(
                "expected CALL or PUT, got '{other}'"
            )))
        }
    };

    Ok(ParsedOptionDescription {
        underlying,
        expiry,
        strike,
        option_type,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    #[test]
    fn test_stock_position_derived_fields() {
        let pos = StockPosition::new("AAPL", -50, dec!(200), None, dec!(1.2)).unwrap();
        assert_eq!(pos.market_exposure, dec!(-10000));
        assert_eq!(pos.beta_adjusted_exposure, dec!(-12000));
        assert_eq!(pos.cost_basis, dec!(200));
    }

    #[test]
    fn test_stock_position_rejects_nonpositive_price() {
        let result = StockPosition::new("AAPL", 10, dec!(0), None, dec!(1));
        assert!(result.is_err());
    }

    #[test]
    fn test_option_position_derived_fields() {
        let expiry = NaiveDate::from_ymd_opt(2025, 6, 20).unwrap();
        let pos = OptionPosition::new(
            "AAPL",
            expiry,
            dec!(150),
            OptionType::Call,
            -2,
            dec!(4.50),
            None,
            "AAPL JUN 20 2025 $150 CALL",
            dec!(1.1),
            dec!(-0.55),
        )
        .unwrap();
        // Notional is sized on |quantity|
        assert_eq!(pos.notional_value, dec!(30000));
        assert_eq!(pos.signed_notional_value, dec!(-30000));
        assert_eq!(pos.market_value, dec!(-900));
        assert_eq!(pos.delta_exposure, dec!(-16500));
        assert_eq!(pos.beta_adjusted_exposure, dec!(-18150));
    }

    #[test]
    fn test_group_aggregates_from_constituents() {
        let stock = StockPosition::new("SPY", 100, dec!(500), None, dec!(1)).unwrap();
        let expiry = NaiveDate::from_ymd_opt(2025, 12, 19).unwrap();
        let opt = OptionPosition::new(
            "SPY",
            expiry,
            dec!(520),
            OptionType::Call,
            1,
            dec!(12),
            None,
            "SPY DEC 19 2025 $520 CALL",
            dec!(1),
            dec!(0.4),
        )
        .unwrap();
        let group = PortfolioGroup::new("SPY", Some(stock), vec![opt]);

        assert_eq!(group.options_delta_exposure, dec!(20800));
        assert_eq!(group.net_exposure, dec!(50000) + dec!(20800));
        assert_eq!(group.total_delta_exposure, group.net_exposure);
        assert_eq!(group.beta, dec!(1));
    }

    #[test]
    fn test_group_beta_zero_when_net_exposure_zero() {
        let group = PortfolioGroup::new("XYZ", None, vec![]);
        assert_eq!(group.beta, Decimal::ZERO);
        assert_eq!(group.net_exposure, Decimal::ZERO);
    }

    #[test]
    fn test_breakdown_totals() {
        let bd = ExposureBreakdown::new(
            dec!(1000),
            dec!(1100),
            dec!(500),
            dec!(550),
            BTreeMap::new(),
        );
        assert_eq!(bd.total_exposure, dec!(1500));
        assert_eq!(bd.total_beta_adjusted, dec!(1650));
    }

    #[test]
    fn test_parse_option_description_roundtrip() {
        let parsed = parse_option_description("AAPL JUN 20 2025 $150 CALL").unwrap();
        assert_eq!(parsed.underlying, "AAPL");
        assert_eq!(parsed.expiry, NaiveDate::from_ymd_opt(2025, 6, 20).unwrap());
        assert_eq!(parsed.strike, dec!(150));
        assert_eq!(parsed.option_type, OptionType::Call);
    }

    #[test]
    fn test_parse_option_description_case_insensitive() {
        let parsed = parse_option_description("msft jan 17 2026 $420.50 put").unwrap();
        assert_eq!(parsed.underlying, "MSFT");
        assert_eq!(parsed.strike, dec!(420.50));
        assert_eq!(parsed.option_type, OptionType::Put);
    }

    #[test]
    fn test_parse_rejects_wrong_token_count() {
        assert!(parse_option_description("AAPL JUN 20 2025 $150").is_err());
        assert!(parse_option_description("AAPL JUN 20 2025 $150 CALL EXTRA").is_err());
    }

    #[test]
    fn test_parse_rejects_unprefixed_strike() {
        let result = parse_option_description("AAPL JUN 20 2025 150 CALL");
        match result.unwrap_err() {
            PortfolioError::DescriptionFormat(msg) => assert!(msg.contains("$-prefixed")),
            other => panic!("Expected DescriptionFormat, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_month() {
        assert!(parse_option_description("AAPL JUNE 20 2025 $150 CALL").is_err());
        assert!(parse_option_description("AAPL XXX 20 2025 $150 CALL").is_err());
    }

    #[test]
    fn test_parse_rejects_invalid_calendar_date() {
        assert!(parse_option_description("AAPL FEB 30 2025 $150 CALL").is_err());
    }
}
