use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::Money;
use crate::PortfolioResult;

// ---------------------------------------------------------------------------
// Cash / short-term detection
// ---------------------------------------------------------------------------

/// Betas below this magnitude are treated as cash-like. Strict comparison:
/// a beta of exactly 0.1 is NOT cash-like.
const CASH_BETA_THRESHOLD: Decimal = rust_decimal_macros::dec!(0.1);

const MONEY_MARKET_KEYWORDS: &[&str] = &[
    "MONEY MARKET",
    "TREASURY ONLY",
    "TREASURY FUND",
    "GOVERNMENT LIQUIDITY",
    "CASH RESERVES",
    "T-BILL",
    "TBILL",
];

const SHORT_DURATION_KEYWORDS: &[&str] = &[
    "SHORT-TERM BOND",
    "SHORT TERM BOND",
    "ULTRA SHORT",
    "ULTRA-SHORT",
    "FLOATING RATE",
];

/// T-bill and ultra-short duration ETFs with ~zero market beta.
const SHORT_TERM_ETFS: &[&str] = &[
    "BIL", "SHV", "SGOV", "SHY", "VGSH", "GBIL", "CLTL", "ICSH", "NEAR", "FLOT", "JPST", "MINT",
    "USFR", "TFLO",
];

/// Money-market mutual fund ticker prefixes (Fidelity/Vanguard/Schwab core
/// cash funds not already caught by the `XX` suffix rule).
const MONEY_MARKET_PREFIXES: &[&str] = &["SPAX", "FDRX", "VMFX", "VMRX", "SWVX", "SNVX"];

/// Pure predicate: is this holding cash or a short-term instrument?
///
/// Rules evaluated in order, any match returns true:
/// (a) money-market ticker pattern (suffix `XX` or known prefix) or a
///     money-market/treasury keyword in the description;
/// (b) `|beta| < 0.1` when a beta is supplied;
/// (c) a short-duration bond keyword in the description;
/// (d) membership in the short-term ETF allowlist.
///
/// Case-insensitive; absent inputs never match.
pub fn is_cash_or_short_term(
    ticker: &str,
    beta: Option<Decimal>,
    description: Option<&str>,
) -> bool {
    let ticker = ticker.trim().to_ascii_uppercase();
    let description = description.map(|d| d.to_ascii_uppercase());

    // (a) money-market symbol pattern or keyword
    if ticker.len() > 2 && ticker.ends_with("XX") {
        return true;
    }
    if MONEY_MARKET_PREFIXES.iter().any(|p| ticker.starts_with(p)) {
        return true;
    }
    if let Some(desc) = &description {
        if MONEY_MARKET_KEYWORDS.iter().any(|k| desc.contains(k)) {
            return true;
        }
    }

    // (b) near-zero beta
    if let Some(b) = beta {
        if b.abs() < CASH_BETA_THRESHOLD {
            return true;
        }
    }

    // (c) short-duration bond keyword
    if let Some(desc) = &description {
        if SHORT_DURATION_KEYWORDS.iter().any(|k| desc.contains(k)) {
            return true;
        }
    }

    // (d) short-term ETF allowlist
    SHORT_TERM_ETFS.contains(&ticker.as_str())
}

// ---------------------------------------------------------------------------
// Beta estimation
// ---------------------------------------------------------------------------

/// One daily close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub close: Money,
}

/// An ordered daily close series for one ticker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceSeries {
    pub bars: Vec<PriceBar>,
}

impl PriceSeries {
    pub fn new(bars: Vec<PriceBar>) -> Self {
        PriceSeries { bars }
    }
}

/// The one external input of this core: a synchronous daily price-history
/// lookup. A failed fetch must surface as `PortfolioError::DataUnavailable`,
/// which is distinct from a computed beta of zero.
pub trait PriceHistoryProvider {
    fn fetch(&self, ticker: &str) -> PortfolioResult<PriceSeries>;
}

/// Beta of a stock series against a market series:
/// `Cov(stock_returns, market_returns) / Var(market_returns)` over daily
/// simple returns, after inner-joining the two date indices.
///
/// Returns the 0.0 sentinel (not an error) when fewer than 2 aligned return
/// observations exist or the market series has zero variance; the result is
/// otherwise unclamped and may exceed 1 or go negative.
pub fn beta_from_series(stock: &PriceSeries, market: &PriceSeries) -> Decimal {
    // Inner join on date
    let market_by_date: BTreeMap<NaiveDate, Money> =
        market.bars.iter().map(|b| (b.date, b.close)).collect();
    let mut aligned: Vec<(Money, Money)> = Vec::with_capacity(stock.bars.len());
    for bar in &stock.bars {
        if let Some(market_close) = market_by_date.get(&bar.date) {
            aligned.push((bar.close, *market_close));
        }
    }

    // Daily simple returns over the joined series
    let mut stock_returns: Vec<Decimal> = Vec::new();
    let mut market_returns: Vec<Decimal> = Vec::new();
    for window in aligned.windows(2) {
        let (s_prev, m_prev) = window[0];
        let (s_curr, m_curr) = window[1];
        if s_prev.is_zero() || m_prev.is_zero() {
            continue;
        }
        stock_returns.push(s_curr / s_prev - Decimal::ONE);
        market_returns.push(m_curr / m_prev - Decimal::ONE);
    }

    let n = stock_returns.len();
    if n < 2 {
        return Decimal::ZERO;
    }
    let n_dec = Decimal::from(n as i64);

    let stock_mean: Decimal = stock_returns.iter().sum::<Decimal>() / n_dec;
    let market_mean: Decimal = market_returns.iter().sum::<Decimal>() / n_dec;

    let mut covariance = Decimal::ZERO;
    let mut market_variance = Decimal::ZERO;
    for (s, m) in stock_returns.iter().zip(market_returns.iter()) {
        covariance += (s - stock_mean) * (m - market_mean);
        market_variance += (m - market_mean) * (m - market_mean);
    }

    if market_variance.is_zero() {
        return Decimal::ZERO;
    }
    covariance / market_variance
}

/// Fetch both series once and compute beta against the benchmark.
/// Propagates `DataUnavailable` from the provider.
pub fn beta(
    provider: &impl PriceHistoryProvider,
    ticker: &str,
    benchmark: &str,
) -> PortfolioResult<Decimal> {
    let stock = provider.fetch(ticker)?;
    let market = provider.fetch(benchmark)?;
    Ok(beta_from_series(&stock, &market))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
