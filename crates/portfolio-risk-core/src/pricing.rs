use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PortfolioError;
use crate::model::OptionType;
use crate::types::*;
use crate::PortfolioResult;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Pricing parameters threaded explicitly through every call — no
/// process-wide defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Flat annual risk-free rate.
    pub risk_free_rate: Rate,
    /// Flat volatility used when no implied volatility is available.
    pub default_volatility: Rate,
    /// Binomial tree time steps between valuation date and expiry.
    pub tree_steps: u32,
    /// Flat dividend yield.
    pub dividend_yield: Rate,
}

impl Default for PricingConfig {
    fn default() -> Self {
        PricingConfig {
            risk_free_rate: dec!(0.05),
            default_volatility: dec!(0.30),
            tree_steps: 100,
            dividend_yield: Decimal::ZERO,
        }
    }
}

/// Implied volatilities outside this band are discarded in favor of the
/// skew estimator.
pub const MIN_SANE_VOLATILITY: Decimal = dec!(0.01);
pub const MAX_SANE_VOLATILITY: Decimal = dec!(2.0);

/// ACT/365 year fraction between two dates. Negative when the expiry is in
/// the past.
pub fn year_fraction(valuation_date: NaiveDate, expiry: NaiveDate) -> Years {
    Decimal::from((expiry - valuation_date).num_days()) / dec!(365)
}

// ---------------------------------------------------------------------------
// Decimal math helpers (no f64 round-trips through the tree)
// ---------------------------------------------------------------------------

/// Taylor series exp(x) with range reduction for |x| > 2.
/// exp(x) = exp(x/2)^2 when |x| > 2, then Taylor with 25 terms.
fn exp_decimal(x: Decimal) -> Decimal {
    let two = dec!(2);

    if x > two || x < -two {
        let half = exp_decimal(x / two);
        return half * half;
    }

    let mut sum = Decimal::ONE;
    let mut term = Decimal::ONE;
    for n in 1u32..=25 {
        term = term * x / Decimal::from(n);
        sum += term;
    }
    sum
}

/// Newton's method sqrt: y_{n+1} = (y_n + x/y_n) / 2, 25 iterations.
fn sqrt_decimal(x: Decimal) -> Decimal {
    if x <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    if x == Decimal::ONE {
        return Decimal::ONE;
    }
    let two = dec!(2);
    let mut guess = x / two;
    if x > dec!(100) {
        guess = dec!(10);
    } else if x < dec!(0.01) {
        guess = dec!(0.1);
    }
    for _ in 0..25 {
        guess = (guess + x / guess) / two;
    }
    guess
}

/// Integer power of a Decimal via exponentiation by squaring (avoids powd
/// precision drift).
fn pow_decimal(base: Decimal, exp: u32) -> Decimal {
    if exp == 0 {
        return Decimal::ONE;
    }
    let mut result = Decimal::ONE;
    let mut b = base;
    let mut e = exp;
    while e > 0 {
        if e & 1 == 1 {
            result *= b;
        }
        b *= b;
        e >>= 1;
    }
    result
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate_tree_inputs(
    spot: Money,
    strike: Money,
    time_to_expiry: Years,
    volatility: Rate,
) -> PortfolioResult<()> {
    if spot <= Decimal::ZERO {
        return Err(PortfolioError::InvalidInput {
            field: "spot".into(),
            reason: "must be positive".into(),
        });
    }
    if strike <= Decimal::ZERO {
        return Err(PortfolioError::InvalidInput {
            field: "strike".into(),
            reason: "must be positive".into(),
        });
    }
    if time_to_expiry <= Decimal::ZERO {
        return Err(PortfolioError::InvalidInput {
            field: "time_to_expiry".into(),
            reason: "must be positive".into(),
        });
    }
    if volatility <= Decimal::ZERO {
        return Err(PortfolioError::InvalidInput {
            field: "volatility".into(),
            reason: "must be positive".into(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Binomial tree (CRR model, American exercise)
// ---------------------------------------------------------------------------

fn intrinsic_value(price: Decimal, strike: Decimal, option_type: OptionType) -> Decimal {
    match option_type {
        OptionType::Call => (price - strike).max(Decimal::ZERO),
        OptionType::Put => (strike - price).max(Decimal::ZERO),
    }
}

fn crr_tree_price(
    s: Decimal,
    k: Decimal,
    t: Decimal,
    r: Decimal,
    q: Decimal,
    sigma: Decimal,
    steps: u32,
    option_type: OptionType,
) -> Decimal {
    let n = steps;
    let dt = t / Decimal::from(n);
    let u = exp_decimal(sigma * sqrt_decimal(dt));
    let d = Decimal::ONE / u;
    let exp_rq_dt = exp_decimal((r - q) * dt);
    let disc = exp_decimal(-r * dt);
    let p_up = (exp_rq_dt - d) / (u - d);
    let p_down = Decimal::ONE - p_up;

    // Terminal payoffs: node i has i up-moves and n-i down-moves
    let size = (n + 1) as usize;
    let mut option_values = Vec::with_capacity(size);
    for i in 0..size {
        let ups = i as u32;
        let downs = n - ups;
        let price = s * pow_decimal(u, ups) * pow_decimal(d, downs);
        option_values.push(intrinsic_value(price, k, option_type));
    }

    // Backward induction with American early exercise at every node
    for step in (0..n).rev() {
        let step_size = (step + 1) as usize;
        for i in 0..step_size {
            let hold = disc * (p_up * option_values[i + 1] + p_down * option_values[i]);
            let ups = i as u32;
            let downs = step - ups;
            let price = s * pow_decimal(u, ups) * pow_decimal(d, downs);
            option_values[i] = hold.max(intrinsic_value(price, k, option_type));
        }
    }

    option_values[0]
}

/// Price an American option on a Cox-Ross-Rubinstein binomial tree.
/// Returns the NPV per underlying share (multiply by 100 × quantity for a
/// position's market value).
pub fn american_option_price(
    spot: Money,
    strike: Money,
    time_to_expiry: Years,
    volatility: Rate,
    option_type: OptionType,
    config: &PricingConfig,
) -> PortfolioResult<Money> {
    validate_tree_inputs(spot, strike, time_to_expiry, volatility)?;
    Ok(crr_tree_price(
        spot,
        strike,
        time_to_expiry,
        config.risk_free_rate,
        config.dividend_yield,
        volatility,
        config.tree_steps,
        option_type,
    ))
}

/// Delta of a long unit option: central finite difference of the tree price
/// with respect to spot (±1% bump), clamped to [-1, 1].
pub fn option_delta(
    spot: Money,
    strike: Money,
    time_to_expiry: Years,
    volatility: Rate,
    option_type: OptionType,
    config: &PricingConfig,
) -> PortfolioResult<Decimal> {
    validate_tree_inputs(spot, strike, time_to_expiry, volatility)?;

    let bump = spot * dec!(0.01);
    let up = crr_tree_price(
        spot + bump,
        strike,
        time_to_expiry,
        config.risk_free_rate,
        config.dividend_yield,
        volatility,
        config.tree_steps,
        option_type,
    );
    let down = crr_tree_price(
        spot - bump,
        strike,
        time_to_expiry,
        config.risk_free_rate,
        config.dividend_yield,
        volatility,
        config.tree_steps,
        option_type,
    );

    let delta = (up - down) / (dec!(2) * bump);
    Ok(delta.clamp(dec!(-1), dec!(1)))
}

/// Position-level delta: the raw long-contract delta, negated when the
/// position is short (quantity < 0 inverts the sign).
pub fn position_delta(raw_delta: Decimal, quantity: i64) -> Decimal {
    if quantity < 0 {
        -raw_delta
    } else {
        raw_delta
    }
}

// ---------------------------------------------------------------------------
// Implied volatility (bisection)
// ---------------------------------------------------------------------------

const IV_BRACKET_LOW: Decimal = dec!(0.001);
const IV_BRACKET_HIGH: Decimal = dec!(5.0);
const IV_PRICE_TOLERANCE: Decimal = dec!(0.0001);
const IV_MAX_ITERATIONS: u32 = 100;

/// Implied volatility via bisection over [0.001, 5.0], repricing with the
/// same American tree, converging when the repriced NPV matches the market
/// price within 1e-4 absolute.
///
/// On failure to converge within 100 iterations the final bracket midpoint
/// is returned rather than an error — a best-effort estimate for the batch
/// pipeline, not a hard failure.
pub fn implied_volatility(
    spot: Money,
    strike: Money,
    time_to_expiry: Years,
    market_price: Money,
    option_type: OptionType,
    config: &PricingConfig,
) -> PortfolioResult<Rate> {
    validate_tree_inputs(spot, strike, time_to_expiry, dec!(0.2))?;
    if market_price <= Decimal::ZERO {
        return Err(PortfolioError::InvalidInput {
            field: "market_price".into(),
            reason: "must be positive".into(),
        });
    }

    let mut lo = IV_BRACKET_LOW;
    let mut hi = IV_BRACKET_HIGH;
    let mut mid = (lo + hi) / dec!(2);

    for iteration in 0..IV_MAX_ITERATIONS {
        mid = (lo + hi) / dec!(2);
        let price = crr_tree_price(
            spot,
            strike,
            time_to_expiry,
            config.risk_free_rate,
            config.dividend_yield,
            mid,
            config.tree_steps,
            option_type,
        );
        let diff = price - market_price;

        if diff.abs() < IV_PRICE_TOLERANCE {
            debug!(
                iterations = iteration + 1,
                implied_vol = %mid,
                "implied volatility converged"
            );
            return Ok(mid);
        }

        // Option price is monotonically increasing in volatility
        if diff > Decimal::ZERO {
            hi = mid;
        } else {
            lo = mid;
        }
    }

    debug!(implied_vol = %mid, "implied volatility bisection hit iteration cap, using bracket midpoint");
    Ok((lo + hi) / dec!(2))
}

// ---------------------------------------------------------------------------
// Volatility skew fallback
// ---------------------------------------------------------------------------

/// Estimate a skew-adjusted volatility from a base value when no usable
/// implied volatility exists. Options more than 10%/20% in or out of the
/// money get a 1.1×/1.2× multiplier; long-dated expiries (beyond 180 days)
/// are damped.
pub fn estimate_volatility_with_skew(
    base_volatility: Rate,
    spot: Money,
    strike: Money,
    time_to_expiry: Years,
) -> Rate {
    let moneyness_deviation = if strike.is_zero() {
        Decimal::ZERO
    } else {
        (spot / strike - Decimal::ONE).abs()
    };

    let multiplier = if moneyness_deviation > dec!(0.20) {
        dec!(1.2)
    } else if moneyness_deviation > dec!(0.10) {
        dec!(1.1)
    } else {
        Decimal::ONE
    };

    // Long-dated skew flattens out
    let damping = if time_to_expiry > dec!(180) / dec!(365) {
        dec!(0.9)
    } else {
        Decimal::ONE
    };

    base_volatility * multiplier * damping
}

/// Volatility to price a position with: the implied volatility backed out of
/// the observed market price when it lands in the sane band [0.01, 2.0],
/// otherwise the skew estimate from the configured default.
pub fn position_volatility(
    spot: Money,
    strike: Money,
    time_to_expiry: Years,
    market_price: Money,
    option_type: OptionType,
    config: &PricingConfig,
) -> Rate {
    if market_price > Decimal::ZERO {
        if let Ok(iv) = implied_volatility(
            spot,
            strike,
            time_to_expiry,
            market_price,
            option_type,
            config,
        ) {
            if iv >= MIN_SANE_VOLATILITY && iv <= MAX_SANE_VOLATILITY {
                return iv;
            }
            debug!(implied_vol = %iv, "implied volatility outside sane band, using skew estimate");
        }
    }
    estimate_volatility_with_skew(config.default_volatility, spot, strike, time_to_expiry)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn approx_eq(a: Decimal, b: Decimal, tol: Decimal) -> bool {
        (a - b).abs() < tol
    }

    fn thirty_day_config() -> (Years, PricingConfig) {
        (dec!(30) / dec!(365), PricingConfig::default())
    }

    // -----------------------------------------------------------------------
    // Math helper sanity checks
    // -----------------------------------------------------------------------

    #[test]
    fn test_exp_decimal_basic() {
        assert!(approx_eq(exp_decimal(dec!(0)), dec!(1), dec!(0.0001)));
        assert!(approx_eq(exp_decimal(dec!(1)), dec!(2.71828), dec!(0.001)));
        assert!(approx_eq(exp_decimal(dec!(-1)), dec!(0.36788), dec!(0.001)));
    }

    #[test]
    fn test_sqrt_decimal_basic() {
        assert!(approx_eq(sqrt_decimal(dec!(4)), dec!(2), dec!(0.0001)));
        assert!(approx_eq(
            sqrt_decimal(dec!(0.0822)),
            dec!(0.2867),
            dec!(0.001)
        ));
    }

    #[test]
    fn test_pow_decimal_basic() {
        assert_eq!(pow_decimal(dec!(2), 10), dec!(1024));
        assert_eq!(pow_decimal(dec!(3), 0), dec!(1));
    }

    // -----------------------------------------------------------------------
    // American pricing
    // -----------------------------------------------------------------------

    #[test]
    fn test_atm_call_delta_band() {
        // ATM call at 30% vol, 30 days: delta in (0.45, 0.55)
        let (t, config) = thirty_day_config();
        let delta = option_delta(dec!(100), dec!(100), t, dec!(0.30), OptionType::Call, &config)
            .unwrap();
        assert!(
            delta > dec!(0.45) && delta < dec!(0.55),
            "ATM call delta {delta} outside (0.45, 0.55)"
        );
    }

    #[test]
    fn test_atm_put_delta_band() {
        let (t, config) = thirty_day_config();
        let delta =
            option_delta(dec!(100), dec!(100), t, dec!(0.30), OptionType::Put, &config).unwrap();
        assert!(
            delta > dec!(-0.55) && delta < dec!(-0.45),
            "ATM put delta {delta} outside (-0.55, -0.45)"
        );
    }

    #[test]
    fn test_delta_bounds_across_moneyness() {
        let (t, config) = thirty_day_config();
        for strike in [dec!(50), dec!(80), dec!(100), dec!(120), dec!(200)] {
            for option_type in [OptionType::Call, OptionType::Put] {
                let delta =
                    option_delta(dec!(100), strike, t, dec!(0.30), option_type, &config).unwrap();
                assert!(
                    delta >= dec!(-1) && delta <= dec!(1),
                    "delta {delta} out of [-1, 1] at strike {strike}"
                );
            }
        }
    }

    #[test]
    fn test_deep_itm_call_near_intrinsic() {
        // Strike 20% below spot: price ~ intrinsic + small time value
        let (t, config) = thirty_day_config();
        let price =
            american_option_price(dec!(100), dec!(80), t, dec!(0.30), OptionType::Call, &config)
                .unwrap();
        let intrinsic = dec!(20);
        assert!(
            price >= intrinsic - dec!(0.01),
            "deep ITM call {price} below intrinsic {intrinsic}"
        );
        assert!(
            price < intrinsic + dec!(1),
            "deep ITM call {price} carries too much time value"
        );
    }

    #[test]
    fn test_deep_otm_call_near_zero() {
        // Strike 50% above spot: price below 1.0
        let (t, config) = thirty_day_config();
        let price =
            american_option_price(dec!(100), dec!(150), t, dec!(0.30), OptionType::Call, &config)
                .unwrap();
        assert!(
            price < dec!(1),
            "deep OTM call price {price} should be near zero"
        );
        assert!(price >= Decimal::ZERO);
    }

    #[test]
    fn test_american_put_at_least_intrinsic() {
        // Deep ITM American put must never price below immediate exercise
        let (t, config) = thirty_day_config();
        let price =
            american_option_price(dec!(60), dec!(100), t, dec!(0.30), OptionType::Put, &config)
                .unwrap();
        assert!(
            price >= dec!(40) - dec!(0.01),
            "American put {price} below intrinsic 40"
        );
    }

    #[test]
    fn test_put_call_deltas_sum_near_one() {
        // |call delta| + |put delta| ~ 1 for matching contracts
        let (t, config) = thirty_day_config();
        let call = option_delta(dec!(100), dec!(105), t, dec!(0.30), OptionType::Call, &config)
            .unwrap();
        let put =
            option_delta(dec!(100), dec!(105), t, dec!(0.30), OptionType::Put, &config).unwrap();
        assert!(
            approx_eq(call - put, dec!(1), dec!(0.05)),
            "call {call} - put {put} should be near 1"
        );
    }

    #[test]
    fn test_position_delta_sign_flip() {
        assert_eq!(position_delta(dec!(0.6), 3), dec!(0.6));
        assert_eq!(position_delta(dec!(0.6), -3), dec!(-0.6));
        assert_eq!(position_delta(dec!(-0.4), -1), dec!(0.4));
    }

    #[test]
    fn test_pricing_rejects_expired_option() {
        let config = PricingConfig::default();
        let result = american_option_price(
            dec!(100),
            dec!(100),
            dec!(0),
            dec!(0.30),
            OptionType::Call,
            &config,
        );
        assert!(result.is_err());
    }

    // -----------------------------------------------------------------------
    // Implied volatility
    // -----------------------------------------------------------------------

    #[test]
    fn test_implied_vol_roundtrip() {
        // Price at a known vol, then recover it from the price
        let (t, config) = thirty_day_config();
        let market_price =
            american_option_price(dec!(100), dec!(100), t, dec!(0.30), OptionType::Call, &config)
                .unwrap();
        let iv = implied_volatility(
            dec!(100),
            dec!(100),
            t,
            market_price,
            OptionType::Call,
            &config,
        )
        .unwrap();
        assert!(
            approx_eq(iv, dec!(0.30), dec!(0.01)),
            "implied vol {iv} should recover 0.30"
        );
    }

    #[test]
    fn test_implied_vol_roundtrip_put() {
        let (t, config) = thirty_day_config();
        let market_price =
            american_option_price(dec!(100), dec!(95), t, dec!(0.45), OptionType::Put, &config)
                .unwrap();
        let iv = implied_volatility(
            dec!(100),
            dec!(95),
            t,
            market_price,
            OptionType::Put,
            &config,
        )
        .unwrap();
        assert!(
            approx_eq(iv, dec!(0.45), dec!(0.01)),
            "implied vol {iv} should recover 0.45"
        );
    }

    #[test]
    fn test_implied_vol_unreachable_price_returns_bracket_edge() {
        // Market price far above anything the bracket can produce: the
        // solver walks to the top of the bracket and reports the midpoint of
        // the final (collapsed) bracket instead of erroring.
        let (t, config) = thirty_day_config();
        let iv = implied_volatility(
            dec!(100),
            dec!(100),
            t,
            dec!(99),
            OptionType::Call,
            &config,
        )
        .unwrap();
        assert!(iv > dec!(4.9), "iv {iv} should sit at the top of the bracket");
    }

    // -----------------------------------------------------------------------
    // Skew fallback
    // -----------------------------------------------------------------------

    #[test]
    fn test_skew_multipliers() {
        let t = dec!(30) / dec!(365);
        // Near the money: base unchanged
        assert_eq!(
            estimate_volatility_with_skew(dec!(0.30), dec!(100), dec!(102), t),
            dec!(0.30)
        );
        // >10% out: 1.1x
        assert_eq!(
            estimate_volatility_with_skew(dec!(0.30), dec!(100), dec!(115), t),
            dec!(0.33)
        );
        // >20% out: 1.2x
        assert_eq!(
            estimate_volatility_with_skew(dec!(0.30), dec!(100), dec!(130), t),
            dec!(0.36)
        );
    }

    #[test]
    fn test_skew_long_dated_damping() {
        let t = dec!(365) / dec!(365);
        let vol = estimate_volatility_with_skew(dec!(0.30), dec!(100), dec!(130), t);
        assert_eq!(vol, dec!(0.324)); // 0.30 * 1.2 * 0.9
    }

    #[test]
    fn test_position_volatility_uses_iv_when_sane() {
        let (t, config) = thirty_day_config();
        let market_price =
            american_option_price(dec!(100), dec!(100), t, dec!(0.50), OptionType::Call, &config)
                .unwrap();
        let vol = position_volatility(
            dec!(100),
            dec!(100),
            t,
            market_price,
            OptionType::Call,
            &config,
        );
        assert!(
            approx_eq(vol, dec!(0.50), dec!(0.01)),
            "position vol {vol} should match the implied 0.50"
        );
    }

    #[test]
    fn test_position_volatility_falls_back_on_zero_mark() {
        let (t, config) = thirty_day_config();
        let vol = position_volatility(
            dec!(100),
            dec!(130),
            t,
            Decimal::ZERO,
            OptionType::Call,
            &config,
        );
        // Zero mark: skew estimate on the 30% default, >20% OTM
        assert_eq!(vol, dec!(0.36));
    }

    #[test]
    fn test_year_fraction() {
        let valuation = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        let expiry = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        assert_eq!(year_fraction(valuation, expiry), dec!(1));
        assert!(year_fraction(expiry, valuation) < Decimal::ZERO);
    }
}
