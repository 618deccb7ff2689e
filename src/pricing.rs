//! Seasonal nightly pricing.
//!
//! Each night of a stay costs `base_price * multiplier`, where the multiplier
//! is the largest rate among the rules covering that night (1.0 when none
//! does). Nights are summed as floating point and truncated once, then
//! extras are added on top.

use chrono::NaiveDate;
use serde::Deserialize;

use crate::model::StayWindow;

#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum PricingError {
    #[error("stay window has no nights")]
    ZeroNights,
    #[error("price overflow")]
    Overflow,
}

/// Date-ranged price multiplier. Both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RateRule {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub rate: f64,
}

impl RateRule {
    pub fn contains(&self, night: NaiveDate) -> bool {
        self.start <= night && night <= self.end
    }
}

pub fn effective_multiplier(night: NaiveDate, rules: &[RateRule]) -> f64 {
    rules
        .iter()
        .filter(|r| r.contains(night))
        .map(|r| r.rate)
        .fold(1.0, f64::max)
}

pub fn compute_total(
    base_price: i64,
    extras_total: i64,
    window: &StayWindow,
    rules: &[RateRule],
) -> Result<i64, PricingError> {
    if window.nights() <= 0 {
        return Err(PricingError::ZeroNights);
    }
    let base = base_price as f64;
    let nightly: f64 = window
        .nights_iter()
        .map(|night| base * effective_multiplier(night, rules))
        .sum();
    if !nightly.is_finite() || nightly >= i64::MAX as f64 {
        return Err(PricingError::Overflow);
    }
    (nightly.trunc() as i64)
        .checked_add(extras_total)
        .ok_or(PricingError::Overflow)
}

/// Integer average price per night; `None` for zero nights.
pub fn per_night_average(total: i64, nights: i64) -> Option<i64> {
    if nights <= 0 {
        return None;
    }
    Some(total / nights)
}

/// Holds the configured rate rules.
#[derive(Debug, Clone, Default)]
pub struct PricingCalculator {
    rules: Vec<RateRule>,
}

impl PricingCalculator {
    pub fn new(rules: Vec<RateRule>) -> Self {
        Self { rules }
    }

    pub fn total(
        &self,
        base_price: i64,
        extras_total: i64,
        window: &StayWindow,
    ) -> Result<i64, PricingError> {
        compute_total(base_price, extras_total, window, &self.rules)
    }

    /// Stay total with no extras and its per-night average.
    pub fn quote(&self, base_price: i64, window: &StayWindow) -> Result<(i64, i64), PricingError> {
        let total = self.total(base_price, 0, window)?;
        let per_night = per_night_average(total, window.nights()).ok_or(PricingError::ZeroNights)?;
        Ok((total, per_night))
    }
}
