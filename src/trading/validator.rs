//! Staleness checks for signals that would open a new trade.
//!
//! A signal is copied only while its market context still holds:
//! - it was issued no longer than `max_signal_age_minutes` ago, and
//! - the live price has not drifted more than `max_price_drift_pips` from
//!   the price the signal was issued at.
//!
//! Validation is never applied to updates or closes of tracked trades.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::broker::QuoteStatus;
use crate::models::TradeSignal;

/// Thresholds for copying a new signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Maximum age of a signal to copy (minutes)
    pub max_signal_age_minutes: i64,

    /// Maximum distance between issue price and live price (pips)
    pub max_price_drift_pips: Decimal,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_signal_age_minutes: 30,
            max_price_drift_pips: dec!(10),
        }
    }
}

/// Which check rejected a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    TooOld,
    PriceDrift,
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::TooOld => f.write_str("too old"),
            StaleReason::PriceDrift => f.write_str("price drift"),
        }
    }
}

/// Measured values behind a validation outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub age: Duration,
    pub max_age: Duration,
    /// Live price the signal would execute at, when quoted
    pub current_price: Option<Decimal>,
    pub drift_pips: Option<Decimal>,
    pub max_drift_pips: Decimal,
}

impl ValidationReport {
    pub fn age_minutes(&self) -> i64 {
        self.age.num_minutes()
    }
}

/// Outcome of validating a would-be create.
#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Accepted(ValidationReport),
    Stale {
        reason: StaleReason,
        report: ValidationReport,
    },
    /// Symbol is known but has no live quote (market closed)
    QuoteUnavailable,
    /// Symbol is not offered by the broker
    SymbolUnavailable,
}

impl Validation {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Validation::Accepted(_))
    }
}

/// Pips per unit of price: 100 for JPY-quoted symbols, 10,000 otherwise.
pub fn pip_multiplier(symbol: &str) -> Decimal {
    if symbol.to_uppercase().contains("JPY") {
        dec!(100)
    } else {
        dec!(10000)
    }
}

/// Applies the age and price-drift checks.
#[derive(Debug, Clone)]
pub struct SignalValidator {
    config: ValidatorConfig,
}

impl SignalValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// Validate `signal` against the quote of its broker symbol at `now`.
    ///
    /// `now` should be the broker server clock when one is available.
    pub fn validate(
        &self,
        signal: &TradeSignal,
        broker_symbol: &str,
        quote: &QuoteStatus,
        now: DateTime<Utc>,
    ) -> Validation {
        let age = now - signal.issued_at;
        let max_age = Duration::minutes(self.config.max_signal_age_minutes);

        let current_price = quote.tick().map(|t| t.price_for(signal.direction));
        let drift_pips = current_price
            .map(|price| (price - signal.order_price).abs() * pip_multiplier(broker_symbol));

        let report = ValidationReport {
            age,
            max_age,
            current_price,
            drift_pips,
            max_drift_pips: self.config.max_price_drift_pips,
        };

        // Age needs no quote, so it is decided first.
        if age > max_age {
            return Validation::Stale {
                reason: StaleReason::TooOld,
                report,
            };
        }

        match (quote, drift_pips) {
            (QuoteStatus::UnknownSymbol, _) => Validation::SymbolUnavailable,
            (_, None) => Validation::QuoteUnavailable,
            (_, Some(drift)) if drift > self.config.max_price_drift_pips => Validation::Stale {
                reason: StaleReason::PriceDrift,
                report,
            },
            (_, Some(_)) => Validation::Accepted(report),
        }
    }
}
