//! Broker-side account state: open positions and closed deals.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::trading::CorrelationTag;

use super::Direction;

/// A currently open trade on the target account.
///
/// Snapshots are owned by the broker gateway; the engine only reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticket: u64,

    /// Broker "magic" field
    pub correlation_tag: CorrelationTag,

    pub symbol: String,

    pub direction: Direction,

    pub volume: Decimal,

    #[serde(default)]
    pub open_price: Decimal,

    /// `None` when no stop loss is set (the broker reports 0)
    #[serde(default)]
    pub stop_loss: Option<Decimal>,

    #[serde(default)]
    pub take_profit: Option<Decimal>,

    #[serde(default = "Utc::now")]
    pub opened_at: DateTime<Utc>,
}

/// An immutable record of a deal in the account history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalDeal {
    pub ticket: u64,

    pub correlation_tag: CorrelationTag,

    /// Ticket of the position this deal belonged to
    pub position_id: u64,

    #[serde(default)]
    pub symbol: String,

    pub closed_at: DateTime<Utc>,
}

/// Map a broker price level where 0 (or below) means "not set".
pub fn price_level(value: Decimal) -> Option<Decimal> {
    (value > Decimal::ZERO).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_zero_price_level_is_unset() {
        assert_eq!(price_level(dec!(0)), None);
        assert_eq!(price_level(dec!(-1)), None);
        assert_eq!(price_level(dec!(1.10001)), Some(dec!(1.10001)));
    }
}
