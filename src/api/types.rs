//! Wire types of the signal API and their conversion into [`TradeSignal`].

use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};

use crate::error::MalformedSignal;
use crate::models::{price_level, Direction, TradeSignal};

/// Response of `GET /master_traders/{source}/{trader_id}`.
///
/// Records are kept raw so one bad record does not fail the batch.
#[derive(Debug, Clone, Deserialize)]
pub struct SignalsResponse {
    #[serde(default)]
    pub signals: Vec<serde_json::Value>,
}

/// One entry of the batched `GET /master_traders/?source=..` response.
#[derive(Debug, Clone, Deserialize)]
pub struct MasterTraderResponse {
    #[serde(deserialize_with = "flex_string")]
    pub external_trader_id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub signals: Vec<serde_json::Value>,
}

/// A signal record as published.
#[derive(Debug, Clone, Deserialize)]
pub struct SignalRecord {
    #[serde(alias = "signal_id", deserialize_with = "flex_string")]
    pub external_signal_id: String,
    pub symbol: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub size: Decimal,
    pub time: String,
    pub price_order: Decimal,
    #[serde(default)]
    pub market_price: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
}

/// Accept ids published either as strings or as integers.
fn flex_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flex {
        Text(String),
        Number(u64),
    }

    Ok(match Flex::deserialize(deserializer)? {
        Flex::Text(s) => s.trim().to_string(),
        Flex::Number(n) => n.to_string(),
    })
}

/// Parse an RFC 3339 timestamp, or a naive ISO-8601 one taken as UTC.
pub fn parse_signal_time(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

impl SignalRecord {
    /// Decode a raw record, reporting why it is unusable.
    pub fn from_value(value: serde_json::Value) -> Result<Self, MalformedSignal> {
        let signal_id = value
            .get("external_signal_id")
            .or_else(|| value.get("signal_id"))
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_default();

        serde_json::from_value(value).map_err(|e| MalformedSignal {
            signal_id,
            reason: e.to_string(),
        })
    }
}

impl TryFrom<SignalRecord> for TradeSignal {
    type Error = MalformedSignal;

    fn try_from(record: SignalRecord) -> Result<Self, Self::Error> {
        let malformed = |reason: String| MalformedSignal {
            signal_id: record.external_signal_id.clone(),
            reason,
        };

        if record.external_signal_id.is_empty()
            || !record.external_signal_id.chars().all(|c| c.is_ascii_digit())
        {
            return Err(malformed("signal id is not a digit string".to_string()));
        }

        let direction: Direction = record.kind.parse().map_err(malformed)?;

        let issued_at = parse_signal_time(&record.time)
            .ok_or_else(|| malformed(format!("unparseable time `{}`", record.time)))?;

        if record.symbol.trim().is_empty() {
            return Err(malformed("empty symbol".to_string()));
        }
        if record.size <= Decimal::ZERO {
            return Err(malformed(format!("non-positive size {}", record.size)));
        }

        Ok(TradeSignal {
            external_signal_id: record.external_signal_id.clone(),
            symbol: record.symbol.trim().to_string(),
            direction,
            size: record.size,
            issued_at,
            order_price: record.price_order,
            market_price: record.market_price,
            stop_loss: record.stop_loss.and_then(price_level),
            take_profit: record.take_profit.and_then(price_level),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_parse_signal_record() {
        let value = json!({
            "id": 12,
            "signal_id": 77,
            "symbol": "EUR/USD",
            "type": "buy",
            "size": 0.5,
            "time": "2024-03-01T11:15:00",
            "price_order": "1.08512",
            "market_price": 1.08515,
            "stop_loss": 0,
            "take_profit": 1.09
        });

        let record = SignalRecord::from_value(value).unwrap();
        let signal = TradeSignal::try_from(record).unwrap();

        assert_eq!(signal.external_signal_id, "77");
        assert_eq!(signal.direction, Direction::Buy);
        assert_eq!(signal.order_price, dec!(1.08512));
        assert_eq!(signal.stop_loss, None);
        assert_eq!(signal.take_profit, Some(dec!(1.09)));
        assert_eq!(signal.issued_at.to_rfc3339(), "2024-03-01T11:15:00+00:00");
    }

    #[test]
    fn test_signal_time_formats() {
        let expected = parse_signal_time("2024-03-01T11:15:00Z").unwrap();
        assert_eq!(parse_signal_time("2024-03-01T13:15:00+02:00"), Some(expected));
        assert_eq!(parse_signal_time("2024-03-01 11:15:00.000"), Some(expected));
        assert_eq!(parse_signal_time("yesterday"), None);
    }

    #[test]
    fn test_malformed_records() {
        let missing_price = json!({
            "external_signal_id": "5", "symbol": "EUR/USD", "type": "SELL",
            "size": 1, "time": "2024-03-01T11:15:00Z"
        });
        let err = SignalRecord::from_value(missing_price).unwrap_err();
        assert_eq!(err.signal_id, "5");

        let bad_type = json!({
            "external_signal_id": "6", "symbol": "EUR/USD", "type": "HOLD",
            "size": 1, "time": "2024-03-01T11:15:00Z", "price_order": 1.1
        });
        let record = SignalRecord::from_value(bad_type).unwrap();
        assert!(TradeSignal::try_from(record).is_err());

        let bad_id = json!({
            "external_signal_id": "a7", "symbol": "EUR/USD", "type": "BUY",
            "size": 1, "time": "2024-03-01T11:15:00Z", "price_order": 1.1
        });
        let record = SignalRecord::from_value(bad_id).unwrap();
        assert!(TradeSignal::try_from(record).is_err());
    }

    #[test]
    fn test_master_trader_response() {
        let body = json!([
            {"external_trader_id": 404656, "source": "fx", "signals": []},
            {"external_trader_id": "12", "source": "fx"}
        ]);
        let traders: Vec<MasterTraderResponse> = serde_json::from_value(body).unwrap();
        assert_eq!(traders[0].external_trader_id, "404656");
        assert!(traders[1].signals.is_empty());
    }
}
