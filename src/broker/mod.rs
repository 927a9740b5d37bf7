//! Broker trading gateway: the seam between the engine and a trading terminal.
//!
//! Each account driver owns exactly one gateway instance for its lifetime.
//! Mutating calls take `&mut self`, so trade requests for one account are
//! serialized by construction.

mod bridge;
mod dry_run;
mod paper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::BrokerResult;
use crate::models::{Direction, HistoricalDeal, Position};
use crate::trading::CorrelationTag;

pub use bridge::BridgeGateway;
pub use dry_run::DryRun;
pub use paper::PaperGateway;

/// Server return code for a completed request.
pub const RETCODE_DONE: u32 = 10009;
/// Server return code for a partially completed request.
pub const RETCODE_DONE_PARTIAL: u32 = 10010;
/// Server return code for an invalid request.
pub const RETCODE_INVALID: u32 = 10013;

const SUCCESS_COMMENTS: [&str; 2] = ["Request executed", "Request executed partially"];

/// Login details for a trading terminal.
#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub login: u64,
    #[serde(skip_serializing)]
    pub password: String,
    pub server: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_path: Option<String>,
}

/// Account snapshot used for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub login: u64,
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub balance: Decimal,
    #[serde(default)]
    pub equity: Decimal,
    #[serde(default)]
    pub margin_free: Decimal,
    #[serde(default)]
    pub leverage: u32,
    #[serde(default = "default_true")]
    pub trade_allowed: bool,
}

fn default_true() -> bool {
    true
}

/// Latest quote for a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub bid: Decimal,
    pub ask: Decimal,
    pub time: DateTime<Utc>,
}

impl Tick {
    /// Price a deal in `direction` executes at: ask for buys, bid for sells.
    pub fn price_for(&self, direction: Direction) -> Decimal {
        match direction {
            Direction::Buy => self.ask,
            Direction::Sell => self.bid,
        }
    }
}

/// Outcome of a quote request. These are expected conditions, not errors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QuoteStatus {
    Live(Tick),
    /// No tick available (market closed, feed stalled)
    Unavailable,
    /// The broker does not know or cannot select the symbol
    UnknownSymbol,
}

impl QuoteStatus {
    pub fn tick(&self) -> Option<&Tick> {
        match self {
            QuoteStatus::Live(tick) => Some(tick),
            _ => None,
        }
    }
}

/// Filling flags advertised by a symbol (bit 1 = FOK, bit 2 = IOC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SymbolFilling(u8);

impl SymbolFilling {
    pub const FOK: SymbolFilling = SymbolFilling(1);
    pub const IOC: SymbolFilling = SymbolFilling(2);
    pub const ALL: SymbolFilling = SymbolFilling(3);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Order filling modes accepted for this symbol, in preference order.
    pub fn allowed_modes(&self) -> Vec<FillingMode> {
        let mut modes = Vec::new();
        if self.0 & Self::FOK.0 != 0 {
            modes.push(FillingMode::Fok);
        }
        if self.0 & Self::IOC.0 != 0 {
            modes.push(FillingMode::Ioc);
        }
        modes
    }
}

/// Order filling policy sent with a deal request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FillingMode {
    #[default]
    #[serde(alias = "ORDER_FILLING_FOK", alias = "SYMBOL_FILLING_FOK")]
    Fok,
    #[serde(alias = "ORDER_FILLING_IOC", alias = "SYMBOL_FILLING_IOC")]
    Ioc,
    #[serde(alias = "ORDER_FILLING_RETURN")]
    Return,
}

impl FillingMode {
    /// Pick the preferred mode if the symbol allows it, else the first
    /// allowed one, else RETURN.
    pub fn negotiate(preferred: FillingMode, symbol: SymbolFilling) -> FillingMode {
        let allowed = symbol.allowed_modes();
        if allowed.contains(&preferred) {
            return preferred;
        }
        allowed.first().copied().unwrap_or(FillingMode::Return)
    }
}

/// Trading constraints of a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub name: String,
    #[serde(default = "default_digits")]
    pub digits: u32,
    pub volume_min: Decimal,
    pub volume_max: Decimal,
    pub volume_step: Decimal,
    pub filling: SymbolFilling,
}

fn default_digits() -> u32 {
    5
}

/// Kind of trade request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeAction {
    /// Market deal: opens a position, or closes one when `position` is set
    Deal,
    /// Modify stop loss / take profit of an open position
    Sltp,
}

/// Request accepted by [`BrokerGateway::order_send`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub action: TradeAction,
    pub symbol: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(rename = "sl")]
    pub stop_loss: Option<Decimal>,
    #[serde(rename = "tp")]
    pub take_profit: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    pub magic: CorrelationTag,
    pub comment: String,
    #[serde(rename = "type_filling", skip_serializing_if = "Option::is_none")]
    pub filling: Option<FillingMode>,
}

/// Structured result of a trade request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub retcode: u32,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub order: u64,
    #[serde(default)]
    pub deal: u64,
    #[serde(default)]
    pub volume: Decimal,
    #[serde(default)]
    pub price: Decimal,
}

impl OrderResult {
    pub fn done(comment: impl Into<String>) -> Self {
        Self {
            retcode: RETCODE_DONE,
            comment: comment.into(),
            order: 0,
            deal: 0,
            volume: Decimal::ZERO,
            price: Decimal::ZERO,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.retcode, RETCODE_DONE | RETCODE_DONE_PARTIAL)
            || SUCCESS_COMMENTS.contains(&self.comment.as_str())
    }
}

/// Operations the engine needs from a trading terminal.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Human-friendly gateway name for logs.
    fn name(&self) -> &str;

    /// Open the session. Authentication failures are not retried.
    async fn connect(&mut self, credentials: &Credentials) -> BrokerResult<AccountInfo>;

    async fn account_info(&self) -> BrokerResult<AccountInfo>;

    async fn positions(&self) -> BrokerResult<Vec<Position>>;

    async fn history_deals(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BrokerResult<Vec<HistoricalDeal>>;

    /// Make a symbol visible for quoting. `false` if the broker does not know it.
    async fn select_symbol(&mut self, symbol: &str) -> BrokerResult<bool>;

    async fn symbol_info(&self, symbol: &str) -> BrokerResult<Option<SymbolInfo>>;

    async fn tick(&self, symbol: &str) -> BrokerResult<QuoteStatus>;

    /// Server clock, taken from the latest tick of `clock_symbol`.
    async fn server_time(&self, clock_symbol: &str) -> BrokerResult<Option<DateTime<Utc>>> {
        Ok(self.tick(clock_symbol).await?.tick().map(|t| t.time))
    }

    async fn order_send(&mut self, request: &OrderRequest) -> BrokerResult<OrderResult>;

    async fn shutdown(&mut self) -> BrokerResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_filling_mapping() {
        assert_eq!(SymbolFilling::FOK.allowed_modes(), vec![FillingMode::Fok]);
        assert_eq!(SymbolFilling::IOC.allowed_modes(), vec![FillingMode::Ioc]);
        assert_eq!(
            SymbolFilling::ALL.allowed_modes(),
            vec![FillingMode::Fok, FillingMode::Ioc]
        );
        assert!(SymbolFilling::from_bits(0).allowed_modes().is_empty());
    }

    #[test]
    fn test_filling_negotiation() {
        assert_eq!(
            FillingMode::negotiate(FillingMode::Ioc, SymbolFilling::ALL),
            FillingMode::Ioc
        );
        assert_eq!(
            FillingMode::negotiate(FillingMode::Fok, SymbolFilling::IOC),
            FillingMode::Ioc
        );
        assert_eq!(
            FillingMode::negotiate(FillingMode::Fok, SymbolFilling::from_bits(0)),
            FillingMode::Return
        );
    }

    #[test]
    fn test_filling_mode_accepts_terminal_names() {
        let mode: FillingMode = serde_json::from_str("\"ORDER_FILLING_IOC\"").unwrap();
        assert_eq!(mode, FillingMode::Ioc);
        let mode: FillingMode = serde_json::from_str("\"FOK\"").unwrap();
        assert_eq!(mode, FillingMode::Fok);
    }

    #[test]
    fn test_order_result_success() {
        assert!(OrderResult::done("Request executed").is_success());

        let mut partial = OrderResult::done("");
        partial.retcode = RETCODE_DONE_PARTIAL;
        assert!(partial.is_success());

        let mut rejected = OrderResult::done("Invalid stops");
        rejected.retcode = 10016;
        assert!(!rejected.is_success());

        // Older bridges only fill in the comment.
        let mut by_comment = OrderResult::done("Request executed partially");
        by_comment.retcode = 0;
        assert!(by_comment.is_success());
    }

    #[test]
    fn test_tick_price_side() {
        let tick = Tick {
            bid: dec!(1.1000),
            ask: dec!(1.1002),
            time: Utc::now(),
        };
        assert_eq!(tick.price_for(Direction::Buy), dec!(1.1002));
        assert_eq!(tick.price_for(Direction::Sell), dec!(1.1000));
    }
}
