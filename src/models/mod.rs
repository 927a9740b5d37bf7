//! Data models for signals, positions, and deals.

mod position;
mod signal;

pub use position::{price_level, HistoricalDeal, Position};
pub use signal::{Direction, TradeSignal};
