//! Translation of decisions into broker trade requests.

use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::broker::{FillingMode, OrderRequest, SymbolInfo, Tick, TradeAction};
use crate::models::{Position, TradeSignal};

use super::CorrelationTag;

/// Maps source symbols ("EUR/USD") to broker symbols ("EURUSD" + postfix).
#[derive(Debug, Clone, Default)]
pub struct SymbolMapper {
    postfix: String,
}

impl SymbolMapper {
    pub fn new(postfix: impl Into<String>) -> Self {
        Self {
            postfix: postfix.into(),
        }
    }

    pub fn broker_symbol(&self, source_symbol: &str) -> String {
        let mut symbol: String = source_symbol
            .trim()
            .chars()
            .filter(|c| *c != '/')
            .collect();
        symbol.push_str(&self.postfix);
        symbol
    }
}

/// Per-account order parameters.
#[derive(Debug, Clone)]
pub struct OrderPolicy {
    pub bot_name: String,
    pub volume_coefficient: Decimal,
    pub filling_mode: FillingMode,
}

impl OrderPolicy {
    pub fn comment(&self) -> String {
        format!("Made by {}", self.bot_name)
    }

    /// Scale a signal size into a tradable volume for `symbol`.
    ///
    /// Rounds down to the volume step and clamps into the symbol's limits.
    /// A size below `volume_min` is raised to it, which is logged as a warning.
    /// Returns `None` when the scaled size is not positive.
    pub fn scale_volume(&self, size: Decimal, symbol: &SymbolInfo) -> Option<Decimal> {
        let scaled = size * self.volume_coefficient;
        if scaled <= Decimal::ZERO {
            return None;
        }

        let stepped = if symbol.volume_step > Decimal::ZERO {
            (scaled / symbol.volume_step).floor() * symbol.volume_step
        } else {
            scaled
        };

        let volume = stepped.max(symbol.volume_min).min(symbol.volume_max);
        if volume > scaled {
            warn!(
                %scaled,
                %volume,
                symbol = %symbol.name,
                "Volume raised to symbol minimum, exposure exceeds the coefficient"
            );
        } else if volume != scaled {
            debug!(%scaled, %volume, symbol = %symbol.name, "Volume adjusted to symbol limits");
        }
        (volume > Decimal::ZERO).then_some(volume.normalize())
    }

    /// Market deal opening a copy of `signal`.
    ///
    /// Stop loss and take profit are sent as the signal carries them, the same
    /// values [`modify_request`](Self::modify_request) sends and the classifier
    /// compares against.
    pub fn open_request(
        &self,
        tag: CorrelationTag,
        signal: &TradeSignal,
        symbol: &SymbolInfo,
        tick: &Tick,
    ) -> Option<OrderRequest> {
        let volume = self.scale_volume(signal.size, symbol)?;
        Some(OrderRequest {
            action: TradeAction::Deal,
            symbol: symbol.name.clone(),
            volume: Some(volume),
            direction: Some(signal.direction),
            price: Some(round_price(tick.price_for(signal.direction), symbol)),
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            position: None,
            magic: tag,
            comment: self.comment(),
            filling: Some(FillingMode::negotiate(self.filling_mode, symbol.filling)),
        })
    }

    /// Reissue stop loss and take profit of `position`. Volume and entry are untouched.
    pub fn modify_request(&self, position: &Position, signal: &TradeSignal) -> OrderRequest {
        OrderRequest {
            action: TradeAction::Sltp,
            symbol: position.symbol.clone(),
            volume: None,
            direction: None,
            price: None,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            position: Some(position.ticket),
            magic: position.correlation_tag,
            comment: self.comment(),
            filling: None,
        }
    }

    /// Opposite market deal closing `position` in full.
    pub fn close_request(
        &self,
        position: &Position,
        symbol: &SymbolInfo,
        tick: &Tick,
    ) -> OrderRequest {
        let direction = position.direction.opposite();
        OrderRequest {
            action: TradeAction::Deal,
            symbol: position.symbol.clone(),
            volume: Some(position.volume),
            direction: Some(direction),
            price: Some(round_price(tick.price_for(direction), symbol)),
            stop_loss: None,
            take_profit: None,
            position: Some(position.ticket),
            magic: position.correlation_tag,
            comment: self.comment(),
            filling: Some(FillingMode::negotiate(self.filling_mode, symbol.filling)),
        }
    }
}

fn round_price(price: Decimal, symbol: &SymbolInfo) -> Decimal {
    price.round_dp(symbol.digits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::SymbolFilling;
    use crate::models::Direction;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn policy(coefficient: Decimal) -> OrderPolicy {
        OrderPolicy {
            bot_name: "copier-1".to_string(),
            volume_coefficient: coefficient,
            filling_mode: FillingMode::Fok,
        }
    }

    fn eurusd() -> SymbolInfo {
        SymbolInfo {
            name: "EURUSD_".to_string(),
            digits: 5,
            volume_min: dec!(0.01),
            volume_max: dec!(50),
            volume_step: dec!(0.01),
            filling: SymbolFilling::IOC,
        }
    }

    fn tick() -> Tick {
        Tick {
            bid: dec!(1.100004),
            ask: dec!(1.100206),
            time: Utc::now(),
        }
    }

    fn signal() -> TradeSignal {
        TradeSignal {
            external_signal_id: "77".to_string(),
            symbol: "EUR/USD".to_string(),
            direction: Direction::Buy,
            size: dec!(1),
            issued_at: Utc::now(),
            order_price: dec!(1.1),
            market_price: None,
            stop_loss: Some(dec!(1.0950004)),
            take_profit: None,
        }
    }

    #[test]
    fn test_symbol_mapping() {
        assert_eq!(SymbolMapper::new("_").broker_symbol("EUR/USD"), "EURUSD_");
        assert_eq!(SymbolMapper::new("").broker_symbol("XAUUSD"), "XAUUSD");
        assert_eq!(SymbolMapper::default().broker_symbol(" GBP/JPY "), "GBPJPY");
    }

    #[test]
    fn test_volume_scaling() {
        let info = eurusd();
        assert_eq!(policy(dec!(0.5)).scale_volume(dec!(0.37), &info), Some(dec!(0.18)));
        assert_eq!(policy(dec!(1)).scale_volume(dec!(0.001), &info), Some(dec!(0.01)));
        assert_eq!(policy(dec!(0.01)).scale_volume(dec!(0.5), &info), Some(dec!(0.01)));
        assert_eq!(policy(dec!(10)).scale_volume(dec!(20), &info), Some(dec!(50)));
        assert_eq!(policy(dec!(1)).scale_volume(dec!(0), &info), None);
        assert_eq!(policy(dec!(0)).scale_volume(dec!(3), &info), None);
    }

    #[test]
    fn test_open_request() {
        let request = policy(dec!(2))
            .open_request(CorrelationTag::new(40465699977), &signal(), &eurusd(), &tick())
            .unwrap();

        assert_eq!(request.action, TradeAction::Deal);
        assert_eq!(request.symbol, "EURUSD_");
        assert_eq!(request.volume, Some(dec!(2)));
        assert_eq!(request.price, Some(dec!(1.10021)));
        assert_eq!(request.stop_loss, Some(dec!(1.0950004)));
        assert_eq!(request.take_profit, None);
        assert_eq!(request.magic.value(), 40465699977);
        assert_eq!(request.comment, "Made by copier-1");
        // FOK preferred but the symbol only allows IOC.
        assert_eq!(request.filling, Some(FillingMode::Ioc));
    }

    #[test]
    fn test_close_request_is_opposite_side() {
        let position = Position {
            ticket: 9,
            correlation_tag: CorrelationTag::new(40465699977),
            symbol: "EURUSD_".to_string(),
            direction: Direction::Buy,
            volume: dec!(0.3),
            open_price: dec!(1.1),
            stop_loss: None,
            take_profit: None,
            opened_at: Utc::now(),
        };
        let request = policy(dec!(1)).close_request(&position, &eurusd(), &tick());

        assert_eq!(request.direction, Some(Direction::Sell));
        assert_eq!(request.price, Some(dec!(1.10000)));
        assert_eq!(request.position, Some(9));
        assert_eq!(request.volume, Some(dec!(0.3)));

        let modify = policy(dec!(1)).modify_request(&position, &signal());
        assert_eq!(modify.action, TradeAction::Sltp);
        assert_eq!(modify.position, Some(9));
        assert_eq!(modify.volume, None);
        assert_eq!(modify.stop_loss, Some(dec!(1.0950004)));
    }

    #[test]
    fn test_open_and_modify_send_the_same_levels() {
        let usdjpy = SymbolInfo {
            name: "USDJPY".to_string(),
            digits: 3,
            ..eurusd()
        };
        let mut signal = signal();
        signal.stop_loss = Some(dec!(149.1234));
        signal.take_profit = Some(dec!(151.98765));
        let jpy_tick = Tick {
            bid: dec!(149.5004),
            ask: dec!(149.5106),
            time: Utc::now(),
        };

        let policy = policy(dec!(1));
        let open = policy
            .open_request(CorrelationTag::new(40465699977), &signal, &usdjpy, &jpy_tick)
            .unwrap();
        assert_eq!(open.price, Some(dec!(149.511)));
        assert_eq!(open.stop_loss, Some(dec!(149.1234)));

        let position = Position {
            ticket: 9,
            correlation_tag: open.magic,
            symbol: open.symbol.clone(),
            direction: Direction::Buy,
            volume: dec!(1),
            open_price: dec!(149.511),
            stop_loss: open.stop_loss,
            take_profit: open.take_profit,
            opened_at: Utc::now(),
        };
        let modify = policy.modify_request(&position, &signal);
        assert_eq!(modify.stop_loss, open.stop_loss);
        assert_eq!(modify.take_profit, open.take_profit);
    }
}
