//! In-memory simulated account for offline rehearsal and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::error::{BrokerError, BrokerResult};
use crate::models::{Direction, HistoricalDeal, Position};
use crate::trading::CorrelationTag;

use super::{
    AccountInfo, BrokerGateway, Credentials, OrderRequest, OrderResult, QuoteStatus,
    SymbolFilling, SymbolInfo, Tick, TradeAction, RETCODE_INVALID,
};

const RETCODE_INVALID_VOLUME: u32 = 10014;
const RETCODE_MARKET_CLOSED: u32 = 10018;

/// Simulated trading terminal.
///
/// Deals fill immediately at the quoted price. Closing a position moves it
/// into the deal history, the same way a terminal records an exit deal.
pub struct PaperGateway {
    account: AccountInfo,
    connected: bool,
    offline: bool,
    reject_login: bool,
    clock: Option<DateTime<Utc>>,
    symbols: HashMap<String, SymbolInfo>,
    quotes: HashMap<String, (Decimal, Decimal)>,
    positions: Vec<Position>,
    deals: Vec<HistoricalDeal>,
    next_ticket: u64,
    forced_rejection: Option<(u32, String)>,
    sent: Vec<OrderRequest>,
}

impl PaperGateway {
    /// Create an empty simulated account.
    pub fn new(login: u64, balance: Decimal) -> Self {
        Self {
            account: AccountInfo {
                login,
                server: "paper".to_string(),
                currency: "USD".to_string(),
                balance,
                equity: balance,
                margin_free: balance,
                leverage: 100,
                trade_allowed: true,
            },
            connected: false,
            offline: false,
            reject_login: false,
            clock: None,
            symbols: HashMap::new(),
            quotes: HashMap::new(),
            positions: Vec::new(),
            deals: Vec::new(),
            next_ticket: 1000,
            forced_rejection: None,
            sent: Vec::new(),
        }
    }

    /// Register a symbol with default forex constraints and a live quote.
    pub fn with_quote(mut self, symbol: &str, bid: Decimal, ask: Decimal) -> Self {
        self.symbols
            .entry(symbol.to_string())
            .or_insert_with(|| default_symbol(symbol));
        self.quotes.insert(symbol.to_string(), (bid, ask));
        self
    }

    /// Register a symbol that is known but has no quote (market closed).
    pub fn with_closed_market(mut self, symbol: &str) -> Self {
        self.symbols
            .insert(symbol.to_string(), default_symbol(symbol));
        self.quotes.remove(symbol);
        self
    }

    pub fn with_symbol(mut self, info: SymbolInfo) -> Self {
        self.symbols.insert(info.name.clone(), info);
        self
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.next_ticket = self.next_ticket.max(position.ticket + 1);
        self.positions.push(position);
        self
    }

    pub fn with_deal(mut self, deal: HistoricalDeal) -> Self {
        self.next_ticket = self.next_ticket.max(deal.ticket + 1);
        self.deals.push(deal);
        self
    }

    /// Pin the server clock. Ticks are stamped with this time.
    pub fn with_clock(mut self, now: DateTime<Utc>) -> Self {
        self.clock = Some(now);
        self
    }

    /// Refuse the next logins with an authentication error.
    pub fn with_rejected_login(mut self) -> Self {
        self.reject_login = true;
        self
    }

    /// Make every read fail with a transport error.
    pub fn set_offline(&mut self, offline: bool) {
        self.offline = offline;
    }

    /// Reject every trade request with the given server code.
    pub fn reject_orders(&mut self, retcode: u32, comment: &str) {
        self.forced_rejection = Some((retcode, comment.to_string()));
    }

    pub fn accept_orders(&mut self) {
        self.forced_rejection = None;
    }

    pub fn set_quote(&mut self, symbol: &str, bid: Decimal, ask: Decimal) {
        self.symbols
            .entry(symbol.to_string())
            .or_insert_with(|| default_symbol(symbol));
        self.quotes.insert(symbol.to_string(), (bid, ask));
    }

    /// Remove a position as if the broker closed it (stop-out, manual close).
    pub fn close_externally(&mut self, ticket: u64) -> bool {
        match self.positions.iter().position(|p| p.ticket == ticket) {
            Some(index) => {
                let position = self.positions.remove(index);
                self.record_exit(&position);
                true
            }
            None => false,
        }
    }

    pub fn open_positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn deal_history(&self) -> &[HistoricalDeal] {
        &self.deals
    }

    /// Every request received by `order_send`, in order.
    pub fn sent_orders(&self) -> &[OrderRequest] {
        &self.sent
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn position_by_tag(&self, tag: CorrelationTag) -> Option<&Position> {
        self.positions.iter().find(|p| p.correlation_tag == tag)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.unwrap_or_else(Utc::now)
    }

    fn ensure_online(&self) -> BrokerResult<()> {
        if self.offline {
            return Err(BrokerError::Transport("paper terminal offline".to_string()));
        }
        if !self.connected {
            return Err(BrokerError::NotConnected);
        }
        Ok(())
    }

    fn allocate_ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }

    fn record_exit(&mut self, position: &Position) {
        let ticket = self.allocate_ticket();
        let closed_at = self.now();
        self.deals.push(HistoricalDeal {
            ticket,
            correlation_tag: position.correlation_tag,
            position_id: position.ticket,
            symbol: position.symbol.clone(),
            closed_at,
        });
    }

    fn rejected(retcode: u32, comment: &str) -> OrderResult {
        OrderResult {
            retcode,
            ..OrderResult::done(comment)
        }
    }

    fn execute_deal(&mut self, request: &OrderRequest) -> OrderResult {
        let Some(&(bid, ask)) = self.quotes.get(&request.symbol) else {
            return Self::rejected(RETCODE_MARKET_CLOSED, "Market closed");
        };
        let Some(direction) = request.direction else {
            return Self::rejected(RETCODE_INVALID, "Invalid request");
        };
        let price = match direction {
            Direction::Buy => ask,
            Direction::Sell => bid,
        };

        if let Some(ticket) = request.position {
            let Some(index) = self.positions.iter().position(|p| p.ticket == ticket) else {
                return Self::rejected(RETCODE_INVALID, "Position doesn't exist");
            };
            if self.positions[index].direction == direction {
                return Self::rejected(RETCODE_INVALID, "Invalid request");
            }
            let position = self.positions.remove(index);
            self.record_exit(&position);
            let deal = self.next_ticket - 1;
            debug!(ticket, magic = %position.correlation_tag, "Paper position closed");
            return OrderResult {
                deal,
                volume: position.volume,
                price,
                ..OrderResult::done("Request executed")
            };
        }

        let volume = request.volume.unwrap_or(Decimal::ZERO);
        if let Some(info) = self.symbols.get(&request.symbol) {
            if volume < info.volume_min || volume > info.volume_max {
                return Self::rejected(RETCODE_INVALID_VOLUME, "Invalid volume");
            }
        }

        let ticket = self.allocate_ticket();
        let opened_at = self.now();
        self.positions.push(Position {
            ticket,
            correlation_tag: request.magic,
            symbol: request.symbol.clone(),
            direction,
            volume,
            open_price: price,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            opened_at,
        });
        // Entry deals are part of the history too.
        let deal = self.allocate_ticket();
        self.deals.push(HistoricalDeal {
            ticket: deal,
            correlation_tag: request.magic,
            position_id: ticket,
            symbol: request.symbol.clone(),
            closed_at: opened_at,
        });
        debug!(ticket, magic = %request.magic, "Paper position opened");

        OrderResult {
            order: ticket,
            deal,
            volume,
            price,
            ..OrderResult::done("Request executed")
        }
    }

    fn modify_levels(&mut self, request: &OrderRequest) -> OrderResult {
        let target = request.position;
        match self.positions.iter_mut().find(|p| Some(p.ticket) == target) {
            Some(position) => {
                position.stop_loss = request.stop_loss;
                position.take_profit = request.take_profit;
                OrderResult::done("Request executed")
            }
            None => Self::rejected(RETCODE_INVALID, "Position doesn't exist"),
        }
    }
}

fn default_symbol(name: &str) -> SymbolInfo {
    SymbolInfo {
        name: name.to_string(),
        digits: if name.to_uppercase().contains("JPY") { 3 } else { 5 },
        volume_min: dec!(0.01),
        volume_max: dec!(100),
        volume_step: dec!(0.01),
        filling: SymbolFilling::ALL,
    }
}

#[async_trait]
impl BrokerGateway for PaperGateway {
    fn name(&self) -> &str {
        "paper"
    }

    async fn connect(&mut self, credentials: &Credentials) -> BrokerResult<AccountInfo> {
        if self.reject_login {
            return Err(BrokerError::Authentication(format!(
                "invalid account {}",
                credentials.login
            )));
        }
        self.connected = true;
        self.account.login = credentials.login;
        Ok(self.account.clone())
    }

    async fn account_info(&self) -> BrokerResult<AccountInfo> {
        self.ensure_online()?;
        Ok(self.account.clone())
    }

    async fn positions(&self) -> BrokerResult<Vec<Position>> {
        self.ensure_online()?;
        Ok(self.positions.clone())
    }

    async fn history_deals(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BrokerResult<Vec<HistoricalDeal>> {
        self.ensure_online()?;
        Ok(self
            .deals
            .iter()
            .filter(|d| d.closed_at >= from && d.closed_at <= to)
            .cloned()
            .collect())
    }

    async fn select_symbol(&mut self, symbol: &str) -> BrokerResult<bool> {
        self.ensure_online()?;
        Ok(self.symbols.contains_key(symbol))
    }

    async fn symbol_info(&self, symbol: &str) -> BrokerResult<Option<SymbolInfo>> {
        self.ensure_online()?;
        Ok(self.symbols.get(symbol).cloned())
    }

    async fn tick(&self, symbol: &str) -> BrokerResult<QuoteStatus> {
        self.ensure_online()?;
        if !self.symbols.contains_key(symbol) {
            return Ok(QuoteStatus::UnknownSymbol);
        }
        Ok(match self.quotes.get(symbol) {
            Some(&(bid, ask)) => QuoteStatus::Live(Tick {
                bid,
                ask,
                time: self.now(),
            }),
            None => QuoteStatus::Unavailable,
        })
    }

    async fn server_time(&self, _clock_symbol: &str) -> BrokerResult<Option<DateTime<Utc>>> {
        self.ensure_online()?;
        Ok(self.clock)
    }

    async fn order_send(&mut self, request: &OrderRequest) -> BrokerResult<OrderResult> {
        self.ensure_online()?;
        self.sent.push(request.clone());

        if let Some((retcode, comment)) = &self.forced_rejection {
            return Ok(Self::rejected(*retcode, comment));
        }

        Ok(match request.action {
            TradeAction::Deal => self.execute_deal(request),
            TradeAction::Sltp => self.modify_levels(request),
        })
    }

    async fn shutdown(&mut self) -> BrokerResult<()> {
        self.connected = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::FillingMode;

    fn credentials() -> Credentials {
        Credentials {
            login: 7001,
            password: "secret".to_string(),
            server: "Paper-Demo".to_string(),
            terminal_path: None,
        }
    }

    fn open_request(tag: u64, direction: Direction) -> OrderRequest {
        OrderRequest {
            action: TradeAction::Deal,
            symbol: "EURUSD".to_string(),
            volume: Some(dec!(0.10)),
            direction: Some(direction),
            price: None,
            stop_loss: Some(dec!(1.09)),
            take_profit: None,
            position: None,
            magic: CorrelationTag::new(tag),
            comment: "test".to_string(),
            filling: Some(FillingMode::Fok),
        }
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let gateway = PaperGateway::new(7001, dec!(10000));
        assert!(matches!(
            gateway.positions().await,
            Err(BrokerError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_open_modify_close_cycle() {
        let mut gateway = PaperGateway::new(7001, dec!(10000))
            .with_quote("EURUSD", dec!(1.1000), dec!(1.1002));
        gateway.connect(&credentials()).await.unwrap();

        let opened = gateway
            .order_send(&open_request(42, Direction::Buy))
            .await
            .unwrap();
        assert!(opened.is_success());
        assert_eq!(opened.price, dec!(1.1002));

        let position = gateway.positions().await.unwrap().remove(0);
        assert_eq!(position.correlation_tag, CorrelationTag::new(42));

        let modify = OrderRequest {
            action: TradeAction::Sltp,
            position: Some(position.ticket),
            stop_loss: Some(dec!(1.095)),
            take_profit: Some(dec!(1.12)),
            volume: None,
            direction: None,
            filling: None,
            ..open_request(42, Direction::Buy)
        };
        assert!(gateway.order_send(&modify).await.unwrap().is_success());
        let position = gateway.positions().await.unwrap().remove(0);
        assert_eq!(position.stop_loss, Some(dec!(1.095)));
        assert_eq!(position.take_profit, Some(dec!(1.12)));

        let close = OrderRequest {
            position: Some(position.ticket),
            ..open_request(42, Direction::Sell)
        };
        let closed = gateway.order_send(&close).await.unwrap();
        assert!(closed.is_success());
        assert_eq!(closed.price, dec!(1.1000));
        assert!(gateway.positions().await.unwrap().is_empty());

        let history = gateway.deal_history();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|d| d.position_id == position.ticket));
    }

    #[tokio::test]
    async fn test_rejects_volume_outside_symbol_limits() {
        let mut gateway = PaperGateway::new(7001, dec!(10000))
            .with_quote("EURUSD", dec!(1.1000), dec!(1.1002));
        gateway.connect(&credentials()).await.unwrap();

        let request = OrderRequest {
            volume: Some(dec!(500)),
            ..open_request(42, Direction::Buy)
        };
        let result = gateway.order_send(&request).await.unwrap();
        assert_eq!(result.retcode, RETCODE_INVALID_VOLUME);
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn test_quote_states() {
        let mut gateway = PaperGateway::new(7001, dec!(10000))
            .with_quote("EURUSD", dec!(1.1000), dec!(1.1002))
            .with_closed_market("XAUUSD");
        gateway.connect(&credentials()).await.unwrap();

        assert!(matches!(gateway.tick("EURUSD").await.unwrap(), QuoteStatus::Live(_)));
        assert_eq!(gateway.tick("XAUUSD").await.unwrap(), QuoteStatus::Unavailable);
        assert_eq!(gateway.tick("BTCUSD").await.unwrap(), QuoteStatus::UnknownSymbol);
        assert!(!gateway.select_symbol("BTCUSD").await.unwrap());
    }
}
