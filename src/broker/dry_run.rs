//! Read-through gateway decorator that never trades.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::BrokerResult;
use crate::models::{HistoricalDeal, Position};

use super::{
    AccountInfo, BrokerGateway, Credentials, OrderRequest, OrderResult, QuoteStatus, SymbolInfo,
};

/// Delegates every read to the wrapped gateway; trade requests are only logged.
///
/// Because nothing is ever opened, every cycle proposes the same creates again.
pub struct DryRun<G> {
    inner: G,
    intercepted: usize,
}

impl<G: BrokerGateway> DryRun<G> {
    pub fn new(inner: G) -> Self {
        Self {
            inner,
            intercepted: 0,
        }
    }

    /// Number of trade requests swallowed so far.
    pub fn intercepted(&self) -> usize {
        self.intercepted
    }

    pub fn into_inner(self) -> G {
        self.inner
    }
}

#[async_trait]
impl<G: BrokerGateway> BrokerGateway for DryRun<G> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn connect(&mut self, credentials: &Credentials) -> BrokerResult<AccountInfo> {
        self.inner.connect(credentials).await
    }

    async fn account_info(&self) -> BrokerResult<AccountInfo> {
        self.inner.account_info().await
    }

    async fn positions(&self) -> BrokerResult<Vec<Position>> {
        self.inner.positions().await
    }

    async fn history_deals(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BrokerResult<Vec<HistoricalDeal>> {
        self.inner.history_deals(from, to).await
    }

    async fn select_symbol(&mut self, symbol: &str) -> BrokerResult<bool> {
        self.inner.select_symbol(symbol).await
    }

    async fn symbol_info(&self, symbol: &str) -> BrokerResult<Option<SymbolInfo>> {
        self.inner.symbol_info(symbol).await
    }

    async fn tick(&self, symbol: &str) -> BrokerResult<QuoteStatus> {
        self.inner.tick(symbol).await
    }

    async fn server_time(&self, clock_symbol: &str) -> BrokerResult<Option<DateTime<Utc>>> {
        self.inner.server_time(clock_symbol).await
    }

    async fn order_send(&mut self, request: &OrderRequest) -> BrokerResult<OrderResult> {
        self.intercepted += 1;
        info!(
            action = ?request.action,
            symbol = %request.symbol,
            direction = ?request.direction,
            volume = ?request.volume,
            sl = ?request.stop_loss,
            tp = ?request.take_profit,
            position = ?request.position,
            magic = %request.magic,
            "[DRY RUN] Would send order"
        );
        Ok(OrderResult::done("Request executed"))
    }

    async fn shutdown(&mut self) -> BrokerResult<()> {
        self.inner.shutdown().await
    }
}
