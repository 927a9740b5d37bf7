//! JSON-over-HTTP client for a trading terminal bridge process.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{BrokerError, BrokerResult};
use crate::models::{price_level, Direction, HistoricalDeal, Position};
use crate::trading::CorrelationTag;

use super::{
    AccountInfo, BrokerGateway, Credentials, OrderRequest, OrderResult, QuoteStatus,
    SymbolFilling, SymbolInfo, Tick,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Gateway talking to a terminal bridge over HTTP.
///
/// Terminal timestamps are epoch seconds in broker server time; they are
/// shifted by `server_utc_offset_minutes` into UTC.
pub struct BridgeGateway {
    client: Client,
    base_url: String,
    server_utc_offset_minutes: i64,
    timeout: Duration,
    connected: bool,
}

#[derive(Debug, Serialize)]
struct InitializeRequest<'a> {
    login: u64,
    password: &'a str,
    server: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct WirePosition {
    ticket: u64,
    magic: u64,
    symbol: String,
    /// 0 = buy, 1 = sell
    #[serde(rename = "type")]
    kind: u8,
    volume: Decimal,
    #[serde(default)]
    price_open: Decimal,
    #[serde(default)]
    sl: Decimal,
    #[serde(default)]
    tp: Decimal,
    #[serde(default)]
    time: i64,
}

#[derive(Debug, Deserialize)]
struct WireDeal {
    ticket: u64,
    magic: u64,
    position_id: u64,
    #[serde(default)]
    symbol: String,
    time: i64,
}

#[derive(Debug, Deserialize)]
struct WireTick {
    bid: Decimal,
    ask: Decimal,
    time: i64,
}

#[derive(Debug, Deserialize)]
struct WireSymbol {
    name: String,
    #[serde(default = "default_digits")]
    digits: u32,
    volume_min: Decimal,
    volume_max: Decimal,
    volume_step: Decimal,
    #[serde(default)]
    filling_mode: u8,
}

fn default_digits() -> u32 {
    5
}

#[derive(Debug, Deserialize)]
struct SelectResponse {
    selected: bool,
}

impl BridgeGateway {
    pub fn new(base_url: impl Into<String>, server_utc_offset_minutes: i64) -> anyhow::Result<Self> {
        Self::with_timeout(base_url, server_utc_offset_minutes, DEFAULT_TIMEOUT)
    }

    /// Create with a custom per-request timeout.
    pub fn with_timeout(
        base_url: impl Into<String>,
        server_utc_offset_minutes: i64,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create bridge HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            server_utc_offset_minutes,
            timeout,
            connected: false,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn to_utc(&self, server_secs: i64) -> BrokerResult<DateTime<Utc>> {
        let secs = server_secs - self.server_utc_offset_minutes * 60;
        Utc.timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| BrokerError::Protocol(format!("invalid timestamp {server_secs}")))
    }

    fn to_server_secs(&self, time: DateTime<Utc>) -> i64 {
        time.timestamp() + self.server_utc_offset_minutes * 60
    }

    fn ensure_connected(&self) -> BrokerResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(BrokerError::NotConnected)
        }
    }

    async fn dispatch(&self, call: &'static str, request: RequestBuilder) -> BrokerResult<Response> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                BrokerError::Timeout {
                    call,
                    after: self.timeout,
                }
            } else {
                BrokerError::Transport(format!("{call}: {e}"))
            }
        })?;
        Ok(response)
    }

    async fn expect_json<T: DeserializeOwned>(call: &'static str, response: Response) -> BrokerResult<T> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Authentication(body));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Protocol(format!("{call} returned {status}: {body}")));
        }
        response
            .json()
            .await
            .map_err(|e| BrokerError::Protocol(format!("{call}: failed to decode response: {e}")))
    }

    fn position_from_wire(&self, wire: WirePosition) -> BrokerResult<Position> {
        let direction = match wire.kind {
            0 => Direction::Buy,
            1 => Direction::Sell,
            other => {
                return Err(BrokerError::Protocol(format!(
                    "position {} has unknown type {other}",
                    wire.ticket
                )))
            }
        };
        Ok(Position {
            ticket: wire.ticket,
            correlation_tag: CorrelationTag::new(wire.magic),
            symbol: wire.symbol,
            direction,
            volume: wire.volume,
            open_price: wire.price_open,
            stop_loss: price_level(wire.sl),
            take_profit: price_level(wire.tp),
            opened_at: self.to_utc(wire.time)?,
        })
    }
}

#[async_trait]
impl BrokerGateway for BridgeGateway {
    fn name(&self) -> &str {
        "bridge"
    }

    async fn connect(&mut self, credentials: &Credentials) -> BrokerResult<AccountInfo> {
        let body = InitializeRequest {
            login: credentials.login,
            password: &credentials.password,
            server: &credentials.server,
            path: credentials.terminal_path.as_deref(),
        };
        debug!(url = %self.base_url, login = credentials.login, "Initializing terminal");

        let request = self.client.post(self.url("/initialize")).json(&body);
        let response = self.dispatch("initialize", request).await?;
        let account: AccountInfo = Self::expect_json("initialize", response).await?;

        self.connected = true;
        info!(login = account.login, server = %account.server, "Terminal session opened");
        Ok(account)
    }

    async fn account_info(&self) -> BrokerResult<AccountInfo> {
        self.ensure_connected()?;
        let response = self
            .dispatch("account_info", self.client.get(self.url("/account")))
            .await?;
        Self::expect_json("account_info", response).await
    }

    async fn positions(&self) -> BrokerResult<Vec<Position>> {
        self.ensure_connected()?;
        let response = self
            .dispatch("positions", self.client.get(self.url("/positions")))
            .await?;
        let items: Vec<WirePosition> = Self::expect_json("positions", response).await?;
        items
            .into_iter()
            .map(|p| self.position_from_wire(p))
            .collect()
    }

    async fn history_deals(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> BrokerResult<Vec<HistoricalDeal>> {
        self.ensure_connected()?;
        let url = format!(
            "{}?from={}&to={}",
            self.url("/history/deals"),
            self.to_server_secs(from),
            self.to_server_secs(to)
        );
        let response = self.dispatch("history_deals", self.client.get(&url)).await?;
        let items: Vec<WireDeal> = Self::expect_json("history_deals", response).await?;

        items
            .into_iter()
            .map(|d| {
                Ok(HistoricalDeal {
                    ticket: d.ticket,
                    correlation_tag: CorrelationTag::new(d.magic),
                    position_id: d.position_id,
                    symbol: d.symbol,
                    closed_at: self.to_utc(d.time)?,
                })
            })
            .collect()
    }

    async fn select_symbol(&mut self, symbol: &str) -> BrokerResult<bool> {
        self.ensure_connected()?;
        let request = self.client.post(self.url(&format!("/symbols/{symbol}/select")));
        let response = self.dispatch("select_symbol", request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let selected: SelectResponse = Self::expect_json("select_symbol", response).await?;
        Ok(selected.selected)
    }

    async fn symbol_info(&self, symbol: &str) -> BrokerResult<Option<SymbolInfo>> {
        self.ensure_connected()?;
        let request = self.client.get(self.url(&format!("/symbols/{symbol}")));
        let response = self.dispatch("symbol_info", request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let wire: WireSymbol = Self::expect_json("symbol_info", response).await?;
        Ok(Some(SymbolInfo {
            name: wire.name,
            digits: wire.digits,
            volume_min: wire.volume_min,
            volume_max: wire.volume_max,
            volume_step: wire.volume_step,
            filling: SymbolFilling::from_bits(wire.filling_mode),
        }))
    }

    async fn tick(&self, symbol: &str) -> BrokerResult<QuoteStatus> {
        self.ensure_connected()?;
        let request = self.client.get(self.url(&format!("/symbols/{symbol}/tick")));
        let response = self.dispatch("tick", request).await?;
        match response.status() {
            StatusCode::NOT_FOUND => return Ok(QuoteStatus::UnknownSymbol),
            StatusCode::NO_CONTENT => return Ok(QuoteStatus::Unavailable),
            _ => {}
        }
        let wire: Option<WireTick> = Self::expect_json("tick", response).await?;
        match wire {
            // A zeroed tick is what terminals report for a closed market.
            Some(t) if t.bid > Decimal::ZERO && t.ask > Decimal::ZERO => {
                Ok(QuoteStatus::Live(Tick {
                    bid: t.bid,
                    ask: t.ask,
                    time: self.to_utc(t.time)?,
                }))
            }
            _ => Ok(QuoteStatus::Unavailable),
        }
    }

    async fn order_send(&mut self, request: &OrderRequest) -> BrokerResult<OrderResult> {
        self.ensure_connected()?;
        debug!(symbol = %request.symbol, magic = %request.magic, "Sending order");
        let http = self.client.post(self.url("/orders")).json(request);
        let response = self.dispatch("order_send", http).await?;
        Self::expect_json("order_send", response).await
    }

    async fn shutdown(&mut self) -> BrokerResult<()> {
        if !self.connected {
            return Ok(());
        }
        let response = self
            .dispatch("shutdown", self.client.post(self.url("/shutdown")))
            .await?;
        self.connected = false;
        if !response.status().is_success() {
            return Err(BrokerError::Protocol(format!(
                "shutdown returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_wire_mapping() {
        let gateway = BridgeGateway::new("http://127.0.0.1:8228/", 120).unwrap();
        let wire: WirePosition = serde_json::from_str(
            r#"{"ticket": 51, "magic": 40465699977, "symbol": "EURUSD_", "type": 1,
                "volume": 0.1, "price_open": 1.1, "sl": 0.0, "tp": 1.11, "time": 1700007200}"#,
        )
        .unwrap();

        let position = gateway.position_from_wire(wire).unwrap();
        assert_eq!(position.direction, Direction::Sell);
        assert_eq!(position.correlation_tag.value(), 40465699977);
        assert_eq!(position.stop_loss, None);
        assert_eq!(position.take_profit, Some(dec!(1.11)));
        // Server time is two hours ahead of UTC.
        assert_eq!(position.opened_at.timestamp(), 1700000000);
    }

    #[test]
    fn test_unknown_position_type_is_protocol_error() {
        let gateway = BridgeGateway::new("http://127.0.0.1:8228", 0).unwrap();
        let wire: WirePosition = serde_json::from_str(
            r#"{"ticket": 51, "magic": 1, "symbol": "EURUSD", "type": 4, "volume": 0.1}"#,
        )
        .unwrap();
        assert!(matches!(
            gateway.position_from_wire(wire),
            Err(BrokerError::Protocol(_))
        ));
    }

    #[test]
    fn test_server_clock_shift_round_trips() {
        let gateway = BridgeGateway::new("http://127.0.0.1:8228", -180).unwrap();
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let server = gateway.to_server_secs(now);
        assert_eq!(server, 1_700_000_000 - 180 * 60);
        assert_eq!(gateway.to_utc(server).unwrap(), now);
    }

    #[tokio::test]
    async fn test_calls_require_session() {
        let gateway = BridgeGateway::new("http://127.0.0.1:8228", 0).unwrap();
        assert!(matches!(
            gateway.positions().await,
            Err(BrokerError::NotConnected)
        ));
    }
}
