//! Signal API client.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{MalformedSignal, SourceFetchError};
use crate::models::TradeSignal;
use crate::trading::{CorrelationTag, TagFamily};

use super::types::{MasterTraderResponse, SignalRecord, SignalsResponse};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// One (source, trader) pair configured for an account.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TraderPair {
    pub source: String,
    pub family: TagFamily,
}

impl TraderPair {
    pub fn trader_id(&self) -> &str {
        self.family.trader_id()
    }
}

/// Validated signals of one pair for one cycle.
#[derive(Debug, Clone)]
pub struct SignalBatch {
    pub pair: TraderPair,
    pub signals: Vec<TradeSignal>,
    /// Records dropped at the fetch boundary
    pub invalid_signal_count: usize,
    /// Tags of dropped records whose id was still readable. The signal is
    /// live upstream, so its position must not be treated as withdrawn.
    pub held_tags: HashSet<CorrelationTag>,
}

pub type FetchResult = Result<SignalBatch, SourceFetchError>;

/// Anything that can supply signal batches.
#[async_trait]
pub trait SignalSource: Send + Sync {
    async fn fetch_signals(&self, pair: &TraderPair) -> FetchResult;

    /// Fetch every pair concurrently. One pair's failure never affects another.
    async fn fetch_many(&self, pairs: &[TraderPair]) -> Vec<(TraderPair, FetchResult)> {
        fetch_each(self, pairs).await
    }
}

/// Issue one `fetch_signals` per pair, concurrently, keeping pair order.
pub async fn fetch_each<S>(source: &S, pairs: &[TraderPair]) -> Vec<(TraderPair, FetchResult)>
where
    S: SignalSource + ?Sized,
{
    let results = join_all(pairs.iter().map(|pair| source.fetch_signals(pair))).await;
    pairs.iter().cloned().zip(results).collect()
}

/// Convert raw records into validated signals for `pair`.
pub fn build_batch(pair: &TraderPair, records: Vec<serde_json::Value>) -> SignalBatch {
    let mut signals = Vec::with_capacity(records.len());
    let mut invalid = 0;
    let mut held_tags = HashSet::new();

    for value in records {
        let parsed = SignalRecord::from_value(value)
            .and_then(TradeSignal::try_from)
            .and_then(|signal| match pair.family.tag(&signal.external_signal_id) {
                Ok(_) => Ok(signal),
                Err(e) => Err(MalformedSignal {
                    signal_id: signal.external_signal_id,
                    reason: e.to_string(),
                }),
            });

        match parsed {
            Ok(signal) => signals.push(signal),
            Err(e) => {
                invalid += 1;
                let held = pair.family.tag(e.signal_id.trim()).ok();
                warn!(
                    trader = pair.trader_id(),
                    source = %pair.source,
                    signal_id = %e.signal_id,
                    reason = %e.reason,
                    held = held.is_some(),
                    "Dropping malformed signal"
                );
                held_tags.extend(held);
            }
        }
    }

    SignalBatch {
        pair: pair.clone(),
        signals,
        invalid_signal_count: invalid,
        held_tags,
    }
}

/// HTTP client for the signal API.
pub struct SignalClient {
    client: Client,
    base_url: String,
    timeout: Duration,
    batched: bool,
}

impl SignalClient {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_options(base_url, DEFAULT_TIMEOUT, false)
    }

    /// Create with a custom timeout, optionally using the batched endpoint.
    pub fn with_options(base_url: &str, timeout: Duration, batched: bool) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            batched,
        })
    }

    pub fn single_url(&self, pair: &TraderPair) -> String {
        format!(
            "{}/master_traders/{}/{}",
            self.base_url,
            pair.source,
            pair.trader_id()
        )
    }

    pub fn batch_url(&self, source: &str, trader_ids: &[&str]) -> String {
        format!(
            "{}/master_traders/?source={}&external_trader_ids={}",
            self.base_url,
            source,
            trader_ids.join(",")
        )
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, SourceFetchError> {
        debug!(url = %url, "Fetching signals");

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                SourceFetchError::Timeout {
                    url: url.to_string(),
                    after: self.timeout,
                }
            } else {
                SourceFetchError::Transport {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::CREATED {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceFetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await.map_err(|e| SourceFetchError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        serde_json::from_str(&body).map_err(|e| SourceFetchError::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }

    /// One request per source covering all of its traders.
    async fn fetch_source(&self, source: &str, pairs: &[&TraderPair]) -> Vec<(TraderPair, FetchResult)> {
        let ids: Vec<&str> = pairs.iter().map(|p| p.trader_id()).collect();
        let url = self.batch_url(source, &ids);

        match self.get_json::<Vec<MasterTraderResponse>>(&url).await {
            Ok(traders) => {
                let mut by_id: HashMap<String, MasterTraderResponse> = traders
                    .into_iter()
                    .map(|t| (t.external_trader_id.clone(), t))
                    .collect();

                pairs
                    .iter()
                    .map(|pair| {
                        let result = match by_id.remove(pair.trader_id()) {
                            Some(trader) => Ok(build_batch(pair, trader.signals)),
                            None => Err(SourceFetchError::MissingTrader {
                                url: url.clone(),
                                trader_id: pair.trader_id().to_string(),
                            }),
                        };
                        ((*pair).clone(), result)
                    })
                    .collect()
            }
            Err(e) => {
                // Every pair of the source shares the failure.
                pairs
                    .iter()
                    .map(|pair| ((*pair).clone(), Err(e.clone())))
                    .collect()
            }
        }
    }
}

#[async_trait]
impl SignalSource for SignalClient {
    async fn fetch_signals(&self, pair: &TraderPair) -> FetchResult {
        let url = self.single_url(pair);
        let response: SignalsResponse = self.get_json(&url).await?;
        Ok(build_batch(pair, response.signals))
    }

    async fn fetch_many(&self, pairs: &[TraderPair]) -> Vec<(TraderPair, FetchResult)> {
        if !self.batched {
            return fetch_each(self, pairs).await;
        }

        let mut by_source: Vec<(&str, Vec<&TraderPair>)> = Vec::new();
        for pair in pairs {
            match by_source.iter_mut().find(|(s, _)| *s == pair.source) {
                Some((_, group)) => group.push(pair),
                None => by_source.push((pair.source.as_str(), vec![pair])),
            }
        }

        let groups = join_all(
            by_source
                .iter()
                .map(|(source, group)| self.fetch_source(source, group)),
        )
        .await;

        // Restore the configured pair order.
        let mut results: HashMap<TraderPair, FetchResult> = groups.into_iter().flatten().collect();
        pairs
            .iter()
            .filter_map(|pair| results.remove(pair).map(|r| (pair.clone(), r)))
            .collect()
    }
}
