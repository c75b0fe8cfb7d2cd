// =============================================================================
// Binance REST Client — public market data for trade replay
// =============================================================================
//
// Only unauthenticated endpoints are used, so no key or signature is sent.
// Every response feeds the shared rate-limit tracker; a request that would
// push the minute weight over our cap is refused before it leaves.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::rate_limit::RateLimitTracker;
use crate::error::BridgeError;
use crate::market_data::trade_stream::trade_from_value;
use crate::market_data::TradeEvent;
use crate::session::TradeReplaySource;

pub const BINANCE_REST_BASE: &str = "https://api.binance.com";

/// Largest page `aggTrades` will return.
pub const AGG_TRADES_MAX_LIMIT: usize = 1000;
/// Request weight of one `aggTrades` call.
const AGG_TRADES_WEIGHT: u32 = 2;

#[derive(Clone)]
pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
    rate_limit: Arc<RateLimitTracker>,
}

impl BinanceClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(%base_url, "BinanceClient initialised");
        Ok(Self {
            base_url,
            client,
            rate_limit: Arc::new(RateLimitTracker::new()),
        })
    }

    pub fn rate_limit(&self) -> &Arc<RateLimitTracker> {
        &self.rate_limit
    }

    /// GET /api/v3/aggTrades (public). Trades at or after `start_ms`, oldest
    /// first. Malformed entries are skipped with a warning.
    #[instrument(skip(self), name = "binance::agg_trades")]
    pub async fn agg_trades(&self, symbol: &str, start_ms: i64, limit: usize) -> Result<Vec<TradeEvent>> {
        if !self.rate_limit.can_send_request(AGG_TRADES_WEIGHT) {
            anyhow::bail!("Binance request weight exhausted for this minute");
        }
        let limit = limit.clamp(1, AGG_TRADES_MAX_LIMIT);
        let url = format!(
            "{}/api/v3/aggTrades?symbol={}&startTime={}&limit={}",
            self.base_url,
            symbol.to_uppercase(),
            start_ms,
            limit
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/aggTrades request failed")?;
        self.rate_limit.update_from_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse aggTrades response")?;
        if !status.is_success() {
            anyhow::bail!("Binance GET /api/v3/aggTrades returned {}: {}", status, body);
        }

        let rows = body.as_array().context("aggTrades response is not an array")?;
        let trades: Vec<TradeEvent> = rows
            .iter()
            .filter_map(|row| match trade_from_value(row) {
                Ok(t) => Some(t),
                Err(e) => {
                    warn!(error = %e, "skipping malformed aggTrade row");
                    None
                }
            })
            .collect();
        debug!(count = trades.len(), start_ms, "aggTrades fetched");
        Ok(trades)
    }
}

/// Replays one symbol's aggregated trades for the trade-replay bridge.
pub struct BinanceReplaySource {
    client: BinanceClient,
    symbol: String,
}

impl BinanceReplaySource {
    pub fn new(client: BinanceClient, symbol: impl Into<String>) -> Self {
        Self {
            client,
            symbol: symbol.into(),
        }
    }
}

#[async_trait]
impl TradeReplaySource for BinanceReplaySource {
    async fn trades_since(&self, start_ms: i64, limit: usize) -> Result<Vec<TradeEvent>, BridgeError> {
        self.client
            .agg_trades(&self.symbol, start_ms, limit)
            .await
            .map_err(|e| BridgeError::StoreUnavailable(format!("trade replay: {e:#}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalized() {
        let c = BinanceClient::new("https://api.binance.com/", Duration::from_secs(5)).unwrap();
        assert_eq!(c.base_url, BINANCE_REST_BASE);
    }

    #[tokio::test]
    async fn exhausted_weight_refuses_before_sending() {
        use reqwest::header::{HeaderMap, HeaderValue};

        // Unroutable base: the call must fail on the weight check, not the network.
        let c = BinanceClient::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let mut h = HeaderMap::new();
        h.insert("X-MBX-USED-WEIGHT-1M", HeaderValue::from_static("1000"));
        c.rate_limit().update_from_headers(&h);

        let err = c.agg_trades("btcusdt", 0, 10).await.unwrap_err();
        assert!(err.to_string().contains("weight exhausted"));
    }

    #[tokio::test]
    async fn replay_failures_map_to_transient_errors() {
        let c = BinanceClient::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        let source = BinanceReplaySource::new(c, "btcusdt");
        let err = source.trades_since(0, 10).await.unwrap_err();
        assert!(err.is_transient());
    }
}
