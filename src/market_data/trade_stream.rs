// =============================================================================
// Trade Stream — Binance aggTrade WebSocket feed into the aggregator channel
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use backon::{BackoffBuilder, ExponentialBuilder};
use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};

use super::candle::TradeEvent;
use super::live::FeedStatus;

/// Default public market-data endpoint.
pub const BINANCE_WS_BASE: &str = "wss://stream.binance.com:9443/ws";

/// Connect to the aggTrade WebSocket stream for a single symbol and forward
/// every trade into `trades`.
///
/// Runs until the stream disconnects or an error occurs, then returns so that
/// the supervisor can handle reconnection. `on_connected` fires once the
/// handshake succeeds.
pub async fn run_trade_stream(
    ws_base: &str,
    symbol: &str,
    trades: &mpsc::Sender<TradeEvent>,
    on_connected: impl FnOnce(),
) -> Result<()> {
    let lower = symbol.to_lowercase();
    let url = format!("{ws_base}/{lower}@aggTrade");
    info!(url = %url, symbol = %symbol, "connecting to trade WebSocket");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to trade WebSocket")?;

    info!(symbol = %symbol, "trade WebSocket connected");
    on_connected();
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match parse_agg_trade(&text) {
                        Ok(trade) => {
                            if trades.send(trade).await.is_err() {
                                warn!(symbol = %symbol, "aggregator channel closed, stopping trade stream");
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to parse aggTrade message");
                        }
                    }
                }
                // Ping / Pong / Binary / Close frames are handled by tungstenite.
            }
            Some(Err(e)) => {
                error!(symbol = %symbol, error = %e, "trade WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!(symbol = %symbol, "trade WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

/// Reconnect delays for the live feed: 1s → 2s → 4s … capped at 30s, jittered.
pub fn reconnect_backoff(max_attempts: usize) -> impl Iterator<Item = Duration> {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_secs(1))
        .with_max_delay(Duration::from_secs(30))
        .with_jitter()
        .with_max_times(max_attempts)
        .build()
}

/// Keep the trade stream alive, publishing connection health on `status`.
///
/// Every disconnect starts a bounded reconnect budget. When the budget is spent
/// the status flips to [`FeedStatus::Exhausted`] (sessions in `LIVE` close with
/// `FeedDisconnected`) and the supervisor keeps retrying at the capped delay so
/// new sessions can succeed once the exchange is back.
pub async fn run_feed_supervisor(
    ws_base: String,
    symbol: String,
    trades: mpsc::Sender<TradeEvent>,
    status: watch::Sender<FeedStatus>,
    max_attempts: usize,
) {
    let mut backoff = reconnect_backoff(max_attempts);
    let mut attempt: usize = 0;

    loop {
        let connected = AtomicBool::new(false);
        let result = run_trade_stream(&ws_base, &symbol, &trades, || {
            connected.store(true, Ordering::Relaxed);
            status.send_replace(FeedStatus::Connected);
        })
        .await;

        if trades.is_closed() {
            info!(symbol = %symbol, "trade consumer gone, feed supervisor exiting");
            return;
        }

        if connected.load(Ordering::Relaxed) {
            backoff = reconnect_backoff(max_attempts);
            attempt = 0;
        }
        if let Err(e) = result {
            error!(symbol = %symbol, error = %e, "trade stream error");
        }

        attempt += 1;
        let delay = match backoff.next() {
            Some(delay) => {
                status.send_replace(FeedStatus::Reconnecting { attempt });
                delay
            }
            None => {
                if !matches!(*status.borrow(), FeedStatus::Exhausted) {
                    error!(symbol = %symbol, attempts = attempt, "trade feed reconnect budget exhausted");
                }
                status.send_replace(FeedStatus::Exhausted);
                Duration::from_secs(30)
            }
        };
        debug!(symbol = %symbol, attempt, delay_ms = delay.as_millis() as u64, "reconnecting trade stream");
        tokio::time::sleep(delay).await;
    }
}

/// Parse a Binance aggTrade message.
///
/// Expected shape:
/// ```json
/// { "e": "aggTrade", "s": "BTCUSDT", "p": "37000.00", "q": "0.123", "T": 1700000000000 }
/// ```
pub fn parse_agg_trade(text: &str) -> Result<TradeEvent> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse aggTrade JSON")?;
    trade_from_value(&root)
}

/// Shared by the WebSocket payload and the REST `aggTrades` array entries,
/// which use the same field names.
pub fn trade_from_value(root: &serde_json::Value) -> Result<TradeEvent> {
    let price: f64 = root["p"]
        .as_str()
        .context("missing field p")?
        .parse()
        .context("failed to parse price")?;

    let quantity: f64 = root["q"]
        .as_str()
        .context("missing field q")?
        .parse()
        .context("failed to parse quantity")?;

    let event_time_ms = root["T"].as_i64().context("missing field T")?;

    Ok(TradeEvent {
        event_time_ms,
        price,
        quantity,
    })
}
