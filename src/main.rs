// =============================================================================
// Candle Bridge — Main Entry Point
// =============================================================================
//
// Serves closed candles from the historical store, builds live candles from
// the Binance trade feed, and bridges the gap between the two for each viewer
// session.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use candle_bridge::app_state::AppState;
use candle_bridge::auth::{CredentialAuthority, RemoteAuthority, SharedSecretAuthority};
use candle_bridge::binance::{BinanceClient, BinanceReplaySource};
use candle_bridge::clock::{Clock, SystemClock};
use candle_bridge::config::{AuthMode, ServiceConfig, CONFIG_FILE};
use candle_bridge::history::{HistoricalStore, InMemoryStore, PostgrestStore};
use candle_bridge::market_data::{run_aggregator, trade_stream, LiveHub, TradeEvent};
use candle_bridge::session::{run_reaper, BridgeMode, GapBridge, StorePollBridge, TradeReplayBridge};
use candle_bridge::{api, binance};

/// Trades buffered between the feed and the aggregator.
const TRADE_CHANNEL_CAPACITY: usize = 4096;
/// How often the aggregator closes buckets that saw no trade.
const FLUSH_EVERY: Duration = Duration::from_millis(250);
const REAP_EVERY: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Candle Bridge starting up");

    let mut config = ServiceConfig::load(CONFIG_FILE).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        ServiceConfig::default()
    });
    config.apply_env().context("invalid environment override")?;
    config.validate().context("invalid configuration")?;

    info!(
        symbol = %config.symbol,
        resolution_secs = config.resolution_secs,
        bridge_mode = ?config.bridge_mode,
        auth_mode = ?config.auth_mode,
        "configuration ready"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // ── 2. Collaborators ─────────────────────────────────────────────────
    let store: Arc<dyn HistoricalStore> = match &config.store_url {
        Some(url) => Arc::new(PostgrestStore::new(
            url.clone(),
            config.store_table.clone(),
            config.store_api_key.clone(),
            config.store_timeout(),
        )?),
        None => {
            warn!("STORE_URL is not set, serving from an empty in-memory store");
            Arc::new(InMemoryStore::new())
        }
    };

    let authority: Arc<dyn CredentialAuthority> = match config.auth_mode {
        AuthMode::SharedSecret => Arc::new(SharedSecretAuthority::new(config.token.clone())),
        AuthMode::Remote => Arc::new(RemoteAuthority::new(
            config.auth_url.clone().unwrap_or_default(),
            config.auth_api_key.clone(),
            config.auth_allow_sub.clone(),
            config.store_timeout(),
        )?),
    };

    let mut rate_limit = None;
    let bridge: Arc<dyn GapBridge> = match config.bridge_mode {
        BridgeMode::StorePoll => Arc::new(StorePollBridge::new(
            store.clone(),
            config.resolution_secs,
            config.store_retry_attempts,
            config.store_timeout(),
        )),
        BridgeMode::TradeReplay => {
            let client = BinanceClient::new(config.binance_rest_base.clone(), config.store_timeout())?;
            rate_limit = Some(client.rate_limit().clone());
            Arc::new(TradeReplayBridge::new(
                Arc::new(BinanceReplaySource::new(client, config.symbol.clone())),
                config.resolution_secs,
                config.replay_page_limit.min(binance::client::AGG_TRADES_MAX_LIMIT),
                config.replay_max_pages,
            ))
        }
    };

    // ── 3. Live candles ──────────────────────────────────────────────────
    let hub = Arc::new(LiveHub::new(config.resolution_secs, config.ring_capacity()));
    let (trade_tx, trade_rx) = mpsc::channel::<TradeEvent>(TRADE_CHANNEL_CAPACITY);

    tokio::spawn(run_aggregator(hub.clone(), trade_rx, clock.clone(), FLUSH_EVERY));
    tokio::spawn(trade_stream::run_feed_supervisor(
        config.binance_ws_base.clone(),
        config.symbol.clone(),
        trade_tx,
        hub.feed_status_sender(),
        config.feed_max_reconnects,
    ));

    // ── 4. Shared state & session reaper ─────────────────────────────────
    let bind_addr = config.bind_addr.clone();
    let mut state = AppState::new(config, clock, authority, store, bridge, hub);
    if let Some(tracker) = rate_limit {
        state = state.with_rate_limit(tracker);
    }
    let state = Arc::new(state);
    tokio::spawn(run_reaper(state.registry.clone(), REAP_EVERY));

    // ── 5. HTTP / WebSocket server ───────────────────────────────────────
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    let shutdown_state = state.clone();
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            warn!("Shutdown signal received, stopping gracefully");
            // Open gap streams would otherwise hold the server open.
            let stopped = shutdown_state.registry.stop_all();
            info!(stopped, "sessions stopped");
        })
        .await
        .context("API server failed")?;

    info!("Candle Bridge shut down complete.");
    Ok(())
}
