// =============================================================================
// Candle Viewer — headless client for the candle bridge
// =============================================================================
//
// Starts a session, pages the bootstrap history, then follows the gap stream
// over WebSocket. Candles are merged into a deduplicated series, resampled to
// the viewer timeframe with a trailing SMA, and the price/volume range
// synchronizer is driven exactly as a chart would drive it. Everything that
// would be drawn is logged instead.
//
// Environment:
//   CANDLE_BRIDGE_URL    server base URL        (http://127.0.0.1:8000)
//   CANDLE_BRIDGE_TOKEN  bearer token
//   VIEWER_TIMEFRAME     coarse timeframe       (1m)
//   VIEWER_SMA           SMA period             (20)
//   VIEWER_MAX_PAGES     bootstrap page budget  (4)
//   VIEWER_FROM_TS       start when the store is empty (RFC3339 or epoch)
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use candle_bridge::chart::{parse_timeframe, ChartView, ViewId, Viewport, VisibleRange};
use candle_bridge::history::Page;
use candle_bridge::session::StreamMessage;

#[derive(Debug, Deserialize)]
struct StartResponse {
    session_id: String,
    last_known_iso: Option<String>,
    stream_url: String,
    bootstrap_url: String,
    resolution_seconds: i64,
}

/// A pane that logs the range it is asked to show.
struct LogPane {
    id: ViewId,
}

impl Viewport for LogPane {
    fn id(&self) -> ViewId {
        self.id
    }

    fn set_visible_range(&mut self, range: VisibleRange) -> Option<VisibleRange> {
        debug!(pane = ?self.id, from = range.from, to = range.to, "visible range set");
        None
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty()).unwrap_or_else(|| default.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let base = env_or("CANDLE_BRIDGE_URL", "http://127.0.0.1:8000").trim_end_matches('/').to_string();
    let token = env_or("CANDLE_BRIDGE_TOKEN", "");
    let timeframe_label = env_or("VIEWER_TIMEFRAME", "1m");
    let timeframe = parse_timeframe(&timeframe_label)
        .with_context(|| format!("invalid VIEWER_TIMEFRAME '{timeframe_label}'"))?;
    let sma_period: usize = env_or("VIEWER_SMA", "20").parse().context("invalid VIEWER_SMA")?;
    let max_pages: usize = env_or("VIEWER_MAX_PAGES", "4").parse().context("invalid VIEWER_MAX_PAGES")?;
    let from_ts = std::env::var("VIEWER_FROM_TS").ok().filter(|v| !v.trim().is_empty());

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("failed to build reqwest client")?;

    // ── 1. Session ───────────────────────────────────────────────────────
    let mut start = http.post(format!("{base}/session/start")).bearer_auth(&token);
    if let Some(from_ts) = &from_ts {
        start = start.json(&serde_json::json!({ "from_ts": from_ts }));
    }
    let resp = start.send().await.context("POST /session/start failed")?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("session start returned {status}: {body}");
    }
    let session: StartResponse = resp.json().await.context("failed to parse session start")?;
    info!(
        session_id = %session.session_id,
        last_known = ?session.last_known_iso,
        "session started"
    );

    let mut view = ChartView::new(
        session.resolution_seconds,
        timeframe,
        sma_period,
        LogPane { id: ViewId::Price },
        LogPane { id: ViewId::Volume },
    );

    // ── 2. Bootstrap ─────────────────────────────────────────────────────
    let mut url = format!("{base}{}", session.bootstrap_url);
    for page_no in 1..=max_pages {
        let page: Page = http
            .get(&url)
            .bearer_auth(&token)
            .send()
            .await
            .context("GET /bootstrap failed")?
            .error_for_status()
            .context("bootstrap rejected")?
            .json()
            .await
            .context("failed to parse bootstrap page")?;
        let added = view.merge_page(&page.items);
        info!(page = page_no, items = page.items.len(), added, has_more = page.has_more, "bootstrap page");
        match page.next_cursor {
            Some(cursor) if page.has_more => {
                url = format!("{base}{}&cursor={cursor}", session.bootstrap_url);
            }
            _ => break,
        }
    }
    view.rebuild();
    let missing = view.series().missing_buckets().len();
    if missing > 0 {
        warn!(missing, "bootstrap history has holes");
    }
    info!(base = view.series().len(), bars = view.bars().len(), sma = ?view.sma(), "history loaded");

    // ── 3. Gap stream ────────────────────────────────────────────────────
    let ws_base = base.replacen("http", "ws", 1);
    let ws_url = format!("{ws_base}{}", session.stream_url);
    let (ws, _response) = connect_async(&ws_url)
        .await
        .with_context(|| format!("failed to connect to {ws_url}"))?;
    info!(url = %ws_url, "gap stream connected");
    let (mut write, mut read) = ws.split();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping session");
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            msg = read.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        info!("gap stream closed by server");
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(error = %e, "gap stream error");
                        break;
                    }
                };
                match serde_json::from_str::<StreamMessage>(&text) {
                    Ok(StreamMessage::Candle { update, ts }) => {
                        if let Some(out) = view.apply(update) {
                            info!(
                                ts = %ts,
                                status = %update.status,
                                bar_start = out.bar.bucket_start,
                                close = out.bar.close,
                                volume = out.bar.volume,
                                sma = ?out.sma,
                                new_bar = out.appended,
                                scrolled = out.scrolled_to.is_some(),
                                "bar updated"
                            );
                        }
                    }
                    Ok(StreamMessage::Keepalive { server_time }) => debug!(server_time, "keepalive"),
                    Ok(StreamMessage::Error { code, message }) => warn!(%code, %message, "stream error"),
                    Ok(StreamMessage::Closed { reason }) => {
                        info!(reason = %reason, "session closed");
                        break;
                    }
                    Err(e) => warn!(error = %e, "unparseable stream message"),
                }
            }
        }
    }

    let stopped: serde_json::Value = http
        .post(format!("{base}/session/stop?session_id={}", session.session_id))
        .send()
        .await
        .context("POST /session/stop failed")?
        .json()
        .await
        .unwrap_or_default();
    info!(
        stopped = %stopped["stopped"],
        propagations = view.sync().propagations(),
        suppressed = view.sync().suppressed_echoes(),
        "viewer finished"
    );
    Ok(())
}
