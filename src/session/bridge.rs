// =============================================================================
// Gap Bridge — where closed candles between the store and live come from
// =============================================================================
//
// While a session is BRIDGING it repeatedly asks its bridge for closed
// candles newer than the last one it emitted. Two strategies:
//
//   - `StorePollBridge`: re-read the historical store, which is catching up
//     on its own. Cheap, and the candles are the same ones bootstrap serves.
//   - `TradeReplayBridge`: rebuild the candles from exchange trades, folded
//     through the same aggregator as the live path.
//
// Either way only buckets that have fully elapsed are returned.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::history::{with_store_retry, HistoricalStore, RangeQuery};
use crate::market_data::{bucket_of, Candle, TickAggregator, TradeEvent};

/// Which bridge strategy a deployment runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeMode {
    #[default]
    StorePoll,
    TradeReplay,
}

impl std::str::FromStr for BridgeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "store_poll" | "store" => Ok(Self::StorePoll),
            "trade_replay" | "replay" => Ok(Self::TradeReplay),
            other => Err(format!("unknown bridge mode '{other}'")),
        }
    }
}

#[async_trait]
pub trait GapBridge: Send + Sync {
    fn name(&self) -> &'static str;

    /// Closed candles with `bucket_start > after` whose bucket has fully
    /// elapsed at `now_secs`, oldest first. May return fewer than exist; the
    /// caller polls again.
    async fn fetch_closed(&self, after: i64, now_secs: i64) -> Result<Vec<Candle>, BridgeError>;
}

// =============================================================================
// Store polling
// =============================================================================

pub struct StorePollBridge {
    store: Arc<dyn HistoricalStore>,
    resolution_secs: i64,
    retry_attempts: usize,
    call_timeout: Duration,
}

impl StorePollBridge {
    pub fn new(
        store: Arc<dyn HistoricalStore>,
        resolution_secs: i64,
        retry_attempts: usize,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            resolution_secs,
            retry_attempts,
            call_timeout,
        }
    }
}

#[async_trait]
impl GapBridge for StorePollBridge {
    fn name(&self) -> &'static str {
        "store_poll"
    }

    async fn fetch_closed(&self, after: i64, now_secs: i64) -> Result<Vec<Candle>, BridgeError> {
        let from = after + self.resolution_secs;
        let to = bucket_of(now_secs, self.resolution_secs) - self.resolution_secs;
        if to < from {
            return Ok(Vec::new());
        }
        let query = RangeQuery {
            before: None,
            from: Some(from),
            to: Some(to),
            limit: ((to - from) / self.resolution_secs + 1) as usize,
        };

        let store = self.store.clone();
        let mut rows = with_store_retry("bridge_poll", self.retry_attempts, self.call_timeout, || {
            let store = store.clone();
            async move { store.query(&query).await }
        })
        .await?;

        rows.retain(|c| query.contains(c.bucket_start));
        rows.sort_by_key(|c| c.bucket_start);
        rows.dedup_by_key(|c| c.bucket_start);
        debug!(after, from, to, count = rows.len(), "store poll returned");
        Ok(rows)
    }
}

// =============================================================================
// Trade replay
// =============================================================================

/// Bounded replay of exchange trades from a point in time.
#[async_trait]
pub trait TradeReplaySource: Send + Sync {
    /// Up to `limit` trades with `event_time_ms >= start_ms`, oldest first.
    async fn trades_since(&self, start_ms: i64, limit: usize) -> Result<Vec<TradeEvent>, BridgeError>;
}

pub struct TradeReplayBridge {
    source: Arc<dyn TradeReplaySource>,
    resolution_secs: i64,
    page_limit: usize,
    max_pages: usize,
}

impl TradeReplayBridge {
    pub fn new(source: Arc<dyn TradeReplaySource>, resolution_secs: i64, page_limit: usize, max_pages: usize) -> Self {
        Self {
            source,
            resolution_secs,
            page_limit: page_limit.max(2),
            max_pages: max_pages.max(1),
        }
    }
}

#[async_trait]
impl GapBridge for TradeReplayBridge {
    fn name(&self) -> &'static str {
        "trade_replay"
    }

    async fn fetch_closed(&self, after: i64, now_secs: i64) -> Result<Vec<Candle>, BridgeError> {
        let mut aggregator = TickAggregator::new(self.resolution_secs);
        let mut finalized = Vec::new();
        let mut start_ms = (after + self.resolution_secs) * 1000;
        let now_ms = now_secs * 1000;
        let mut complete = false;

        for _ in 0..self.max_pages {
            let mut trades = self.source.trades_since(start_ms, self.page_limit).await?;
            let full_page = trades.len() >= self.page_limit;

            if full_page {
                // Trades sharing the last millisecond may continue on the next
                // page; hold them back and restart at that millisecond.
                if let Some(last_ms) = trades.last().map(|t| t.event_time_ms) {
                    let kept = trades.iter().take_while(|t| t.event_time_ms < last_ms).count();
                    if kept > 0 {
                        trades.truncate(kept);
                        start_ms = last_ms;
                    } else {
                        start_ms = last_ms + 1;
                    }
                }
            }

            for trade in trades.iter().filter(|t| t.event_time_ms < now_ms) {
                if let Some(out) = aggregator.ingest(trade) {
                    finalized.extend(out.finalized);
                }
            }

            if !full_page || start_ms >= now_ms {
                complete = true;
                break;
            }
        }

        if complete {
            // Every trade up to now has been seen, so elapsed buckets are whole.
            finalized.extend(aggregator.close_elapsed(now_secs));
        } else {
            warn!(after, pages = self.max_pages, "trade replay page budget spent, returning partial span");
        }

        finalized.retain(|c| c.bucket_start > after && c.is_closed_at(now_secs, self.resolution_secs));
        debug!(after, count = finalized.len(), "trade replay folded");
        Ok(finalized)
    }
}

// =============================================================================
// Tests
// =============================================================================
