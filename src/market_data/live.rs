// =============================================================================
// Live Hub — single-writer aggregation with fan-out to sessions
// =============================================================================
//
// One task owns the `TickAggregator` for the configured (instrument,
// resolution) and is the only writer of the current candle. Readers get:
//   - finalized candles on a broadcast channel (one message per closed bucket),
//   - the rolling provisional candle on a watch channel,
//   - the recent ring in `CandleBuffer` for catch-up after a late subscribe,
//   - feed health on a watch channel fed by the trade-stream supervisor.
//
// Only buckets from `complete_from` on are authoritative. Earlier ring
// entries were built from a partial view of the trades and must be served
// by the bridge instead.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info};

use super::aggregator::TickAggregator;
use super::candle::{bucket_of, Candle, CandleUpdate, TradeEvent};
use super::candle_buffer::CandleBuffer;
use crate::clock::Clock;

/// Capacity of the finalized-candle broadcast channel.
const FINALIZED_CHANNEL_CAPACITY: usize = 1024;

/// Connection health of the live trade feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FeedStatus {
    /// No connection attempt has completed yet.
    Connecting,
    Connected,
    Reconnecting { attempt: usize },
    /// The reconnect budget is spent; live sessions must close.
    Exhausted,
}

impl std::fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting({attempt})"),
            Self::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// Read side of the live aggregation, shared by every session.
pub struct LiveHub {
    resolution_secs: i64,
    finalized_tx: broadcast::Sender<Candle>,
    provisional_tx: watch::Sender<Option<Candle>>,
    feed_status_tx: watch::Sender<FeedStatus>,
    buffer: Arc<CandleBuffer>,
    dropped_trades: AtomicU64,
    /// `i64::MAX` while no bucket is complete.
    complete_from: AtomicI64,
}

impl LiveHub {
    pub fn new(resolution_secs: i64, ring_capacity: usize) -> Self {
        Self::with_channel_capacity(resolution_secs, ring_capacity, FINALIZED_CHANNEL_CAPACITY)
    }

    /// Like `new`, with an explicit finalized-channel capacity. Subscribers
    /// further behind than this lag and recover from the ring.
    pub fn with_channel_capacity(resolution_secs: i64, ring_capacity: usize, channel_capacity: usize) -> Self {
        let (finalized_tx, _) = broadcast::channel(channel_capacity.max(1));
        let (provisional_tx, _) = watch::channel(None);
        let (feed_status_tx, _) = watch::channel(FeedStatus::Connecting);
        Self {
            resolution_secs,
            finalized_tx,
            provisional_tx,
            feed_status_tx,
            buffer: Arc::new(CandleBuffer::new(ring_capacity)),
            dropped_trades: AtomicU64::new(0),
            complete_from: AtomicI64::new(i64::MAX),
        }
    }

    pub fn resolution_secs(&self) -> i64 {
        self.resolution_secs
    }

    pub fn buffer(&self) -> &Arc<CandleBuffer> {
        &self.buffer
    }

    /// Subscribe to finalized candles. Subscribe *before* reading the ring so
    /// nothing closes unseen in between.
    pub fn subscribe_finalized(&self) -> broadcast::Receiver<Candle> {
        self.finalized_tx.subscribe()
    }

    pub fn watch_provisional(&self) -> watch::Receiver<Option<Candle>> {
        self.provisional_tx.subscribe()
    }

    pub fn watch_feed_status(&self) -> watch::Receiver<FeedStatus> {
        self.feed_status_tx.subscribe()
    }

    /// Sender half handed to the trade-stream supervisor.
    pub fn feed_status_sender(&self) -> watch::Sender<FeedStatus> {
        self.feed_status_tx.clone()
    }

    pub fn feed_status(&self) -> FeedStatus {
        *self.feed_status_tx.borrow()
    }

    pub fn provisional(&self) -> Option<Candle> {
        *self.provisional_tx.borrow()
    }

    pub fn dropped_trades(&self) -> u64 {
        self.dropped_trades.load(Ordering::Relaxed)
    }

    /// First bucket the live aggregation saw every trade of.
    pub fn complete_from(&self) -> Option<i64> {
        match self.complete_from.load(Ordering::Acquire) {
            i64::MAX => None,
            from => Some(from),
        }
    }

    fn set_complete_from(&self, from: Option<i64>) {
        self.complete_from.store(from.unwrap_or(i64::MAX), Ordering::Release);
    }

    /// Whether live aggregation is authoritative for `bucket` and the ring
    /// holds every finalized bucket from `bucket` onward, or `bucket` is the
    /// one currently open.
    pub fn covers(&self, bucket: i64) -> bool {
        if !matches!(self.complete_from(), Some(from) if from <= bucket) {
            return false;
        }
        if let Some(earliest) = self.buffer.earliest_closed() {
            if earliest <= bucket {
                return true;
            }
        }
        matches!(self.provisional(), Some(c) if c.bucket_start <= bucket)
    }

    fn publish_finalized(&self, candle: Candle) {
        self.buffer.update(CandleUpdate::finalized(candle));
        // No receivers is fine: nobody is streaming right now.
        let _ = self.finalized_tx.send(candle);
        debug!(bucket = candle.bucket_start, close = candle.close, "candle finalized");
    }

    fn publish_provisional(&self, candle: Option<Candle>) {
        if let Some(c) = candle {
            self.buffer.update(CandleUpdate::provisional(c));
        }
        self.provisional_tx.send_replace(candle);
    }
}

/// Drive the aggregator: fold trades as they arrive and close elapsed buckets
/// on every `flush_every` tick. Returns when the trade channel closes.
pub async fn run_aggregator(
    hub: Arc<LiveHub>,
    mut trades: mpsc::Receiver<TradeEvent>,
    clock: Arc<dyn Clock>,
    flush_every: Duration,
) {
    let mut aggregator = TickAggregator::new(hub.resolution_secs);
    let mut flush = tokio::time::interval(flush_every);
    flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut feed = hub.watch_feed_status();

    info!(resolution_secs = hub.resolution_secs, "live aggregator started");

    loop {
        tokio::select! {
            trade = trades.recv() => {
                let Some(trade) = trade else {
                    info!("trade channel closed, live aggregator stopping");
                    return;
                };
                match aggregator.ingest(&trade) {
                    Some(out) => {
                        hub.set_complete_from(aggregator.complete_from());
                        for candle in out.finalized {
                            hub.publish_finalized(candle);
                        }
                        hub.publish_provisional(Some(out.current));
                    }
                    None => {
                        hub.dropped_trades.store(aggregator.dropped(), Ordering::Relaxed);
                    }
                }
            }
            Ok(()) = feed.changed() => {
                let status = *feed.borrow_and_update();
                if matches!(status, FeedStatus::Reconnecting { .. } | FeedStatus::Exhausted) {
                    aggregator.mark_interrupted(clock.now_secs());
                    hub.set_complete_from(None);
                }
            }
            _ = flush.tick() => {
                let now = clock.now_secs();
                let closed = aggregator.close_elapsed(now);
                if !closed.is_empty() {
                    for candle in closed {
                        hub.publish_finalized(candle);
                    }
                    hub.publish_provisional(aggregator.current().copied());
                } else if aggregator.current().is_none() {
                    if let Some(stale) = hub.provisional() {
                        if bucket_of(now, hub.resolution_secs) > stale.bucket_start {
                            hub.publish_provisional(None);
                        }
                    }
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn trade(secs: i64, price: f64) -> TradeEvent {
        TradeEvent {
            event_time_ms: secs * 1000,
            price,
            quantity: 1.0,
        }
    }

    async fn wait_for(mut pred: impl FnMut() -> bool) {
        for _ in 0..200 {
            if pred() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn finalized_candles_fan_out_to_every_subscriber() {
        let hub = Arc::new(LiveHub::new(15, 100));
        let clock = Arc::new(ManualClock::at_secs(30));
        let (tx, rx) = mpsc::channel(16);
        let mut a = hub.subscribe_finalized();
        let mut b = hub.subscribe_finalized();
        tokio::spawn(run_aggregator(hub.clone(), rx, clock.clone(), Duration::from_millis(5)));

        tx.send(trade(31, 100.0)).await.unwrap();
        tx.send(trade(47, 101.0)).await.unwrap();

        assert_eq!(a.recv().await.unwrap().bucket_start, 30);
        assert_eq!(b.recv().await.unwrap().bucket_start, 30);
        wait_for(|| hub.provisional().map(|c| c.bucket_start) == Some(45)).await;
    }

    #[tokio::test]
    async fn flush_closes_bucket_when_time_passes() {
        let hub = Arc::new(LiveHub::new(15, 100));
        let clock = Arc::new(ManualClock::at_secs(31));
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(run_aggregator(hub.clone(), rx, clock.clone(), Duration::from_millis(5)));

        tx.send(trade(31, 100.0)).await.unwrap();
        wait_for(|| hub.provisional().is_some()).await;
        // Bucket 30 only holds trades seen after the feed came up.
        assert_eq!(hub.complete_from(), Some(45));
        assert!(!hub.covers(30));
        assert!(hub.covers(45));

        clock.set_secs(46);
        wait_for(|| hub.buffer().latest_closed() == Some(30)).await;
        assert!(hub.provisional().is_none());
        assert!(hub.covers(45));
        assert!(!hub.covers(15));
    }

    #[tokio::test]
    async fn reconnect_invalidates_until_next_trade() {
        let hub = Arc::new(LiveHub::new(15, 100));
        let clock = Arc::new(ManualClock::at_secs(31));
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(run_aggregator(hub.clone(), rx, clock.clone(), Duration::from_millis(5)));

        tx.send(trade(31, 100.0)).await.unwrap();
        wait_for(|| hub.complete_from() == Some(45)).await;

        hub.feed_status_sender().send_replace(FeedStatus::Reconnecting { attempt: 1 });
        wait_for(|| hub.complete_from().is_none()).await;
        assert!(!hub.covers(60));

        clock.set_secs(80);
        hub.feed_status_sender().send_replace(FeedStatus::Connected);
        tx.send(trade(80, 101.0)).await.unwrap();
        wait_for(|| hub.complete_from() == Some(90)).await;
        assert!(!hub.covers(75));
        assert!(hub.covers(90));
    }

    #[tokio::test]
    async fn out_of_order_trades_are_counted() {
        let hub = Arc::new(LiveHub::new(15, 100));
        let clock = Arc::new(ManualClock::at_secs(50));
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(run_aggregator(hub.clone(), rx, clock, Duration::from_millis(5)));

        tx.send(trade(47, 100.0)).await.unwrap();
        tx.send(trade(20, 90.0)).await.unwrap();
        wait_for(|| hub.dropped_trades() == 1).await;
    }

    #[test]
    fn feed_status_defaults_to_connecting() {
        let hub = LiveHub::new(15, 10);
        assert_eq!(hub.feed_status(), FeedStatus::Connecting);
        hub.feed_status_sender().send_replace(FeedStatus::Exhausted);
        assert_eq!(*hub.watch_feed_status().borrow(), FeedStatus::Exhausted);
    }
}
