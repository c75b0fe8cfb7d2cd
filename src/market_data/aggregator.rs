// =============================================================================
// Tick Aggregator — trades in, fixed-resolution candles out
// =============================================================================
//
// Holds exactly one mutable "current" candle. When a trade lands in a later
// bucket the held candle is finalized first, then the new one starts, so a
// consumer sees every bucket exactly once as final and never a partial candle
// labelled final.
//
// Buckets that elapse without a single trade are emitted as flat carry-forward
// candles so the finalized sequence stays contiguous.
//
// A live feed only sees trades from the moment it connects. The bucket the
// first trade lands in, and anything finalized while the feed was
// interrupted, may be missing trades; `complete_from` is the first bucket
// whose trades were all seen.
// =============================================================================

use tracing::warn;

use super::candle::{bucket_of, merge_tick, Candle, TradeEvent};

/// Upper bound on carry-forward candles produced by one call, so a clock jump
/// cannot allocate an unbounded backlog.
const MAX_CARRY_FORWARD: i64 = 240;

/// Result of folding one trade into the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub struct Ingested {
    /// Candles that closed because of this trade, oldest first.
    pub finalized: Vec<Candle>,
    /// The open candle after the trade was applied.
    pub current: Candle,
    /// True when the trade opened a bucket that was not held before.
    pub is_new_bucket: bool,
}

#[derive(Debug, Clone)]
pub struct TickAggregator {
    resolution_secs: i64,
    current: Option<Candle>,
    /// Bucket start and close of the newest finalized candle.
    last_closed: Option<(i64, f64)>,
    dropped: u64,
    /// Set while the trade source is interrupted: the first trade at or after
    /// this time (epoch seconds) marks the source whole again.
    resume_at: Option<i64>,
    complete_from: Option<i64>,
}

impl TickAggregator {
    pub fn new(resolution_secs: i64) -> Self {
        Self {
            resolution_secs,
            current: None,
            last_closed: None,
            dropped: 0,
            resume_at: Some(i64::MIN),
            complete_from: None,
        }
    }

    /// Resume after an already-emitted candle so nothing at or before it is
    /// produced again.
    pub fn resume_after(resolution_secs: i64, last: &Candle) -> Self {
        Self {
            resolution_secs,
            current: None,
            last_closed: Some((last.bucket_start, last.close)),
            dropped: 0,
            resume_at: None,
            complete_from: Some(last.bucket_start + resolution_secs),
        }
    }

    pub fn resolution_secs(&self) -> i64 {
        self.resolution_secs
    }

    pub fn current(&self) -> Option<&Candle> {
        self.current.as_ref()
    }

    /// First bucket whose trades were all seen, if any.
    pub fn complete_from(&self) -> Option<i64> {
        self.complete_from
    }

    /// The trade source lost trades at `now_secs` (reconnect). Everything up
    /// to and including the bucket of the first trade after that is
    /// incomplete. Trades stamped earlier were queued before the drop.
    pub fn mark_interrupted(&mut self, now_secs: i64) {
        if self.resume_at.is_none() {
            warn!(complete_from = self.complete_from, "trade source interrupted");
        }
        self.resume_at = Some(now_secs);
        self.complete_from = None;
    }

    /// Number of trades rejected as out-of-order or malformed.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Fold a trade. Returns `None` when the trade was dropped.
    pub fn ingest(&mut self, trade: &TradeEvent) -> Option<Ingested> {
        if !trade.is_valid() {
            self.dropped += 1;
            warn!(price = trade.price, quantity = trade.quantity, dropped = self.dropped, "malformed trade dropped");
            return None;
        }

        let bucket = bucket_of(trade.event_time_secs(), self.resolution_secs);

        let floor = self
            .current
            .map(|c| c.bucket_start)
            .or_else(|| self.last_closed.map(|(b, _)| b + self.resolution_secs));
        if let Some(floor) = floor {
            if bucket < floor {
                self.dropped += 1;
                warn!(
                    bucket,
                    held_bucket = floor,
                    dropped = self.dropped,
                    "out-of-order trade dropped"
                );
                return None;
            }
        }

        if matches!(self.resume_at, Some(at) if trade.event_time_secs() >= at) {
            self.resume_at = None;
            self.complete_from = Some(bucket + self.resolution_secs);
        }

        let mut finalized = Vec::new();
        let is_new_bucket = match self.current {
            Some(c) if c.bucket_start == bucket => false,
            Some(c) => {
                self.finalize(c, &mut finalized);
                self.fill_until(bucket, &mut finalized);
                true
            }
            None => {
                self.fill_until(bucket, &mut finalized);
                true
            }
        };

        let current = merge_tick(self.current.as_ref(), trade.price, trade.quantity, bucket);
        self.current = Some(current);

        Some(Ingested {
            finalized,
            current,
            is_new_bucket,
        })
    }

    /// Finalize the held candle if its bucket has elapsed at `now_secs`, plus
    /// carry-forward candles for any empty buckets that have fully elapsed.
    pub fn close_elapsed(&mut self, now_secs: i64) -> Vec<Candle> {
        let mut finalized = Vec::new();

        if let Some(c) = self.current {
            if c.is_closed_at(now_secs, self.resolution_secs) {
                self.current = None;
                self.finalize(c, &mut finalized);
            } else {
                return finalized;
            }
        }

        let open_bucket = bucket_of(now_secs, self.resolution_secs);
        self.fill_until(open_bucket, &mut finalized);
        finalized
    }

    fn finalize(&mut self, candle: Candle, out: &mut Vec<Candle>) {
        self.last_closed = Some((candle.bucket_start, candle.close));
        out.push(candle);
    }

    /// Emit carry-forward candles for every bucket strictly between the last
    /// finalized bucket and `bucket`.
    fn fill_until(&mut self, bucket: i64, out: &mut Vec<Candle>) {
        let Some((mut last, close)) = self.last_closed else {
            return;
        };
        let mut budget = MAX_CARRY_FORWARD;
        while last + self.resolution_secs < bucket && budget > 0 {
            last += self.resolution_secs;
            out.push(Candle::carry_forward(last, close));
            budget -= 1;
        }
        if last + self.resolution_secs < bucket {
            warn!(
                from = last,
                to = bucket,
                "carry-forward budget exhausted, resuming at the new bucket"
            );
            last = bucket - self.resolution_secs;
        }
        self.last_closed = Some((last, close));
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(ms: i64, price: f64, qty: f64) -> TradeEvent {
        TradeEvent {
            event_time_ms: ms,
            price,
            quantity: qty,
        }
    }

    #[test]
    fn first_trade_opens_bucket() {
        let mut agg = TickAggregator::new(15);
        let out = agg.ingest(&trade(31_000, 100.0, 1.0)).unwrap();
        assert!(out.is_new_bucket);
        assert!(out.finalized.is_empty());
        assert_eq!(out.current.bucket_start, 30);
    }

    #[test]
    fn bucket_change_finalizes_previous_first() {
        let mut agg = TickAggregator::new(15);
        agg.ingest(&trade(30_000, 100.0, 1.0));
        agg.ingest(&trade(40_000, 103.0, 2.0));
        let out = agg.ingest(&trade(46_000, 99.0, 0.5)).unwrap();

        assert!(out.is_new_bucket);
        assert_eq!(out.finalized.len(), 1);
        let closed = out.finalized[0];
        assert_eq!(closed.bucket_start, 30);
        assert_eq!(closed.close, 103.0);
        assert_eq!(closed.volume, 3.0);
        assert_eq!(out.current.bucket_start, 45);
        assert_eq!(out.current.open, 99.0);
    }

    #[test]
    fn out_of_order_trade_is_dropped_and_counted() {
        let mut agg = TickAggregator::new(15);
        agg.ingest(&trade(46_000, 100.0, 1.0));
        assert!(agg.ingest(&trade(31_000, 50.0, 1.0)).is_none());
        assert_eq!(agg.dropped(), 1);
        assert_eq!(agg.current().unwrap().low, 100.0);
    }

    #[test]
    fn trade_older_than_last_finalized_is_dropped() {
        let mut agg = TickAggregator::new(15);
        agg.ingest(&trade(30_000, 100.0, 1.0));
        agg.close_elapsed(50);
        assert!(agg.ingest(&trade(44_000, 1.0, 1.0)).is_none());
        assert_eq!(agg.dropped(), 1);
    }

    #[test]
    fn elapsed_bucket_closes_without_new_trade() {
        let mut agg = TickAggregator::new(15);
        agg.ingest(&trade(30_000, 100.0, 1.0));
        assert!(agg.close_elapsed(44).is_empty());
        let closed = agg.close_elapsed(45);
        assert_eq!(closed.len(), 1);
        assert!(agg.current().is_none());
    }

    #[test]
    fn empty_buckets_are_carried_forward() {
        let mut agg = TickAggregator::new(15);
        agg.ingest(&trade(30_000, 100.0, 1.0));
        let out = agg.ingest(&trade(76_000, 101.0, 1.0)).unwrap();
        let buckets: Vec<i64> = out.finalized.iter().map(|c| c.bucket_start).collect();
        assert_eq!(buckets, vec![30, 45, 60]);
        assert_eq!(out.finalized[1].volume, 0.0);
        assert_eq!(out.finalized[2].close, 100.0);
    }

    #[test]
    fn quiet_market_fills_on_flush() {
        let mut agg = TickAggregator::new(15);
        agg.ingest(&trade(30_000, 100.0, 1.0));
        let closed = agg.close_elapsed(80);
        let buckets: Vec<i64> = closed.iter().map(|c| c.bucket_start).collect();
        assert_eq!(buckets, vec![30, 45, 60]);
        assert!(agg.close_elapsed(80).is_empty());
    }

    #[test]
    fn resume_after_skips_emitted_buckets() {
        let last = Candle::carry_forward(45, 10.0);
        let mut agg = TickAggregator::resume_after(15, &last);
        assert!(agg.ingest(&trade(50_000, 11.0, 1.0)).is_none());
        let out = agg.ingest(&trade(61_000, 11.0, 1.0)).unwrap();
        assert!(out.finalized.is_empty());
        assert_eq!(out.current.bucket_start, 60);
    }

    #[test]
    fn first_bucket_after_start_is_incomplete() {
        let mut agg = TickAggregator::new(15);
        assert_eq!(agg.complete_from(), None);
        agg.ingest(&trade(20_000, 7.0, 1.0));
        assert_eq!(agg.complete_from(), Some(30));
        agg.ingest(&trade(31_000, 8.0, 1.0));
        assert_eq!(agg.complete_from(), Some(30));
    }

    #[test]
    fn interruption_moves_completeness_past_the_next_trade() {
        let mut agg = TickAggregator::new(15);
        agg.ingest(&trade(20_000, 7.0, 1.0));
        agg.mark_interrupted(55);
        assert_eq!(agg.complete_from(), None);

        // Trades queued before the drop do not restore completeness.
        agg.ingest(&trade(50_000, 7.5, 1.0));
        assert_eq!(agg.complete_from(), None);

        // Nor does carry-forward while disconnected.
        agg.close_elapsed(80);
        assert_eq!(agg.complete_from(), None);

        // The reconnect lands mid-bucket: 75 may be missing trades.
        agg.ingest(&trade(82_000, 9.0, 1.0));
        assert_eq!(agg.complete_from(), Some(90));
    }

    #[test]
    fn finalized_candles_hold_ohlc_and_volume_invariants() {
        // Deterministic pseudo-random walk across many buckets.
        let mut agg = TickAggregator::new(15);
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut price = 100.0;
        let mut ts = 0_i64;
        let mut expected_volume = std::collections::BTreeMap::<i64, f64>::new();
        let mut finalized = Vec::new();

        for _ in 0..2_000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            ts += (seed % 4_000) as i64;
            price = (price + ((seed % 200) as f64 - 100.0) / 50.0).max(1.0);
            let qty = 0.01 + (seed % 97) as f64 / 100.0;
            *expected_volume.entry(bucket_of(ts / 1000, 15)).or_default() += qty;
            if let Some(out) = agg.ingest(&trade(ts, price, qty)) {
                finalized.extend(out.finalized);
            }
        }

        assert!(!finalized.is_empty());
        for pair in finalized.windows(2) {
            assert_eq!(pair[1].bucket_start, pair[0].bucket_start + 15);
        }
        for c in &finalized {
            assert!(c.is_well_formed(), "{c:?}");
            let expected = expected_volume.get(&c.bucket_start).copied().unwrap_or(0.0);
            assert!((c.volume - expected).abs() < 1e-9, "{c:?} expected {expected}");
        }
    }
}
