use std::collections::VecDeque;

use parking_lot::RwLock;

use super::candle::{Candle, CandleUpdate};

// ---------------------------------------------------------------------------
// CandleBuffer -- thread-safe ring of recent live candles
// ---------------------------------------------------------------------------

/// Thread-safe ring buffer that stores the most recent live candles for the
/// configured instrument and resolution.  The in-progress candle is updated in
/// place; when a candle is finalized it replaces its provisional version and
/// the ring is trimmed to `max_candles` finalized entries.
///
/// Sessions read it to hand over from bridging to live without missing the
/// buckets that closed before they subscribed.
pub struct CandleBuffer {
    ring: RwLock<VecDeque<CandleUpdate>>,
    max_candles: usize,
}

impl CandleBuffer {
    /// Create a new buffer that retains at most `max_candles` finalized
    /// candles, plus one in-progress candle.
    pub fn new(max_candles: usize) -> Self {
        Self {
            ring: RwLock::new(VecDeque::with_capacity(max_candles + 1)),
            max_candles: max_candles.max(1),
        }
    }

    /// Insert or replace the newest candle.
    ///
    /// * A finalized candle replaces a trailing provisional candle with the same
    ///   `bucket_start`, is appended, and the ring is trimmed.
    /// * A provisional candle replaces a trailing provisional candle of the
    ///   same bucket, otherwise it is appended.
    /// * Anything at or before the newest finalized bucket is ignored.
    pub fn update(&self, update: CandleUpdate) {
        let mut ring = self.ring.write();

        if let Some(last_final) = ring.iter().rev().find(|u| u.is_final()) {
            if update.candle.bucket_start <= last_final.candle.bucket_start {
                return;
            }
        }

        if let Some(last) = ring.back() {
            if !last.is_final() && last.candle.bucket_start <= update.candle.bucket_start {
                ring.pop_back();
            }
        }
        ring.push_back(update);

        if update.is_final() {
            while ring.iter().filter(|u| u.is_final()).count() > self.max_candles {
                ring.pop_front();
            }
        }
    }

    /// Finalized candles with `bucket_start > after`, oldest first.
    pub fn closed_after(&self, after: i64) -> Vec<Candle> {
        self.ring
            .read()
            .iter()
            .filter(|u| u.is_final() && u.candle.bucket_start > after)
            .map(|u| u.candle)
            .collect()
    }

    /// The most recent `count` finalized candles, oldest first.
    pub fn closed(&self, count: usize) -> Vec<Candle> {
        let ring = self.ring.read();
        let closed: Vec<Candle> = ring.iter().filter(|u| u.is_final()).map(|u| u.candle).collect();
        let start = closed.len().saturating_sub(count);
        closed[start..].to_vec()
    }

    /// The in-progress candle, if the newest entry is still open.
    pub fn provisional(&self) -> Option<Candle> {
        self.ring
            .read()
            .back()
            .filter(|u| !u.is_final())
            .map(|u| u.candle)
    }

    /// Bucket of the oldest finalized candle still held.
    pub fn earliest_closed(&self) -> Option<i64> {
        self.ring
            .read()
            .iter()
            .find(|u| u.is_final())
            .map(|u| u.candle.bucket_start)
    }

    /// Bucket of the newest finalized candle.
    pub fn latest_closed(&self) -> Option<i64> {
        self.ring
            .read()
            .iter()
            .rev()
            .find(|u| u.is_final())
            .map(|u| u.candle.bucket_start)
    }

    /// Total number of entries, including an in-progress candle.
    pub fn len(&self) -> usize {
        self.ring.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.read().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
