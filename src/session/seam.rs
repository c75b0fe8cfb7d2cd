// =============================================================================
// Seam Guard — exactly-once emission across the bridge → live hand-over
// =============================================================================
//
// Every final candle a session emits passes through one guard that remembers
// the newest final bucket already sent. Bridged and live sources may overlap
// around the hand-over; anything at or before that bucket is dropped, and a
// hole between the newest bucket and an admitted candle is filled with
// carry-forward candles so the emitted sequence stays contiguous.
// =============================================================================

use tracing::debug;

use crate::market_data::Candle;

/// Upper bound on carry-forward candles inserted for one admitted candle.
const MAX_SEAM_FILL: i64 = 240;

#[derive(Debug, Clone)]
pub struct SeamGuard {
    resolution_secs: i64,
    /// Newest final bucket already emitted (or the exclusive start bucket).
    last_bucket: i64,
    last_close: Option<f64>,
    last_provisional: Option<Candle>,
    duplicates: u64,
}

impl SeamGuard {
    /// Guard for a stream that starts strictly after `after_bucket`.
    pub fn new(resolution_secs: i64, after_bucket: i64) -> Self {
        Self {
            resolution_secs,
            last_bucket: after_bucket,
            last_close: None,
            last_provisional: None,
            duplicates: 0,
        }
    }

    pub fn last_bucket(&self) -> i64 {
        self.last_bucket
    }

    /// The first bucket not yet emitted as final.
    pub fn next_needed(&self) -> i64 {
        self.last_bucket + self.resolution_secs
    }

    /// Candles suppressed because their bucket was already emitted.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    /// Admit a final candle. Returns what to emit, oldest first: nothing for a
    /// duplicate, otherwise any carry-forward fill followed by the candle.
    pub fn admit_final(&mut self, candle: Candle) -> Vec<Candle> {
        if candle.bucket_start <= self.last_bucket {
            self.duplicates += 1;
            debug!(bucket = candle.bucket_start, last = self.last_bucket, "duplicate final suppressed");
            return Vec::new();
        }

        let mut out = Vec::new();
        if let Some(close) = self.last_close {
            let mut bucket = self.next_needed();
            let mut budget = MAX_SEAM_FILL;
            while bucket < candle.bucket_start && budget > 0 {
                out.push(Candle::carry_forward(bucket, close));
                bucket += self.resolution_secs;
                budget -= 1;
            }
        }
        out.push(candle);

        self.last_bucket = candle.bucket_start;
        self.last_close = Some(candle.close);
        if matches!(self.last_provisional, Some(p) if p.bucket_start <= candle.bucket_start) {
            self.last_provisional = None;
        }
        out
    }

    /// Admit a provisional update. Returns it when it is for a bucket not yet
    /// final and differs from the last provisional sent.
    pub fn admit_provisional(&mut self, candle: Candle) -> Option<Candle> {
        if candle.bucket_start <= self.last_bucket || self.last_provisional == Some(candle) {
            return None;
        }
        self.last_provisional = Some(candle);
        Some(candle)
    }
}
