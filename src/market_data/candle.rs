// =============================================================================
// Candle Model & Bucketing — pure OHLCV construction shared by every path
// =============================================================================
//
// `merge_tick` is the only place a trade is folded into a candle. The live
// aggregator and the trade-replay bridge both go through it so the candle seen
// at the bridge → live seam is built by identical arithmetic.
// =============================================================================

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A single OHLCV candle keyed by the start of its time bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bucket start, epoch seconds, floored to the stream resolution.
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Whether a candle's bucket has fully elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandleStatus {
    /// Bucket closed; the candle will never change again.
    Final,
    /// Bucket still open; later updates for the same `bucket_start` replace it.
    Provisional,
}

impl std::fmt::Display for CandleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Final => write!(f, "final"),
            Self::Provisional => write!(f, "provisional"),
        }
    }
}

/// A candle tagged with its status, as held in buffers and pushed to viewers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandleUpdate {
    #[serde(flatten)]
    pub candle: Candle,
    pub status: CandleStatus,
}

impl CandleUpdate {
    pub fn finalized(candle: Candle) -> Self {
        Self {
            candle,
            status: CandleStatus::Final,
        }
    }

    pub fn provisional(candle: Candle) -> Self {
        Self {
            candle,
            status: CandleStatus::Provisional,
        }
    }

    pub fn is_final(&self) -> bool {
        self.status == CandleStatus::Final
    }
}

/// A single trade from the live feed or a replay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub event_time_ms: i64,
    pub price: f64,
    pub quantity: f64,
}

impl TradeEvent {
    pub fn event_time_secs(&self) -> i64 {
        self.event_time_ms.div_euclid(1000)
    }

    /// Price and quantity must both be strictly positive and finite.
    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && self.quantity.is_finite() && self.price > 0.0 && self.quantity > 0.0
    }
}

/// `floor(timestamp / resolution) * resolution`, flooring toward negative
/// infinity so pre-epoch timestamps bucket consistently.
pub fn bucket_of(timestamp: i64, resolution_secs: i64) -> i64 {
    debug_assert!(resolution_secs > 0, "resolution must be positive");
    timestamp.div_euclid(resolution_secs) * resolution_secs
}

/// Fold one trade into `candle`.
///
/// Starts a fresh candle when `candle` is `None` or belongs to a different
/// bucket; otherwise widens high/low, moves close and accumulates volume.
pub fn merge_tick(candle: Option<&Candle>, price: f64, quantity: f64, bucket_start: i64) -> Candle {
    match candle {
        Some(c) if c.bucket_start == bucket_start => Candle {
            bucket_start,
            open: c.open,
            high: c.high.max(price),
            low: c.low.min(price),
            close: price,
            volume: c.volume + quantity,
        },
        _ => Candle {
            bucket_start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: quantity,
        },
    }
}

impl Candle {
    /// A zero-volume candle for a bucket that saw no trades, pinned to the
    /// previous close.
    pub fn carry_forward(bucket_start: i64, previous_close: f64) -> Self {
        Self {
            bucket_start,
            open: previous_close,
            high: previous_close,
            low: previous_close,
            close: previous_close,
            volume: 0.0,
        }
    }

    /// `low ≤ min(open, close) ≤ max(open, close) ≤ high` and `volume ≥ 0`.
    pub fn is_well_formed(&self) -> bool {
        let body_low = self.open.min(self.close);
        let body_high = self.open.max(self.close);
        self.low <= body_low && body_high <= self.high && self.volume >= 0.0
    }

    /// Whether the bucket has fully elapsed at `now_secs`.
    pub fn is_closed_at(&self, now_secs: i64, resolution_secs: i64) -> bool {
        now_secs >= self.bucket_start + resolution_secs
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.bucket_start, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Strict chronological order of two candles by bucket.
pub fn by_bucket(a: &Candle, b: &Candle) -> std::cmp::Ordering {
    a.bucket_start.cmp(&b.bucket_start)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_floors_to_resolution() {
        assert_eq!(bucket_of(1_700_000_007, 15), 1_699_999_995);
        assert_eq!(bucket_of(30, 15), 30);
        assert_eq!(bucket_of(44, 15), 30);
        assert_eq!(bucket_of(45, 15), 45);
    }

    #[test]
    fn bucket_floors_negative_timestamps_down() {
        assert_eq!(bucket_of(-1, 15), -15);
        assert_eq!(bucket_of(-15, 15), -15);
    }

    #[test]
    fn merge_tick_starts_new_candle() {
        let c = merge_tick(None, 100.0, 2.0, 30);
        assert_eq!(c.bucket_start, 30);
        assert_eq!((c.open, c.high, c.low, c.close), (100.0, 100.0, 100.0, 100.0));
        assert_eq!(c.volume, 2.0);
    }

    #[test]
    fn merge_tick_updates_same_bucket() {
        let c = merge_tick(None, 100.0, 1.0, 30);
        let c = merge_tick(Some(&c), 105.0, 0.5, 30);
        let c = merge_tick(Some(&c), 98.0, 0.25, 30);
        assert_eq!(c.open, 100.0);
        assert_eq!(c.high, 105.0);
        assert_eq!(c.low, 98.0);
        assert_eq!(c.close, 98.0);
        assert!((c.volume - 1.75).abs() < 1e-12);
        assert!(c.is_well_formed());
    }

    #[test]
    fn merge_tick_different_bucket_resets() {
        let c = merge_tick(None, 100.0, 1.0, 30);
        let c = merge_tick(Some(&c), 101.0, 3.0, 45);
        assert_eq!(c.bucket_start, 45);
        assert_eq!(c.open, 101.0);
        assert_eq!(c.volume, 3.0);
    }

    #[test]
    fn carry_forward_is_flat_and_empty() {
        let c = Candle::carry_forward(60, 42.5);
        assert!(c.is_well_formed());
        assert_eq!(c.volume, 0.0);
        assert_eq!(c.high, c.low);
    }

    #[test]
    fn closed_at_boundary() {
        let c = merge_tick(None, 1.0, 1.0, 30);
        assert!(!c.is_closed_at(44, 15));
        assert!(c.is_closed_at(45, 15));
    }

    #[test]
    fn update_serializes_flat_with_status() {
        let update = CandleUpdate::provisional(merge_tick(None, 1.0, 1.0, 30));
        let json = serde_json::to_value(update).unwrap();
        assert_eq!(json["bucket_start"], 30);
        assert_eq!(json["status"], "provisional");
    }

    #[test]
    fn trade_validity() {
        let ok = TradeEvent { event_time_ms: 1, price: 1.0, quantity: 1.0 };
        let bad = TradeEvent { event_time_ms: 1, price: 0.0, quantity: 1.0 };
        assert!(ok.is_valid());
        assert!(!bad.is_valid());
        assert_eq!(TradeEvent { event_time_ms: 1_999, ..ok }.event_time_secs(), 1);
    }
}
