// =============================================================================
// Multi-Resolution Resampler — base candles folded into coarser bars
// =============================================================================
//
//   open   = first base open        high = max of base highs
//   close  = last base close        low  = min of base lows
//   volume = sum of base volumes
//
// Only the newest coarse bar is ever open. Its contributing base candles are
// kept keyed by bucket, so re-delivering a base bucket replaces it instead of
// double counting, and an append touches at most that one bar.
// =============================================================================

use std::collections::BTreeMap;

use crate::market_data::{bucket_of, Candle};

/// Result of feeding one base candle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resampled {
    pub bar: Candle,
    /// True when the candle opened a new coarse bar.
    pub appended: bool,
}

#[derive(Debug, Clone)]
pub struct Resampler {
    coarse_secs: i64,
    bars: Vec<Candle>,
    /// Base candles of the newest coarse bar, by base bucket.
    tail: BTreeMap<i64, Candle>,
}

impl Resampler {
    /// `coarse_secs` is clamped to at least 1.
    pub fn new(coarse_secs: i64) -> Self {
        Self {
            coarse_secs: coarse_secs.max(1),
            bars: Vec::new(),
            tail: BTreeMap::new(),
        }
    }

    pub fn coarse_secs(&self) -> i64 {
        self.coarse_secs
    }

    /// Coarse bars, ascending. The last one may still be open.
    pub fn bars(&self) -> &[Candle] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Feed one base candle. Candles for a coarse bar that is already sealed
    /// are ignored and yield `None`.
    pub fn apply(&mut self, base: Candle) -> Option<Resampled> {
        let coarse = bucket_of(base.bucket_start, self.coarse_secs);
        let appended = match self.bars.last() {
            Some(last) if coarse < last.bucket_start => return None,
            Some(last) if coarse == last.bucket_start => false,
            _ => true,
        };

        if appended {
            self.tail.clear();
        }
        self.tail.insert(base.bucket_start, base);
        let bar = fold(coarse, self.tail.values());

        if appended {
            self.bars.push(bar);
        } else if let Some(last) = self.bars.last_mut() {
            *last = bar;
        }
        Some(Resampled { bar, appended })
    }
}

fn fold<'a>(bucket_start: i64, parts: impl Iterator<Item = &'a Candle>) -> Candle {
    let mut bar: Option<Candle> = None;
    for c in parts {
        bar = Some(match bar {
            None => Candle { bucket_start, ..*c },
            Some(b) => Candle {
                bucket_start,
                open: b.open,
                high: b.high.max(c.high),
                low: b.low.min(c.low),
                close: c.close,
                volume: b.volume + c.volume,
            },
        });
    }
    bar.unwrap_or_else(|| Candle::carry_forward(bucket_start, 0.0))
}

/// Resample an ascending base series in one pass.
pub fn resample(base: &[Candle], coarse_secs: i64) -> Vec<Candle> {
    let mut r = Resampler::new(coarse_secs);
    for c in base {
        r.apply(*c);
    }
    r.bars
}

/// Parse a timeframe label (`15s`, `1m`, `5m`, `1h`, `4h`, `1d`) or a bare
/// number of seconds into seconds.
pub fn parse_timeframe(label: &str) -> Option<i64> {
    let label = label.trim().to_ascii_lowercase();
    if let Ok(secs) = label.parse::<i64>() {
        return (secs > 0).then_some(secs);
    }
    let split = label.find(|ch: char| !ch.is_ascii_digit())?;
    let (num, unit) = label.split_at(split);
    let n: i64 = num.parse().ok().filter(|n| *n > 0)?;
    let unit_secs = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        _ => return None,
    };
    Some(n * unit_secs)
}
