// =============================================================================
// Simple Moving Average (SMA)
// =============================================================================
//
// Trailing mean of the last `period` closes, maintained as a running sum so
// each new bar costs O(1):
//
//   sum_t = sum_{t-1} + close_t - close_{t-period}
//   SMA_t = sum_t / period
//
// The newest bar of a live chart is still changing, so the tail value can be
// replaced in place without touching the rest of the window.
// =============================================================================

use std::collections::VecDeque;

/// Rebuild the running sum from the window this often to bound float drift.
const RESUM_EVERY: u64 = 4096;

#[derive(Debug, Clone)]
pub struct RollingSma {
    period: usize,
    window: VecDeque<f64>,
    sum: f64,
    pushes: u64,
}

impl RollingSma {
    /// `period` is clamped to at least 1.
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            window: VecDeque::with_capacity(period),
            sum: 0.0,
            pushes: 0,
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    /// Append a close. Returns the SMA once `period` closes have been seen.
    pub fn push(&mut self, close: f64) -> Option<f64> {
        self.window.push_back(close);
        self.sum += close;
        if self.window.len() > self.period {
            if let Some(old) = self.window.pop_front() {
                self.sum -= old;
            }
        }
        self.pushes += 1;
        if self.pushes % RESUM_EVERY == 0 {
            self.sum = self.window.iter().sum();
        }
        self.value()
    }

    /// Replace the newest close (the bar is still open). Behaves like `push`
    /// on an empty window.
    pub fn replace_last(&mut self, close: f64) -> Option<f64> {
        match self.window.back_mut() {
            Some(last) => {
                self.sum += close - *last;
                *last = close;
                self.value()
            }
            None => self.push(close),
        }
    }

    pub fn value(&self) -> Option<f64> {
        if self.window.len() < self.period {
            return None;
        }
        let mean = self.sum / self.period as f64;
        mean.is_finite().then_some(mean)
    }
}

/// SMA aligned with `closes`: `None` until `period` closes are available.
pub fn sma_series(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut sma = RollingSma::new(period);
    closes.iter().map(|&c| sma.push(c)).collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn direct(closes: &[f64], period: usize, idx: usize) -> Option<f64> {
        if idx + 1 < period {
            return None;
        }
        let window = &closes[idx + 1 - period..=idx];
        Some(window.iter().sum::<f64>() / period as f64)
    }

    #[test]
    fn warm_up_yields_none() {
        let out = sma_series(&[1.0, 2.0, 3.0], 3);
        assert_eq!(out, vec![None, None, Some(2.0)]);
    }

    #[test]
    fn period_zero_is_clamped() {
        assert_eq!(sma_series(&[4.0, 6.0], 0), vec![Some(4.0), Some(6.0)]);
    }

    #[test]
    fn incremental_matches_direct_recomputation() {
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        let closes: Vec<f64> = (0..10_000)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                30_000.0 + (seed % 100_000) as f64 / 100.0
            })
            .collect();

        for period in [1, 5, 20, 200] {
            let incremental = sma_series(&closes, period);
            for (idx, got) in incremental.iter().enumerate() {
                match (got, direct(&closes, period, idx)) {
                    (None, None) => {}
                    (Some(a), Some(b)) => assert!((a - b).abs() < 1e-6, "period {period} idx {idx}: {a} vs {b}"),
                    other => panic!("period {period} idx {idx}: {other:?}"),
                }
            }
        }
    }

    #[test]
    fn replacing_tail_matches_recomputation() {
        let mut sma = RollingSma::new(3);
        sma.push(1.0);
        sma.push(2.0);
        assert_eq!(sma.push(3.0), Some(2.0));
        assert_eq!(sma.replace_last(6.0), Some(3.0));
        assert_eq!(sma.replace_last(9.0), Some(4.0));
        assert_eq!(sma.push(10.0), Some(7.0));
    }

    #[test]
    fn replace_on_empty_pushes() {
        let mut sma = RollingSma::new(1);
        assert_eq!(sma.replace_last(5.0), Some(5.0));
    }
}
