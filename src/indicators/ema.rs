// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// EMA gives more weight to recent prices, making it more responsive to new
// information than the Simple Moving Average (SMA).
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The very first EMA value is seeded with the SMA of the first `period` closes.
// The open tail bar can be revised: the EMA before it is kept so the tail
// value is recomputed from the same base.
// =============================================================================

#[derive(Debug, Clone)]
pub struct RollingEma {
    period: usize,
    multiplier: f64,
    /// Closes collected while seeding.
    seed: Vec<f64>,
    /// EMA up to, but excluding, the newest close.
    prev: Option<f64>,
    current: Option<f64>,
    last_close: Option<f64>,
}

impl RollingEma {
    /// `period` is clamped to at least 1.
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            multiplier: 2.0 / (period + 1) as f64,
            seed: Vec::with_capacity(period),
            prev: None,
            current: None,
            last_close: None,
        }
    }

    pub fn value(&self) -> Option<f64> {
        self.current
    }

    /// Append a close. Returns the EMA once `period` closes have been seen.
    pub fn push(&mut self, close: f64) -> Option<f64> {
        self.last_close = Some(close);
        match self.current {
            None => {
                self.seed.push(close);
                if self.seed.len() == self.period {
                    let sma = self.seed.iter().sum::<f64>() / self.period as f64;
                    if sma.is_finite() {
                        self.current = Some(sma);
                    } else {
                        // A broken seed cannot be trusted; start over.
                        self.seed.clear();
                    }
                }
            }
            Some(ema) => {
                self.prev = Some(ema);
                self.current = Some(self.step(ema, close)).filter(|v| v.is_finite());
                if self.current.is_none() {
                    self.prev = None;
                    self.seed.clear();
                }
            }
        }
        self.current
    }

    /// Replace the newest close (the bar is still open).
    pub fn replace_last(&mut self, close: f64) -> Option<f64> {
        if self.last_close.is_none() {
            return self.push(close);
        }
        self.last_close = Some(close);
        match self.prev {
            Some(prev) => {
                self.current = Some(self.step(prev, close)).filter(|v| v.is_finite());
            }
            None => {
                if let Some(last) = self.seed.last_mut() {
                    *last = close;
                    if self.seed.len() == self.period {
                        self.current = Some(self.seed.iter().sum::<f64>() / self.period as f64);
                    }
                }
            }
        }
        self.current
    }

    fn step(&self, prev: f64, close: f64) -> f64 {
        close * self.multiplier + prev * (1.0 - self.multiplier)
    }
}

/// EMA aligned with `closes`: `None` until `period` closes are available.
pub fn ema_series(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut ema = RollingEma::new(period);
    closes.iter().map(|&c| ema.push(c)).collect()
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_empty_input() {
        assert!(ema_series(&[], 5).is_empty());
    }

    #[test]
    fn ema_insufficient_data() {
        assert_eq!(ema_series(&[1.0, 2.0], 5), vec![None, None]);
    }

    #[test]
    fn ema_period_equals_length() {
        let ema = ema_series(&[2.0, 4.0, 6.0], 3);
        // Seed is the SMA = (2+4+6)/3 = 4.0
        assert!((ema[2].unwrap() - 4.0).abs() < 1e-10);
    }

    #[test]
    fn ema_known_values() {
        // 5-period EMA of [1..=10]: SMA seed 3.0, multiplier 1/3.
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let ema = ema_series(&closes, 5);
        assert!(ema[..4].iter().all(Option::is_none));

        let mult = 2.0 / 6.0;
        let mut expected = 3.0;
        assert!((ema[4].unwrap() - expected).abs() < 1e-10);
        for (i, &c) in closes.iter().enumerate().skip(5) {
            expected = c * mult + expected * (1.0 - mult);
            assert!((ema[i].unwrap() - expected).abs() < 1e-10, "idx {i}");
        }
    }

    #[test]
    fn replacing_tail_recomputes_from_previous() {
        let mut a = RollingEma::new(3);
        for c in [1.0, 2.0, 3.0, 4.0] {
            a.push(c);
        }
        a.replace_last(10.0);

        let mut b = RollingEma::new(3);
        for c in [1.0, 2.0, 3.0, 10.0] {
            b.push(c);
        }
        assert!((a.value().unwrap() - b.value().unwrap()).abs() < 1e-12);
    }

    #[test]
    fn replacing_during_seed_updates_seed() {
        let mut ema = RollingEma::new(2);
        ema.push(1.0);
        ema.push(2.0);
        assert_eq!(ema.replace_last(5.0), Some(3.0));
    }

    #[test]
    fn nan_resets_the_series() {
        let mut ema = RollingEma::new(2);
        ema.push(1.0);
        ema.push(3.0);
        assert_eq!(ema.push(f64::NAN), None);
        ema.push(4.0);
        assert_eq!(ema.push(6.0), Some(5.0));
    }
}
