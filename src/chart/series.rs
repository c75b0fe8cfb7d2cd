// =============================================================================
// Candle Series — the client-side merge of bootstrap pages and stream updates
// =============================================================================
//
// One entry per `bucket_start`, ascending. Bootstrap pages arrive newest first
// and the gap stream delivers forward in time; both land here and the result
// is a single ordered, deduplicated timeline. A final candle always wins over
// a provisional one and is never overwritten by a provisional update.
// =============================================================================

use std::collections::BTreeMap;

use crate::market_data::{Candle, CandleUpdate};

/// What `CandleSeries::apply` did with an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Replaced,
    Ignored,
}

#[derive(Debug, Clone, Default)]
pub struct CandleSeries {
    resolution_secs: i64,
    bars: BTreeMap<i64, CandleUpdate>,
}

impl CandleSeries {
    pub fn new(resolution_secs: i64) -> Self {
        Self {
            resolution_secs,
            bars: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Merge one bootstrap page (any order). Store rows are always final.
    pub fn merge_page(&mut self, items: &[Candle]) -> usize {
        items
            .iter()
            .filter(|c| self.apply(CandleUpdate::finalized(**c)) == Applied::Inserted)
            .count()
    }

    pub fn apply(&mut self, update: CandleUpdate) -> Applied {
        let key = update.candle.bucket_start;
        match self.bars.get(&key) {
            None => {
                self.bars.insert(key, update);
                Applied::Inserted
            }
            Some(existing) if existing.is_final() && !update.is_final() => Applied::Ignored,
            Some(existing) if *existing == update => Applied::Ignored,
            Some(_) => {
                self.bars.insert(key, update);
                Applied::Replaced
            }
        }
    }

    pub fn last(&self) -> Option<&CandleUpdate> {
        self.bars.values().next_back()
    }

    pub fn first(&self) -> Option<&CandleUpdate> {
        self.bars.values().next()
    }

    /// Entries in ascending bucket order.
    pub fn iter(&self) -> impl Iterator<Item = &CandleUpdate> {
        self.bars.values()
    }

    pub fn candles(&self) -> Vec<Candle> {
        self.bars.values().map(|u| u.candle).collect()
    }

    /// Buckets between the first and last entry that have no candle.
    pub fn missing_buckets(&self) -> Vec<i64> {
        let mut missing = Vec::new();
        let mut expected: Option<i64> = None;
        for &bucket in self.bars.keys() {
            if let Some(mut next) = expected {
                while next < bucket {
                    missing.push(next);
                    next += self.resolution_secs;
                }
            }
            expected = Some(bucket + self.resolution_secs);
        }
        missing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(bucket: i64, close: f64) -> Candle {
        Candle {
            bucket_start: bucket,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn pages_and_stream_merge_into_one_timeline() {
        let mut s = CandleSeries::new(15);
        // Two bootstrap pages, newest first.
        s.merge_page(&[c(60, 4.0), c(45, 3.0)]);
        s.merge_page(&[c(30, 2.0), c(15, 1.0)]);
        // Stream: a duplicate at the seam, then forward progress.
        assert_eq!(s.apply(CandleUpdate::finalized(c(60, 4.0))), Applied::Ignored);
        s.apply(CandleUpdate::provisional(c(75, 5.0)));
        s.apply(CandleUpdate::finalized(c(75, 5.5)));

        let buckets: Vec<i64> = s.iter().map(|u| u.candle.bucket_start).collect();
        assert_eq!(buckets, vec![15, 30, 45, 60, 75]);
        assert!(s.missing_buckets().is_empty());
        assert_eq!(s.last().unwrap().candle.close, 5.5);
    }

    #[test]
    fn provisional_never_overwrites_final() {
        let mut s = CandleSeries::new(15);
        s.apply(CandleUpdate::finalized(c(15, 1.0)));
        assert_eq!(s.apply(CandleUpdate::provisional(c(15, 9.0))), Applied::Ignored);
        assert!(s.last().unwrap().is_final());
    }

    #[test]
    fn provisional_updates_replace_each_other() {
        let mut s = CandleSeries::new(15);
        assert_eq!(s.apply(CandleUpdate::provisional(c(15, 1.0))), Applied::Inserted);
        assert_eq!(s.apply(CandleUpdate::provisional(c(15, 2.0))), Applied::Replaced);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn gaps_are_reported() {
        let mut s = CandleSeries::new(15);
        s.merge_page(&[c(15, 1.0), c(60, 1.0)]);
        assert_eq!(s.missing_buckets(), vec![30, 45]);
    }
}
