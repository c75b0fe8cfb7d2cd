// =============================================================================
// Chart View — what a viewer keeps per symbol
// =============================================================================
//
// Base candles go into the deduplicated series; every accepted change is fed
// to the resampler, whose newest coarse bar drives the trailing SMA and the
// range synchronizer. History pages are merged first and the derived state is
// rebuilt once; live updates afterwards are incremental.
// =============================================================================

use crate::indicators::RollingSma;
use crate::market_data::{Candle, CandleUpdate};

use super::resample::Resampler;
use super::series::{Applied, CandleSeries};
use super::sync::{RangeSynchronizer, ViewId, Viewport, VisibleRange};

/// Bars shown when the view is first laid out.
pub const INITIAL_VISIBLE_BARS: usize = 120;

/// The coarse bar touched by one live update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BarUpdate {
    pub bar: Candle,
    pub appended: bool,
    pub sma: Option<f64>,
    /// Range both panes were scrolled to, when the update moved them.
    pub scrolled_to: Option<VisibleRange>,
}

pub struct ChartView<P: Viewport, V: Viewport> {
    series: CandleSeries,
    resampler: Resampler,
    sma_period: usize,
    sma: RollingSma,
    sync: RangeSynchronizer<P, V>,
}

impl<P: Viewport, V: Viewport> ChartView<P, V> {
    pub fn new(resolution_secs: i64, coarse_secs: i64, sma_period: usize, price: P, volume: V) -> Self {
        Self {
            series: CandleSeries::new(resolution_secs),
            resampler: Resampler::new(coarse_secs),
            sma_period,
            sma: RollingSma::new(sma_period),
            sync: RangeSynchronizer::new(price, volume),
        }
    }

    pub fn series(&self) -> &CandleSeries {
        &self.series
    }

    pub fn bars(&self) -> &[Candle] {
        self.resampler.bars()
    }

    pub fn sma(&self) -> Option<f64> {
        self.sma.value()
    }

    pub fn sync(&self) -> &RangeSynchronizer<P, V> {
        &self.sync
    }

    pub fn sync_mut(&mut self) -> &mut RangeSynchronizer<P, V> {
        &mut self.sync
    }

    /// Merge one history page. Call `rebuild` after the last page.
    pub fn merge_page(&mut self, items: &[Candle]) -> usize {
        self.series.merge_page(items)
    }

    /// Recompute bars and SMA from the series and lay out the newest bars.
    pub fn rebuild(&mut self) {
        self.resampler = Resampler::new(self.resampler.coarse_secs());
        self.sma = RollingSma::new(self.sma_period);
        for update in self.series.iter() {
            if let Some(out) = self.resampler.apply(update.candle) {
                if out.appended {
                    self.sma.push(out.bar.close);
                } else {
                    self.sma.replace_last(out.bar.close);
                }
            }
        }

        let bars = self.resampler.len();
        self.sync.set_bar_count(bars);
        if bars > 0 {
            let last = (bars - 1) as f64;
            let from = last - INITIAL_VISIBLE_BARS as f64 + 1.0;
            self.sync.on_range_changed(ViewId::Price, VisibleRange::new(from, last));
        }
    }

    /// Apply one live update. `None` when it changed nothing visible.
    pub fn apply(&mut self, update: CandleUpdate) -> Option<BarUpdate> {
        if self.series.apply(update) == Applied::Ignored {
            return None;
        }
        let out = self.resampler.apply(update.candle)?;
        let (sma, scrolled_to) = if out.appended {
            let sma = self.sma.push(out.bar.close);
            (sma, self.sync.on_bars_appended(self.resampler.len()))
        } else {
            (self.sma.replace_last(out.bar.close), None)
        };
        Some(BarUpdate {
            bar: out.bar,
            appended: out.appended,
            sma,
            scrolled_to,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::resample;
    use crate::indicators::sma_series;

    #[derive(Default)]
    struct Pane(Option<VisibleRange>);

    impl Viewport for Pane {
        fn id(&self) -> ViewId {
            ViewId::Price
        }

        fn set_visible_range(&mut self, range: VisibleRange) -> Option<VisibleRange> {
            self.0 = Some(range);
            None
        }
    }

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

    fn view() -> ChartView<Pane, Pane> {
        ChartView::new(15, 60, 3, Pane::default(), Pane::default())
    }

    #[test]
    fn history_then_live_matches_batch() {
        let mut v = view();
        // 40 base candles split across two newest-first pages.
        let all: Vec<Candle> = (0..40).map(|i| c(i * 15, 100.0 + i as f64)).collect();
        let mut newest_first = all.clone();
        newest_first.reverse();
        v.merge_page(&newest_first[..20]);
        v.merge_page(&newest_first[20..]);
        v.rebuild();
        assert_eq!(v.bars().len(), 10);
        assert!(v.sync().follow_latest());

        // Live: a seam duplicate, a provisional, then its final.
        assert!(v.apply(CandleUpdate::finalized(all[39])).is_none());
        let p = v.apply(CandleUpdate::provisional(c(600, 200.0))).unwrap();
        assert!(p.appended);
        assert!(p.scrolled_to.is_some());
        let f = v.apply(CandleUpdate::finalized(c(600, 201.0))).unwrap();
        assert!(!f.appended);

        let mut merged = all.clone();
        merged.push(c(600, 201.0));
        let batch = resample(&merged, 60);
        assert_eq!(v.bars(), &batch[..]);

        let closes: Vec<f64> = batch.iter().map(|b| b.close).collect();
        assert_eq!(v.sma(), *sma_series(&closes, 3).last().unwrap());
        assert_eq!(f.sma, v.sma());
    }

    #[test]
    fn scrolled_back_view_stays_put() {
        let mut v = view();
        v.merge_page(&(0..40).map(|i| c(i * 15, 1.0)).collect::<Vec<_>>());
        v.rebuild();
        v.sync_mut().on_range_changed(ViewId::Price, VisibleRange::new(0.0, 4.0));

        let out = v.apply(CandleUpdate::finalized(c(600, 1.0))).unwrap();
        assert!(out.appended);
        assert!(out.scrolled_to.is_none());
        assert_eq!(v.sync().range(), Some(VisibleRange::new(0.0, 4.0)));
    }
}
