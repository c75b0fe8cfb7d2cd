// =============================================================================
// Dual-View Range Synchronizer — price and volume panes share one x-range
// =============================================================================
//
// Either pane may report a new logical range (bar indices, fractional). The
// range is normalized, clamped to the data with a little overscroll, then
// pushed to both panes. Panes typically echo a range-changed event while being
// set; the in-flight guard swallows those echoes so a change propagates once.
//
// While the right edge sits within one bar of the newest bar
// (`follow_latest`), appending bars scrolls both panes along with the data.
// Dragging further into the overscroll area stops following.
// =============================================================================

use tracing::debug;

/// Bars of overscroll allowed on either side of the data.
pub const OVERSCROLL_BARS: f64 = 10.0;
/// Narrowest range a pane may show.
pub const MIN_SPAN: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisibleRange {
    pub from: f64,
    pub to: f64,
}

impl VisibleRange {
    pub fn new(from: f64, to: f64) -> Self {
        Self { from, to }
    }

    pub fn span(&self) -> f64 {
        self.to - self.from
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewId {
    Price,
    Volume,
}

/// A pane whose visible range can be set programmatically.
pub trait Viewport {
    fn id(&self) -> ViewId;

    /// Apply `range`. Returns the range-changed event the pane fires in
    /// response, if it fires one synchronously.
    fn set_visible_range(&mut self, range: VisibleRange) -> Option<VisibleRange>;
}

#[derive(Debug)]
pub struct RangeSynchronizer<P: Viewport, V: Viewport> {
    price: P,
    volume: V,
    range: Option<VisibleRange>,
    bar_count: usize,
    follow_latest: bool,
    in_flight: bool,
    propagations: u64,
    suppressed: u64,
}

impl<P: Viewport, V: Viewport> RangeSynchronizer<P, V> {
    pub fn new(price: P, volume: V) -> Self {
        Self {
            price,
            volume,
            range: None,
            bar_count: 0,
            follow_latest: true,
            in_flight: false,
            propagations: 0,
            suppressed: 0,
        }
    }

    pub fn range(&self) -> Option<VisibleRange> {
        self.range
    }

    pub fn follow_latest(&self) -> bool {
        self.follow_latest
    }

    pub fn propagations(&self) -> u64 {
        self.propagations
    }

    pub fn suppressed_echoes(&self) -> u64 {
        self.suppressed
    }

    pub fn price(&self) -> &P {
        &self.price
    }

    pub fn volume(&self) -> &V {
        &self.volume
    }

    fn last_index(&self) -> f64 {
        self.bar_count.saturating_sub(1) as f64
    }

    /// Set the data length without moving the panes.
    pub fn set_bar_count(&mut self, bars: usize) {
        self.bar_count = bars;
    }

    /// A pane (or the user) changed the range. Returns the range that was
    /// applied to both panes, or `None` for a suppressed echo.
    pub fn on_range_changed(&mut self, source: ViewId, raw: VisibleRange) -> Option<VisibleRange> {
        if self.in_flight {
            self.suppressed += 1;
            debug!(?source, "range echo suppressed");
            return None;
        }
        let range = clamp(normalize(raw), self.last_index());
        self.propagate(range);
        self.follow_latest = (range.to - self.last_index()).abs() <= 1.0;
        Some(range)
    }

    /// Bars were appended. When following the latest bar, both panes scroll
    /// by the number of new bars.
    pub fn on_bars_appended(&mut self, bars: usize) -> Option<VisibleRange> {
        let old_last = self.last_index();
        self.bar_count = bars;
        let shift = self.last_index() - old_last;
        if !self.follow_latest || shift <= 0.0 {
            return None;
        }
        let current = self.range?;
        let shifted = clamp(VisibleRange::new(current.from + shift, current.to + shift), self.last_index());
        self.propagate(shifted);
        Some(shifted)
    }

    fn propagate(&mut self, range: VisibleRange) {
        self.in_flight = true;
        if let Some(echo) = self.price.set_visible_range(range) {
            self.on_range_changed(ViewId::Price, echo);
        }
        if let Some(echo) = self.volume.set_visible_range(range) {
            self.on_range_changed(ViewId::Volume, echo);
        }
        self.in_flight = false;
        self.range = Some(range);
        self.propagations += 1;
    }
}

fn normalize(r: VisibleRange) -> VisibleRange {
    let (from, to) = if r.from <= r.to { (r.from, r.to) } else { (r.to, r.from) };
    if to - from < MIN_SPAN {
        VisibleRange::new(from, from + MIN_SPAN)
    } else {
        VisibleRange::new(from, to)
    }
}

fn clamp(r: VisibleRange, last_index: f64) -> VisibleRange {
    let lo = -OVERSCROLL_BARS;
    let hi = last_index + OVERSCROLL_BARS;
    let from = r.from.clamp(lo, hi);
    let to = r.to.clamp(lo, hi);
    if to - from >= MIN_SPAN {
        VisibleRange::new(from, to)
    } else if from + MIN_SPAN <= hi {
        VisibleRange::new(from, from + MIN_SPAN)
    } else {
        VisibleRange::new(hi - MIN_SPAN, hi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records applied ranges and echoes each one back.
    struct Pane {
        id: ViewId,
        applied: Vec<VisibleRange>,
        echo: bool,
    }

    impl Pane {
        fn new(id: ViewId, echo: bool) -> Self {
            Self {
                id,
                applied: Vec::new(),
                echo,
            }
        }
    }

    impl Viewport for Pane {
        fn id(&self) -> ViewId {
            self.id
        }

        fn set_visible_range(&mut self, range: VisibleRange) -> Option<VisibleRange> {
            self.applied.push(range);
            self.echo.then_some(range)
        }
    }

    fn sync(bars: usize, echo: bool) -> RangeSynchronizer<Pane, Pane> {
        let mut s = RangeSynchronizer::new(Pane::new(ViewId::Price, echo), Pane::new(ViewId::Volume, echo));
        s.set_bar_count(bars);
        s
    }

    #[test]
    fn range_in_history_does_not_follow() {
        let mut s = sync(10, false);
        let r = s.on_range_changed(ViewId::Price, VisibleRange::new(-5.0, 3.0)).unwrap();
        assert_eq!(r, VisibleRange::new(-5.0, 3.0));
        assert!(!s.follow_latest());
        assert_eq!(s.price().applied, vec![r]);
        assert_eq!(s.volume().applied, vec![r]);
    }

    #[test]
    fn right_edge_within_one_bar_follows() {
        let mut s = sync(10, false);
        s.on_range_changed(ViewId::Volume, VisibleRange::new(7.0, 10.0));
        assert!(s.follow_latest());
        s.on_range_changed(ViewId::Volume, VisibleRange::new(4.0, 8.0));
        assert!(s.follow_latest());
    }

    #[test]
    fn deep_overscroll_stops_following() {
        let mut s = sync(10, false);
        s.on_range_changed(ViewId::Price, VisibleRange::new(10.0, 15.0));
        assert!(!s.follow_latest());
        assert!(s.on_bars_appended(11).is_none());

        s.on_range_changed(ViewId::Price, VisibleRange::new(6.0, 10.5));
        assert!(s.follow_latest());
    }

    #[test]
    fn echoes_are_suppressed_and_propagation_counted_once() {
        let mut s = sync(10, true);
        s.on_range_changed(ViewId::Price, VisibleRange::new(2.0, 6.0));
        assert_eq!(s.propagations(), 1);
        assert_eq!(s.suppressed_echoes(), 2);
        assert_eq!(s.price().applied.len(), 1);
    }

    #[test]
    fn inverted_and_degenerate_ranges_are_normalized() {
        let mut s = sync(10, false);
        let r = s.on_range_changed(ViewId::Price, VisibleRange::new(6.0, 2.0)).unwrap();
        assert_eq!(r, VisibleRange::new(2.0, 6.0));
        let r = s.on_range_changed(ViewId::Price, VisibleRange::new(4.0, 4.0)).unwrap();
        assert_eq!(r.span(), MIN_SPAN);
    }

    #[test]
    fn clamped_to_overscroll_bounds() {
        let mut s = sync(10, false);
        let r = s.on_range_changed(ViewId::Price, VisibleRange::new(-50.0, 500.0)).unwrap();
        assert_eq!(r, VisibleRange::new(-10.0, 19.0));
        let r = s.on_range_changed(ViewId::Price, VisibleRange::new(100.0, 200.0)).unwrap();
        assert_eq!(r, VisibleRange::new(18.0, 19.0));
    }

    #[test]
    fn appended_bars_scroll_when_following() {
        let mut s = sync(10, false);
        s.on_range_changed(ViewId::Price, VisibleRange::new(5.0, 9.0));
        let r = s.on_bars_appended(12).unwrap();
        assert_eq!(r, VisibleRange::new(7.0, 11.0));
        assert_eq!(s.volume().applied.last(), Some(&r));
    }

    #[test]
    fn appended_bars_leave_history_view_alone() {
        let mut s = sync(10, false);
        s.on_range_changed(ViewId::Price, VisibleRange::new(0.0, 4.0));
        assert!(s.on_bars_appended(11).is_none());
        assert_eq!(s.range(), Some(VisibleRange::new(0.0, 4.0)));
    }
}
