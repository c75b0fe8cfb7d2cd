pub mod resample;
pub mod series;
pub mod sync;
pub mod view;

pub use resample::{parse_timeframe, resample, Resampled, Resampler};
pub use series::{Applied, CandleSeries};
pub use sync::{RangeSynchronizer, ViewId, Viewport, VisibleRange};
pub use view::{BarUpdate, ChartView};
