pub mod aggregator;
pub mod candle;
pub mod candle_buffer;
pub mod live;
pub mod trade_stream;

// Re-export the core types for convenient access (e.g. `use crate::market_data::Candle`).
pub use aggregator::{Ingested, TickAggregator};
pub use candle::{bucket_of, merge_tick, Candle, CandleStatus, CandleUpdate, TradeEvent};
pub use candle_buffer::CandleBuffer;
pub use live::{run_aggregator, FeedStatus, LiveHub};
