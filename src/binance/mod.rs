pub mod client;
pub mod rate_limit;

pub use client::{BinanceClient, BinanceReplaySource, BINANCE_REST_BASE};
pub use rate_limit::{RateLimitSnapshot, RateLimitTracker};
