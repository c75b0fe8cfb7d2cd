// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Chart overlays computed over resampled bars. Both averages are incremental
// (O(1) per bar) and support revising the newest, still-open bar in place.
// Outputs are aligned with the input: `None` until the look-back is filled.

pub mod ema;
pub mod sma;

pub use ema::{ema_series, RollingEma};
pub use sma::{sma_series, RollingSma};
