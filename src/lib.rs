// ── Module declarations ──────────────────────────────────────────────────────
pub mod api;
pub mod app_state;
pub mod auth;
pub mod binance;
pub mod chart;
pub mod clock;
pub mod config;
pub mod error;
pub mod history;
pub mod indicators;
pub mod market_data;
pub mod session;
