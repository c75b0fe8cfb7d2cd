// =============================================================================
// Service Configuration — JSON file, then environment overrides
// =============================================================================
//
// Every tunable lives here. All fields carry `#[serde(default)]` so that an
// older or partial `candle_bridge.json` still loads. Environment variables
// (including a `.env` loaded by `dotenv`) win over the file.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::session::BridgeMode;

pub const CONFIG_FILE: &str = "candle_bridge.json";

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "btcusdt".to_string()
}

fn default_resolution_secs() -> i64 {
    15
}

fn default_gap_max_minutes() -> i64 {
    15
}

fn default_cadence_secs() -> f64 {
    1.5
}

fn default_session_ttl_secs() -> i64 {
    1800
}

fn default_page_limit() -> usize {
    5000
}

fn default_ring_buffer_minutes() -> i64 {
    30
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_store_table() -> String {
    "price_15s".to_string()
}

fn default_store_timeout_secs() -> u64 {
    20
}

fn default_retry_attempts() -> usize {
    3
}

fn default_binance_ws_base() -> String {
    crate::market_data::trade_stream::BINANCE_WS_BASE.to_string()
}

fn default_binance_rest_base() -> String {
    crate::binance::BINANCE_REST_BASE.to_string()
}

fn default_feed_max_reconnects() -> usize {
    20
}

fn default_replay_page_limit() -> usize {
    1000
}

fn default_replay_max_pages() -> usize {
    20
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    #[default]
    SharedSecret,
    Remote,
}

impl std::str::FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shared_secret" | "shared" | "token" => Ok(Self::SharedSecret),
            "remote" => Ok(Self::Remote),
            other => Err(format!("unknown auth mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Binance symbol whose trades feed the live candles.
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Base candle resolution in seconds.
    #[serde(default = "default_resolution_secs")]
    pub resolution_secs: i64,

    /// Largest gap the bridge will attempt to close.
    #[serde(default = "default_gap_max_minutes")]
    pub gap_max_minutes: i64,

    /// Bridge poll interval and live provisional push cadence.
    #[serde(default = "default_cadence_secs")]
    pub cadence_secs: f64,

    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: i64,

    /// Largest bootstrap page a client may request.
    #[serde(default = "default_page_limit")]
    pub page_limit: usize,

    /// How much live history the recent-candle ring keeps.
    #[serde(default = "default_ring_buffer_minutes")]
    pub ring_buffer_minutes: i64,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default)]
    pub bridge_mode: BridgeMode,

    /// PostgREST base URL. Without it an empty in-memory store is used.
    #[serde(default)]
    pub store_url: Option<String>,

    #[serde(default)]
    pub store_api_key: String,

    #[serde(default = "default_store_table")]
    pub store_table: String,

    /// Set when historical rows may be rewritten after they are first read.
    #[serde(default)]
    pub store_rewritable: bool,

    #[serde(default = "default_store_timeout_secs")]
    pub store_timeout_secs: u64,

    #[serde(default = "default_retry_attempts")]
    pub store_retry_attempts: usize,

    #[serde(default)]
    pub auth_mode: AuthMode,

    #[serde(default)]
    pub auth_url: Option<String>,

    #[serde(default)]
    pub auth_api_key: String,

    /// Only this subject may open sessions (remote auth).
    #[serde(default)]
    pub auth_allow_sub: Option<String>,

    /// Shared bearer token (shared-secret auth).
    #[serde(default)]
    pub token: String,

    /// HMAC key for bootstrap cursors. Generated per process when empty.
    #[serde(default)]
    pub cursor_secret: String,

    #[serde(default = "default_binance_ws_base")]
    pub binance_ws_base: String,

    #[serde(default = "default_binance_rest_base")]
    pub binance_rest_base: String,

    #[serde(default = "default_feed_max_reconnects")]
    pub feed_max_reconnects: usize,

    #[serde(default = "default_replay_page_limit")]
    pub replay_page_limit: usize,

    #[serde(default = "default_replay_max_pages")]
    pub replay_max_pages: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            resolution_secs: default_resolution_secs(),
            gap_max_minutes: default_gap_max_minutes(),
            cadence_secs: default_cadence_secs(),
            session_ttl_secs: default_session_ttl_secs(),
            page_limit: default_page_limit(),
            ring_buffer_minutes: default_ring_buffer_minutes(),
            bind_addr: default_bind_addr(),
            bridge_mode: BridgeMode::default(),
            store_url: None,
            store_api_key: String::new(),
            store_table: default_store_table(),
            store_rewritable: false,
            store_timeout_secs: default_store_timeout_secs(),
            store_retry_attempts: default_retry_attempts(),
            auth_mode: AuthMode::default(),
            auth_url: None,
            auth_api_key: String::new(),
            auth_allow_sub: None,
            token: String::new(),
            cursor_secret: String::new(),
            binance_ws_base: default_binance_ws_base(),
            binance_rest_base: default_binance_rest_base(),
            feed_max_reconnects: default_feed_max_reconnects(),
            replay_page_limit: default_replay_page_limit(),
            replay_max_pages: default_replay_max_pages(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(path = %path.display(), symbol = %config.symbol, "config loaded");
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup. Empty values are ignored.
    pub fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        let get = |key: &str| var(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>>
        where
            T::Err: std::fmt::Display,
        {
            raw.map(|v| v.parse::<T>().map_err(|e| anyhow::anyhow!("{key}={v}: {e}")))
                .transpose()
        }

        if let Some(v) = get("BINANCE_SYMBOL") {
            self.symbol = v.to_lowercase();
        }
        if let Some(v) = parsed("BASE_CANDLE_SECONDS", get("BASE_CANDLE_SECONDS"))? {
            self.resolution_secs = v;
        }
        if let Some(v) = parsed("GAP_STREAM_MAX_MINUTES", get("GAP_STREAM_MAX_MINUTES"))? {
            self.gap_max_minutes = v;
        }
        if let Some(v) = parsed("GAP_STREAM_SLEEP_SECONDS", get("GAP_STREAM_SLEEP_SECONDS"))? {
            self.cadence_secs = v;
        }
        if let Some(v) = parsed("SESSION_TTL_SECONDS", get("SESSION_TTL_SECONDS"))? {
            self.session_ttl_secs = v;
        }
        if let Some(v) = parsed("BOOTSTRAP_PAGE_LIMIT", get("BOOTSTRAP_PAGE_LIMIT"))? {
            self.page_limit = v;
        }
        if let Some(v) = parsed("RING_BUFFER_MINUTES", get("RING_BUFFER_MINUTES"))? {
            self.ring_buffer_minutes = v;
        }
        if let Some(v) = get("CANDLE_BRIDGE_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = parsed::<BridgeMode>("CANDLE_BRIDGE_BRIDGE_MODE", get("CANDLE_BRIDGE_BRIDGE_MODE"))? {
            self.bridge_mode = v;
        }
        if let Some(v) = get("STORE_URL") {
            self.store_url = Some(v);
        }
        if let Some(v) = get("STORE_API_KEY") {
            self.store_api_key = v;
        }
        if let Some(v) = get("STORE_TABLE") {
            self.store_table = v;
        }
        if let Some(v) = get("STORE_REWRITABLE") {
            self.store_rewritable = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(v) = parsed::<AuthMode>("AUTH_MODE", get("AUTH_MODE"))? {
            self.auth_mode = v;
        }
        if let Some(v) = get("AUTH_URL") {
            self.auth_url = Some(v);
        }
        if let Some(v) = get("AUTH_API_KEY") {
            self.auth_api_key = v;
        }
        if let Some(v) = get("AUTH_ALLOW_SUB") {
            self.auth_allow_sub = Some(v);
        }
        if let Some(v) = get("CANDLE_BRIDGE_TOKEN") {
            self.token = v;
        }
        if let Some(v) = get("CURSOR_SECRET") {
            self.cursor_secret = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.resolution_secs <= 0 {
            anyhow::bail!("resolution_secs must be positive");
        }
        if self.page_limit == 0 {
            anyhow::bail!("page_limit must be positive");
        }
        if self.gap_max_minutes <= 0 {
            anyhow::bail!("gap_max_minutes must be positive");
        }
        if self.session_ttl_secs <= 0 {
            anyhow::bail!("session_ttl_secs must be positive");
        }
        if self.ring_buffer_minutes <= 0 {
            anyhow::bail!("ring_buffer_minutes must be positive");
        }
        if !(self.cadence_secs.is_finite() && self.cadence_secs > 0.0) {
            anyhow::bail!("cadence_secs must be a positive number");
        }
        if self.auth_mode == AuthMode::Remote && self.auth_url.is_none() {
            anyhow::bail!("AUTH_MODE=remote requires AUTH_URL");
        }
        if self.auth_mode == AuthMode::SharedSecret && self.token.is_empty() {
            warn!("CANDLE_BRIDGE_TOKEN is empty; every session start will be rejected");
        }
        Ok(())
    }

    pub fn cadence(&self) -> Duration {
        Duration::from_secs_f64(self.cadence_secs)
    }

    pub fn max_gap_secs(&self) -> i64 {
        self.gap_max_minutes * 60
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    /// Live candles kept in the recent ring, with a little slack.
    pub fn ring_capacity(&self) -> usize {
        (self.ring_buffer_minutes * 60 / self.resolution_secs.max(1)) as usize + 10
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn default_config_has_expected_values() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.symbol, "btcusdt");
        assert_eq!(cfg.resolution_secs, 15);
        assert_eq!(cfg.max_gap_secs(), 900);
        assert_eq!(cfg.cadence(), Duration::from_millis(1500));
        assert_eq!(cfg.session_ttl_secs, 1800);
        assert_eq!(cfg.page_limit, 5000);
        assert_eq!(cfg.ring_capacity(), 130);
        assert_eq!(cfg.bind_addr, "0.0.0.0:8000");
        assert_eq!(cfg.bridge_mode, BridgeMode::StorePoll);
        assert_eq!(cfg.auth_mode, AuthMode::SharedSecret);
        assert_eq!(cfg.store_table, "price_15s");
        assert!(!cfg.store_rewritable);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbol": "ethusdt", "bridge_mode": "trade_replay" }"#;
        let cfg: ServiceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbol, "ethusdt");
        assert_eq!(cfg.bridge_mode, BridgeMode::TradeReplay);
        assert_eq!(cfg.page_limit, 5000);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut cfg = ServiceConfig::default();
        cfg.apply_vars(vars(&[
            ("BINANCE_SYMBOL", "SOLUSDT"),
            ("BASE_CANDLE_SECONDS", "5"),
            ("GAP_STREAM_SLEEP_SECONDS", "0.5"),
            ("CANDLE_BRIDGE_BRIDGE_MODE", "replay"),
            ("STORE_URL", "https://db.example"),
            ("STORE_REWRITABLE", "true"),
            ("AUTH_MODE", "remote"),
            ("AUTH_URL", "https://auth.example"),
            ("BOOTSTRAP_PAGE_LIMIT", ""),
        ]))
        .unwrap();
        assert_eq!(cfg.symbol, "solusdt");
        assert_eq!(cfg.resolution_secs, 5);
        assert_eq!(cfg.cadence(), Duration::from_millis(500));
        assert_eq!(cfg.bridge_mode, BridgeMode::TradeReplay);
        assert_eq!(cfg.store_url.as_deref(), Some("https://db.example"));
        assert!(cfg.store_rewritable);
        assert_eq!(cfg.auth_mode, AuthMode::Remote);
        assert_eq!(cfg.page_limit, 5000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn unparsable_env_value_is_an_error() {
        let mut cfg = ServiceConfig::default();
        let err = cfg.apply_vars(vars(&[("SESSION_TTL_SECONDS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("SESSION_TTL_SECONDS"));
    }

    #[test]
    fn validate_rejects_zero_resolution_and_limit() {
        let mut cfg = ServiceConfig::default();
        cfg.resolution_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = ServiceConfig::default();
        cfg.page_limit = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn remote_auth_needs_url() {
        let mut cfg = ServiceConfig::default();
        cfg.auth_mode = AuthMode::Remote;
        assert!(cfg.validate().is_err());
    }
}
