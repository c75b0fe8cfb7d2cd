// =============================================================================
// Central Application State — candle bridge service
// =============================================================================
//
// Ties the collaborators together for the HTTP and WebSocket handlers. Every
// subsystem manages its own interior mutability (registry behind a
// parking_lot lock, live hub on tokio channels), so the state itself is
// immutable after construction and shared as `Arc<AppState>`.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::auth::CredentialAuthority;
use crate::binance::{RateLimitSnapshot, RateLimitTracker};
use crate::clock::{format_timestamp, Clock};
use crate::config::ServiceConfig;
use crate::history::{CursorCodec, HistoricalPaginator, HistoricalStore, PaginatorConfig};
use crate::market_data::{FeedStatus, LiveHub};
use crate::session::{GapBridge, SessionRegistry, StreamContext, StreamSettings};

/// Public health snapshot served by `/healthz`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub time: String,
    pub feed: FeedStatus,
    pub active_sessions: usize,
    pub streams_opened: u64,
    pub dropped_trades: u64,
    pub bridge: &'static str,
    pub uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_weight: Option<RateLimitSnapshot>,
}

pub struct AppState {
    // ── Configuration ───────────────────────────────────────────────────
    pub config: ServiceConfig,
    pub clock: Arc<dyn Clock>,

    // ── Collaborators ───────────────────────────────────────────────────
    pub authority: Arc<dyn CredentialAuthority>,
    pub paginator: Arc<HistoricalPaginator>,

    // ── Sessions & streaming ────────────────────────────────────────────
    pub registry: Arc<SessionRegistry>,
    pub hub: Arc<LiveHub>,
    pub stream: Arc<StreamContext>,

    /// Present when trade replay talks to the exchange.
    pub rate_limit: Option<Arc<RateLimitTracker>>,

    /// Gap streams opened since start.
    pub streams_opened: AtomicU64,

    /// Instant when the service was started. Used for uptime calculations.
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Wire the shared state. A missing cursor secret is replaced by a random
    /// per-process one, which invalidates cursors across restarts.
    pub fn new(
        config: ServiceConfig,
        clock: Arc<dyn Clock>,
        authority: Arc<dyn CredentialAuthority>,
        store: Arc<dyn HistoricalStore>,
        bridge: Arc<dyn GapBridge>,
        hub: Arc<LiveHub>,
    ) -> Self {
        let secret = if config.cursor_secret.is_empty() {
            warn!("CURSOR_SECRET is not set, cursors will not survive a restart");
            format!("{}{}", uuid::Uuid::new_v4().simple(), uuid::Uuid::new_v4().simple())
        } else {
            config.cursor_secret.clone()
        };

        let paginator = Arc::new(HistoricalPaginator::new(
            store,
            CursorCodec::new(secret, config.session_ttl_secs),
            clock.clone(),
            PaginatorConfig {
                max_page_size: config.page_limit,
                retry_attempts: config.store_retry_attempts,
                call_timeout: config.store_timeout(),
                rewritable: config.store_rewritable,
            },
        ));
        let registry = Arc::new(SessionRegistry::new(clock.clone(), config.session_ttl_secs));
        let stream = Arc::new(StreamContext {
            hub: hub.clone(),
            bridge,
            registry: registry.clone(),
            clock: clock.clone(),
            settings: StreamSettings {
                resolution_secs: config.resolution_secs,
                max_gap_secs: config.max_gap_secs(),
                cadence: config.cadence(),
            },
        });

        Self {
            config,
            clock,
            authority,
            paginator,
            registry,
            hub,
            stream,
            rate_limit: None,
            streams_opened: AtomicU64::new(0),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn with_rate_limit(mut self, tracker: Arc<RateLimitTracker>) -> Self {
        self.rate_limit = Some(tracker);
        self
    }

    pub fn record_stream_opened(&self) -> u64 {
        self.streams_opened.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn health(&self) -> HealthSnapshot {
        let feed = self.hub.feed_status();
        HealthSnapshot {
            status: if matches!(feed, FeedStatus::Exhausted) { "degraded" } else { "ok" },
            time: format_timestamp(self.clock.now_secs()),
            feed,
            active_sessions: self.registry.len(),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            dropped_trades: self.hub.dropped_trades(),
            bridge: self.stream.bridge.name(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            exchange_weight: self.rate_limit.as_ref().map(|t| t.snapshot()),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::auth::SharedSecretAuthority;
    use crate::clock::ManualClock;
    use crate::history::InMemoryStore;
    use crate::session::StorePollBridge;
    use std::time::Duration;

    pub(crate) const TOKEN: &str = "test-token";

    /// A fully wired state over an in-memory store and a manual clock.
    pub(crate) fn test_state(store: Arc<InMemoryStore>, now_secs: i64) -> (Arc<AppState>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_secs(now_secs));
        let mut config = ServiceConfig::default();
        config.token = TOKEN.to_string();
        config.cursor_secret = "cursor-key".to_string();
        config.store_retry_attempts = 1;
        config.store_timeout_secs = 1;
        config.cadence_secs = 0.05;

        let hub = Arc::new(LiveHub::new(config.resolution_secs, config.ring_capacity()));
        let bridge = Arc::new(StorePollBridge::new(
            store.clone(),
            config.resolution_secs,
            1,
            Duration::from_secs(1),
        ));
        let state = AppState::new(
            config,
            clock.clone(),
            Arc::new(SharedSecretAuthority::new(TOKEN)),
            store,
            bridge,
            hub,
        );
        (Arc::new(state), clock)
    }

    #[test]
    fn health_reports_feed_and_sessions() {
        let (state, _clock) = test_state(Arc::new(InMemoryStore::new()), 1_700_000_000);
        let h = state.health();
        assert_eq!(h.status, "ok");
        assert_eq!(h.time, "2023-11-14T22:13:20Z");
        assert_eq!(h.active_sessions, 0);
        assert_eq!(h.bridge, "store_poll");
        assert!(h.exchange_weight.is_none());

        state.hub.feed_status_sender().send_replace(FeedStatus::Exhausted);
        assert_eq!(state.health().status, "degraded");
    }

    #[test]
    fn stream_counter_increments() {
        let (state, _clock) = test_state(Arc::new(InMemoryStore::new()), 0);
        assert_eq!(state.record_stream_opened(), 1);
        assert_eq!(state.record_stream_opened(), 2);
    }
}
