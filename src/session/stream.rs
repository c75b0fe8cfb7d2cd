// =============================================================================
// Gap Stream — drives one session from BRIDGING through LIVE to CLOSED
// =============================================================================
//
// Emission contract toward the client, per session:
//   - every bucket after the start bucket is emitted as `final` exactly once,
//     in strictly increasing order, with no holes;
//   - `provisional` updates only ever concern the bucket after the newest
//     final, and never repeat an identical candle;
//   - nothing is sent after the `closed` message.
//
// Cancellation: every await in this module races the session's shutdown
// signal and the client channel closing, so stop, expiry and disconnect take
// effect immediately, including during bridge polls and sleeps.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use super::bridge::GapBridge;
use super::phase::{CloseReason, SessionPhase};
use super::registry::{Session, SessionRegistry};
use super::seam::SeamGuard;
use crate::clock::{format_timestamp, Clock};
use crate::error::BridgeError;
use crate::market_data::{bucket_of, Candle, CandleUpdate, FeedStatus, LiveHub};

/// Consecutive failed bridge polls, each already retried by the bridge,
/// after which the session closes.
const BRIDGE_FAILURE_LIMIT: u32 = 3;

/// One message on the gap stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamMessage {
    Candle {
        #[serde(flatten)]
        update: CandleUpdate,
        /// `bucket_start` as RFC3339.
        ts: String,
    },
    Keepalive {
        server_time: i64,
    },
    Closed {
        reason: CloseReason,
    },
    Error {
        code: String,
        message: String,
    },
}

impl StreamMessage {
    pub fn candle(update: CandleUpdate) -> Self {
        Self::Candle {
            ts: format_timestamp(update.candle.bucket_start),
            update,
        }
    }

    pub fn error(err: &BridgeError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub resolution_secs: i64,
    /// Largest gap, in seconds, the bridge will attempt to close.
    pub max_gap_secs: i64,
    /// Bridge poll interval and live provisional push cadence.
    pub cadence: Duration,
}

/// Shared collaborators every session stream needs.
pub struct StreamContext {
    pub hub: Arc<LiveHub>,
    pub bridge: Arc<dyn GapBridge>,
    pub registry: Arc<SessionRegistry>,
    pub clock: Arc<dyn Clock>,
    pub settings: StreamSettings,
}

/// Requested bounds of one stream, epoch seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamWindow {
    pub from_ts: Option<i64>,
    pub to_ts: Option<i64>,
}

impl StreamWindow {
    /// The timestamp the stream continues after: the explicit `from_ts`,
    /// else the store's newest bucket, else the session's fallback start.
    pub fn resolve_start(&self, session: &Session) -> Result<i64, BridgeError> {
        self.from_ts
            .or(session.last_known_ts)
            .or(session.from_ts)
            .ok_or_else(|| BridgeError::BadRequest("from_ts required when the store has no history".into()))
    }
}

/// Why the engine stopped, plus the failure to report, if any.
struct Halt {
    reason: CloseReason,
    error: Option<BridgeError>,
}

impl Halt {
    fn with(reason: CloseReason) -> Self {
        Self { reason, error: None }
    }

    fn failed(err: BridgeError) -> Self {
        let reason = CloseReason::from_error(&err).unwrap_or(CloseReason::StoreUnavailable);
        Self {
            reason,
            error: Some(err),
        }
    }
}

type Step<T = ()> = Result<T, Halt>;

struct Engine<'a> {
    session: &'a Session,
    ctx: &'a StreamContext,
    out: &'a mpsc::Sender<StreamMessage>,
    shutdown: watch::Receiver<Option<CloseReason>>,
    seam: SeamGuard,
    end_bucket: Option<i64>,
    emitted_since_tick: bool,
    bridge_failures: u32,
}

/// Run the gap stream for `session` until it closes, sending messages to
/// `out`. Always ends by closing the session and, if the client is still
/// there, sending `closed`. Returns the close reason.
pub async fn run_session_stream(
    session: Arc<Session>,
    ctx: &StreamContext,
    window: StreamWindow,
    out: mpsc::Sender<StreamMessage>,
) -> CloseReason {
    // Subscribe before anything is read so no finalized candle slips between
    // the bridge and the live stream.
    let finalized = ctx.hub.subscribe_finalized();
    let res = ctx.settings.resolution_secs;

    let (halt, duplicates) = match window.resolve_start(&session) {
        Err(e) => (Halt::failed(e), 0),
        Ok(start) => {
            let start_bucket = bucket_of(start, res);
            let mut engine = Engine {
                session: &session,
                ctx,
                out: &out,
                shutdown: session.subscribe_shutdown(),
                seam: SeamGuard::new(res, start_bucket),
                end_bucket: window.to_ts.map(|t| bucket_of(t, res)),
                emitted_since_tick: false,
                bridge_failures: 0,
            };
            info!(
                session_id = %session.id,
                start_bucket,
                end_bucket = engine.end_bucket,
                bridge = ctx.bridge.name(),
                "gap stream started"
            );
            let halt = match engine.run(finalized).await {
                Ok(()) => Halt::with(CloseReason::WindowComplete),
                Err(halt) => halt,
            };
            (halt, engine.seam.duplicates())
        }
    };

    // A reason already recorded by stop/expiry wins over the engine's view.
    let closed_now = session.close(halt.reason);
    let reason = session.close_reason().unwrap_or(halt.reason);

    if closed_now {
        if let Some(err) = &halt.error {
            warn!(session_id = %session.id, error = %err, "gap stream failed");
            let _ = out.send(StreamMessage::error(err)).await;
        }
    }
    if reason != CloseReason::ClientDisconnected {
        let _ = out.send(StreamMessage::Closed { reason }).await;
    }
    info!(session_id = %session.id, reason = %reason, duplicates, "gap stream ended");
    reason
}

impl Engine<'_> {
    async fn run(&mut self, mut finalized: broadcast::Receiver<Candle>) -> Step {
        self.check_shutdown()?;
        if matches!(self.end_bucket, Some(end) if end <= self.seam.last_bucket()) {
            return Err(Halt::with(CloseReason::WindowComplete));
        }
        self.bridge().await?;
        self.session.transition(SessionPhase::Live).map_err(Halt::failed)?;
        self.live(&mut finalized).await
    }

    fn check_shutdown(&self) -> Step {
        match *self.shutdown.borrow() {
            Some(reason) => Err(Halt::with(reason)),
            None => Ok(()),
        }
    }

    async fn send(&mut self, msg: StreamMessage) -> Step {
        self.out
            .send(msg)
            .await
            .map_err(|_| Halt::with(CloseReason::ClientDisconnected))
    }

    /// Push a final candle through the seam. Completes the window when the
    /// end bucket has been emitted.
    async fn emit_final(&mut self, candle: Candle) -> Step {
        for c in self.seam.admit_final(candle) {
            if matches!(self.end_bucket, Some(end) if c.bucket_start > end) {
                return Err(Halt::with(CloseReason::WindowComplete));
            }
            self.send(StreamMessage::candle(CandleUpdate::finalized(c))).await?;
            self.emitted_since_tick = true;
            if self.end_bucket == Some(c.bucket_start) {
                return Err(Halt::with(CloseReason::WindowComplete));
            }
        }
        Ok(())
    }

    async fn emit_provisional(&mut self, candle: Candle) -> Step {
        if matches!(self.end_bucket, Some(end) if candle.bucket_start > end) {
            return Ok(());
        }
        if let Some(c) = self.seam.admit_provisional(candle) {
            self.send(StreamMessage::candle(CandleUpdate::provisional(c))).await?;
            self.emitted_since_tick = true;
        }
        Ok(())
    }

    async fn keepalive(&mut self) -> Step {
        let server_time = self.ctx.clock.now_secs();
        self.send(StreamMessage::Keepalive { server_time }).await
    }

    /// Wait `delay`, or stop early on shutdown or client disconnect.
    async fn pause(&mut self, delay: Duration) -> Step {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.shutdown.changed() => {
                Err(Halt::with(self.shutdown.borrow().unwrap_or(CloseReason::Stopped)))
            }
            _ = self.out.closed() => Err(Halt::with(CloseReason::ClientDisconnected)),
        }
    }

    fn gap_check(&self, now: i64) -> Step {
        let span = now - self.seam.next_needed();
        if span > self.ctx.settings.max_gap_secs {
            return Err(Halt::failed(BridgeError::GapTooLarge {
                span_secs: span,
                max_secs: self.ctx.settings.max_gap_secs,
            }));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // BRIDGING
    // -------------------------------------------------------------------------

    /// Poll the bridge until live aggregation is authoritative for the next
    /// needed bucket. Also used from LIVE when the live side loses coverage.
    async fn bridge(&mut self) -> Step {
        loop {
            let now = self.ctx.clock.now_secs();
            let next = self.seam.next_needed();
            if self.ctx.hub.covers(next) {
                debug!(session_id = %self.session.id, next, "bridge caught up");
                return Ok(());
            }
            if self.session.phase() == SessionPhase::Live && self.ctx.hub.feed_status() == FeedStatus::Exhausted {
                return Err(Halt::failed(BridgeError::FeedDisconnected));
            }
            self.gap_check(now)?;

            let before = self.seam.last_bucket();
            let fetched = tokio::select! {
                r = self.ctx.bridge.fetch_closed(before, now) => r,
                _ = self.shutdown.changed() => {
                    return Err(Halt::with(self.shutdown.borrow().unwrap_or(CloseReason::Stopped)));
                }
                _ = self.out.closed() => return Err(Halt::with(CloseReason::ClientDisconnected)),
            };

            match fetched {
                Ok(candles) => {
                    self.bridge_failures = 0;
                    for c in candles {
                        self.emit_final(c).await?;
                    }
                }
                Err(e) if e.is_transient() && self.bridge_failures + 1 < BRIDGE_FAILURE_LIMIT => {
                    self.bridge_failures += 1;
                    warn!(
                        session_id = %self.session.id,
                        error = %e,
                        failures = self.bridge_failures,
                        "bridge fetch failed, will retry"
                    );
                    self.send(StreamMessage::error(&e)).await?;
                }
                Err(e) => return Err(Halt::failed(e)),
            }

            if self.seam.last_bucket() > before {
                self.ctx.registry.touch(self.session);
                continue;
            }
            if !std::mem::take(&mut self.emitted_since_tick) {
                self.keepalive().await?;
            }
            self.pause(self.ctx.settings.cadence).await?;
        }
    }

    // -------------------------------------------------------------------------
    // LIVE
    // -------------------------------------------------------------------------

    async fn live(&mut self, finalized: &mut broadcast::Receiver<Candle>) -> Step {
        let hub = self.ctx.hub.clone();
        let mut feed = hub.watch_feed_status();
        if *feed.borrow_and_update() == FeedStatus::Exhausted {
            return Err(Halt::failed(BridgeError::FeedDisconnected));
        }

        self.catch_up().await?;

        let mut push = tokio::time::interval(self.ctx.settings.cadence);
        push.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.changed() => {
                    return Err(Halt::with(self.shutdown.borrow().unwrap_or(CloseReason::Stopped)));
                }
                _ = self.out.closed() => return Err(Halt::with(CloseReason::ClientDisconnected)),
                changed = feed.changed() => {
                    if changed.is_err() || *feed.borrow_and_update() == FeedStatus::Exhausted {
                        return Err(Halt::failed(BridgeError::FeedDisconnected));
                    }
                }
                msg = finalized.recv() => match msg {
                    Ok(candle) if hub.covers(self.seam.next_needed()) => self.emit_final(candle).await?,
                    Ok(candle) => {
                        warn!(
                            session_id = %self.session.id,
                            bucket = candle.bucket_start,
                            "live candle incomplete, bridging"
                        );
                        self.catch_up().await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(session_id = %self.session.id, skipped, "live stream lagged, re-reading ring");
                        self.catch_up().await?;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(Halt::failed(BridgeError::FeedDisconnected));
                    }
                },
                _ = push.tick() => {
                    if let Some(p) = hub.provisional() {
                        // Finals for earlier buckets may still be in flight on
                        // the broadcast; the ring already has them.
                        if p.bucket_start > self.seam.next_needed() {
                            self.catch_up().await?;
                        }
                        self.emit_provisional(p).await?;
                    }
                    if !std::mem::take(&mut self.emitted_since_tick) {
                        self.keepalive().await?;
                    }
                    self.ctx.registry.touch(self.session);
                }
            }
        }
    }

    /// Emit every ring candle newer than the seam. When the ring no longer
    /// reaches back to the seam (a lag rotated it, or a reconnect left
    /// incomplete buckets), bridge the hole first.
    async fn catch_up(&mut self) -> Step {
        if !self.ctx.hub.covers(self.seam.next_needed()) {
            self.bridge().await?;
        }
        let pending = self.ctx.hub.buffer().closed_after(self.seam.last_bucket());
        for c in pending {
            self.emit_final(c).await?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
