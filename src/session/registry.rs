// =============================================================================
// Session Registry — live sessions, TTLs and the expiry reaper
// =============================================================================
//
// A session is created by `start`, handed to at most one gap stream, and
// destroyed by stop, TTL expiry, or its stream ending. Closing a session
// flips its shutdown signal, which every pending await of the owning stream
// observes, so cancellation is immediate even mid-sleep.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use super::phase::{CloseReason, SessionPhase};
use crate::auth::constant_time_eq;
use crate::clock::Clock;
use crate::error::BridgeError;

pub struct Session {
    pub id: String,
    pub subject: String,
    credential: String,
    pub created_at: i64,
    expires_at: AtomicI64,
    /// Newest closed bucket in the store when the session started.
    pub last_known_ts: Option<i64>,
    /// Caller-supplied start used when the store is empty.
    pub from_ts: Option<i64>,
    phase: Mutex<SessionPhase>,
    shutdown: watch::Sender<Option<CloseReason>>,
    stream_attached: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("subject", &self.subject)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at())
            .field("last_known_ts", &self.last_known_ts)
            .field("from_ts", &self.from_ts)
            .field("phase", &self.phase())
            .field("close_reason", &self.close_reason())
            .finish_non_exhaustive()
    }
}

/// Serializable view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub phase: SessionPhase,
    pub created_at: i64,
    pub expires_at: i64,
    pub last_known_ts: Option<i64>,
}

impl Session {
    pub fn new(
        subject: impl Into<String>,
        credential: impl Into<String>,
        now_secs: i64,
        ttl_secs: i64,
        last_known_ts: Option<i64>,
        from_ts: Option<i64>,
    ) -> Self {
        let (shutdown, _) = watch::channel(None);
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            subject: subject.into(),
            credential: credential.into(),
            created_at: now_secs,
            expires_at: AtomicI64::new(now_secs + ttl_secs),
            last_known_ts,
            from_ts,
            phase: Mutex::new(SessionPhase::Init),
            shutdown,
            stream_attached: AtomicBool::new(false),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    /// Checked phase transition. Closing goes through [`Session::close`].
    pub fn transition(&self, next: SessionPhase) -> Result<(), BridgeError> {
        let mut phase = self.phase.lock();
        let from = *phase;
        phase.transition_to(next)?;
        info!(session_id = %self.id, from = %from, to = %next, "session phase changed");
        Ok(())
    }

    /// Close the session. Returns `false` if it was already closed, in which
    /// case the first reason stands.
    pub fn close(&self, reason: CloseReason) -> bool {
        {
            let mut phase = self.phase.lock();
            if phase.transition_to(SessionPhase::Closed(reason)).is_err() {
                return false;
            }
        }
        self.shutdown.send_replace(Some(reason));
        info!(session_id = %self.id, reason = %reason, "session closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.phase().is_closed()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.shutdown.borrow()
    }

    /// Receiver that yields `Some(reason)` once the session closes.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<Option<CloseReason>> {
        self.shutdown.subscribe()
    }

    pub fn expires_at(&self) -> i64 {
        self.expires_at.load(Ordering::Relaxed)
    }

    pub fn is_expired(&self, now_secs: i64) -> bool {
        now_secs >= self.expires_at()
    }

    /// Extend the TTL from `now_secs`.
    pub fn touch(&self, now_secs: i64, ttl_secs: i64) {
        self.expires_at.fetch_max(now_secs + ttl_secs, Ordering::Relaxed);
    }

    /// Whether `credential` is the one the session was started with.
    pub fn credential_matches(&self, credential: &str) -> bool {
        constant_time_eq(credential.as_bytes(), self.credential.as_bytes())
    }

    /// Claim the single gap-stream slot.
    pub fn attach_stream(&self) -> Result<(), BridgeError> {
        self.stream_attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| BridgeError::StreamAttached)
    }

    pub fn detach_stream(&self) {
        self.stream_attached.store(false, Ordering::Release);
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            phase: self.phase(),
            created_at: self.created_at,
            expires_at: self.expires_at(),
            last_known_ts: self.last_known_ts,
        }
    }
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    clock: Arc<dyn Clock>,
    ttl_secs: i64,
}

impl SessionRegistry {
    pub fn new(clock: Arc<dyn Clock>, ttl_secs: i64) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            clock,
            ttl_secs,
        }
    }

    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Build a session in `INIT` stamped with the registry's clock and TTL.
    pub fn new_session(
        &self,
        subject: impl Into<String>,
        credential: impl Into<String>,
        last_known_ts: Option<i64>,
        from_ts: Option<i64>,
    ) -> Session {
        Session::new(
            subject,
            credential,
            self.clock.now_secs(),
            self.ttl_secs,
            last_known_ts,
            from_ts,
        )
    }

    pub fn insert(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        self.sessions.write().insert(session.id.clone(), session.clone());
        debug!(session_id = %session.id, active = self.len(), "session registered");
        session
    }

    /// Look up a live session. Expired or closed sessions are not found.
    pub fn get(&self, id: &str) -> Result<Arc<Session>, BridgeError> {
        let session = self
            .sessions
            .read()
            .get(id)
            .cloned()
            .ok_or(BridgeError::SessionNotFound)?;
        if session.is_closed() || session.is_expired(self.clock.now_secs()) {
            return Err(BridgeError::SessionNotFound);
        }
        Ok(session)
    }

    /// Extend a session's TTL on activity.
    pub fn touch(&self, session: &Session) {
        session.touch(self.clock.now_secs(), self.ttl_secs);
    }

    /// Stop and forget a session. Returns whether it existed.
    pub fn stop(&self, id: &str) -> bool {
        match self.sessions.write().remove(id) {
            Some(session) => {
                session.close(CloseReason::Stopped);
                true
            }
            None => false,
        }
    }

    /// Forget a session without changing its phase.
    pub fn remove(&self, id: &str) {
        self.sessions.write().remove(id);
    }

    /// Close and drop every session past its TTL. Returns how many went.
    pub fn reap_expired(&self) -> usize {
        let now = self.clock.now_secs();
        let expired: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| s.is_expired(now) || s.is_closed())
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &expired {
            session.close(CloseReason::Expired);
        }
        expired.len()
    }

    /// Stop every session, ending their streams. Used on shutdown.
    pub fn stop_all(&self) -> usize {
        let drained: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.close(CloseReason::Stopped);
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

/// Periodically reap expired sessions. Runs until the task is dropped.
pub async fn run_reaper(registry: Arc<SessionRegistry>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let reaped = registry.reap_expired();
        if reaped > 0 {
            info!(reaped, active = registry.len(), "expired sessions reaped");
        }
    }
}
