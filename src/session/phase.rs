// =============================================================================
// Session Phase — explicit lifecycle of one gap-stream session
// =============================================================================
//
//   INIT ──▶ BRIDGING ──▶ LIVE
//     │          │          │
//     └──────────┴──────────┴──▶ CLOSED(reason)
//
// CLOSED is terminal. Every transition goes through `transition_to`, which
// refuses anything not drawn above.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Stopped,
    Expired,
    ClientDisconnected,
    WindowComplete,
    GapTooLarge,
    StoreUnavailable,
    FeedDisconnected,
    Unauthorized,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Expired => "expired",
            Self::ClientDisconnected => "client_disconnected",
            Self::WindowComplete => "window_complete",
            Self::GapTooLarge => "gap_too_large",
            Self::StoreUnavailable => "store_unavailable",
            Self::FeedDisconnected => "feed_disconnected",
            Self::Unauthorized => "unauthorized",
        }
    }

    /// Whether this reason reports a failure rather than a normal end.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            Self::GapTooLarge | Self::StoreUnavailable | Self::FeedDisconnected | Self::Unauthorized
        )
    }

    /// Close reason for a failure surfaced while streaming, if it ends the session.
    pub fn from_error(err: &BridgeError) -> Option<Self> {
        match err {
            BridgeError::GapTooLarge { .. } => Some(Self::GapTooLarge),
            BridgeError::StoreUnavailable(_) => Some(Self::StoreUnavailable),
            BridgeError::FeedDisconnected => Some(Self::FeedDisconnected),
            BridgeError::Unauthorized(_) => Some(Self::Unauthorized),
            _ => None,
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "reason", rename_all = "snake_case")]
pub enum SessionPhase {
    Init,
    Bridging,
    Live,
    Closed(CloseReason),
}

impl SessionPhase {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }

    pub fn can_transition_to(&self, next: &SessionPhase) -> bool {
        matches!(
            (self, next),
            (Self::Init, Self::Bridging)
                | (Self::Bridging, Self::Live)
                | (Self::Init | Self::Bridging | Self::Live, Self::Closed(_))
        )
    }

    /// Move to `next`, or fail with `InvalidTransition` and stay put.
    pub fn transition_to(&mut self, next: SessionPhase) -> Result<(), BridgeError> {
        if !self.can_transition_to(&next) {
            return Err(BridgeError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "INIT"),
            Self::Bridging => write!(f, "BRIDGING"),
            Self::Live => write!(f, "LIVE"),
            Self::Closed(reason) => write!(f, "CLOSED({reason})"),
        }
    }
}
