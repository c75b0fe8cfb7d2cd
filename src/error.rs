// =============================================================================
// Error Taxonomy — machine-readable reason codes for every surfaced failure
// =============================================================================
//
// `BridgeError` is what handlers and the stream engine return. Each variant
// owns a stable snake_case code that appears both in REST error bodies
// (`{"error": code, "message": text}`) and in the `closed`/`error` messages
// pushed on the gap stream.
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Failure surfaced to a client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("credential rejected: {0}")]
    Unauthorized(String),

    #[error("historical store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("gap of {span_secs}s exceeds the {max_secs}s bridge limit")]
    GapTooLarge { span_secs: i64, max_secs: i64 },

    #[error("live trade feed disconnected")]
    FeedDisconnected,

    #[error("invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("session not found or expired")]
    SessionNotFound,

    #[error("a gap stream is already attached to this session")]
    StreamAttached,

    #[error("invalid session transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl BridgeError {
    /// Stable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::GapTooLarge { .. } => "gap_too_large",
            Self::FeedDisconnected => "feed_disconnected",
            Self::InvalidCursor(_) => "invalid_cursor",
            Self::SessionNotFound => "session_not_found",
            Self::StreamAttached => "stream_attached",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::BadRequest(_) => "bad_request",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::GapTooLarge { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::FeedDisconnected => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidCursor(_) => StatusCode::BAD_REQUEST,
            Self::SessionNotFound => StatusCode::NOT_FOUND,
            Self::StreamAttached => StatusCode::CONFLICT,
            Self::InvalidTransition { .. } => StatusCode::CONFLICT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Transient failures are worth a bounded retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::FeedDisconnected)
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        });
        (self.status(), axum::Json(body)).into_response()
    }
}

/// Failure talking to the historical store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Network failure, timeout or 5xx. Retried.
    #[error("store unreachable: {0}")]
    Unavailable(String),

    /// The store refused the credentials.
    #[error("store rejected credentials ({0})")]
    Rejected(u16),

    /// The store answered with something that is not a candle row.
    #[error("malformed store response: {0}")]
    Malformed(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<StoreError> for BridgeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Rejected(status) => {
                BridgeError::Unauthorized(format!("store rejected credentials ({status})"))
            }
            other => BridgeError::StoreUnavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_snake_case_and_stable() {
        assert_eq!(BridgeError::Unauthorized("x".into()).code(), "unauthorized");
        assert_eq!(
            BridgeError::GapTooLarge { span_secs: 1000, max_secs: 900 }.code(),
            "gap_too_large"
        );
        assert_eq!(BridgeError::FeedDisconnected.code(), "feed_disconnected");
        assert_eq!(BridgeError::InvalidCursor("x".into()).code(), "invalid_cursor");
    }

    #[test]
    fn store_errors_map_into_taxonomy() {
        let e: BridgeError = StoreError::Rejected(401).into();
        assert_eq!(e.status(), StatusCode::UNAUTHORIZED);
        let e: BridgeError = StoreError::Unavailable("timeout".into()).into();
        assert_eq!(e.code(), "store_unavailable");
        assert!(e.is_transient());
        let e: BridgeError = StoreError::Malformed("ts".into()).into();
        assert_eq!(e.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn response_body_carries_code_and_message() {
        let resp = BridgeError::SessionNotFound.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let bytes = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"], "session_not_found");
        assert_eq!(json["message"], "session not found or expired");
    }
}
