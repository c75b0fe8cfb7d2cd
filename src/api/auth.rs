// =============================================================================
// Bearer Token Authentication — Axum extractors
// =============================================================================
//
// `AuthBearer` validates `Authorization: Bearer <token>` through the
// configured credential authority and short-circuits with the domain error
// response (401 `unauthorized`, or 503 when the authority is unreachable).
//
//   async fn handler(AuthBearer { subject, token }: AuthBearer, ...) { ... }
//
// `MaybeBearer` only extracts the token, for endpoints that also accept a
// session id and decide themselves which credential applies.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use tracing::warn;

use crate::app_state::AppState;
use crate::auth::{bearer_token, Subject};
use crate::error::BridgeError;

pub struct AuthBearer {
    pub subject: Subject,
    pub token: String,
}

/// The bearer token, if a well-formed one was sent. Never rejects.
pub struct MaybeBearer(pub Option<String>);

fn header_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .map(str::to_string)
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthBearer {
    type Rejection = BridgeError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let Some(token) = header_token(parts) else {
            warn!("missing or malformed Authorization header");
            return Err(BridgeError::Unauthorized("missing bearer token".into()));
        };
        let subject = state.authority.validate(&token).await?;
        Ok(AuthBearer { subject, token })
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for MaybeBearer {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(MaybeBearer(header_token(parts)))
    }
}

// =============================================================================
// Tests
// =============================================================================
