// =============================================================================
// Credential Authority — who may open a session
// =============================================================================
//
// Identity issuance lives outside this service. An authority only answers
// "is this bearer credential valid, and for whom". Two are provided:
//
//   - `SharedSecretAuthority`: one static token (`CANDLE_BRIDGE_TOKEN`),
//     compared in constant time. Suitable for a single operator.
//   - `RemoteAuthority`: asks `GET {AUTH_URL}/auth/v1/user` with the bearer
//     and optionally pins the subject to an allow-listed id.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::error::BridgeError;

/// The identity behind an accepted credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub id: String,
}

#[async_trait]
pub trait CredentialAuthority: Send + Sync {
    /// Validate `credential`. Rejections are `Unauthorized`; an unreachable
    /// authority is `StoreUnavailable` so clients know to retry.
    async fn validate(&self, credential: &str) -> Result<Subject, BridgeError>;
}

// =============================================================================
// Constant-time comparison
// =============================================================================

/// Compare two byte slices in constant time. The comparison always examines
/// every byte even when a mismatch is found early.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        // The expected token length is not attacker-controlled.
        return false;
    }

    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
/// The scheme is matched case-insensitively; an empty token is rejected.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

// =============================================================================
// Shared secret
// =============================================================================

pub struct SharedSecretAuthority {
    secret: String,
}

impl SharedSecretAuthority {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }
}

#[async_trait]
impl CredentialAuthority for SharedSecretAuthority {
    async fn validate(&self, credential: &str) -> Result<Subject, BridgeError> {
        if self.secret.is_empty() {
            warn!("CANDLE_BRIDGE_TOKEN is not set, all authenticated requests will be rejected");
            return Err(BridgeError::Unauthorized("server authentication not configured".into()));
        }
        if !constant_time_eq(credential.as_bytes(), self.secret.as_bytes()) {
            warn!("invalid bearer token presented");
            return Err(BridgeError::Unauthorized("invalid bearer token".into()));
        }
        Ok(Subject {
            id: "operator".to_string(),
        })
    }
}

// =============================================================================
// Remote authority
// =============================================================================

pub struct RemoteAuthority {
    base_url: String,
    api_key: String,
    allow_sub: Option<String>,
    client: reqwest::Client,
}

impl RemoteAuthority {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        allow_sub: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build auth HTTP client: {e}"))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            allow_sub: allow_sub.filter(|s| !s.is_empty()),
            client,
        })
    }
}

#[async_trait]
impl CredentialAuthority for RemoteAuthority {
    async fn validate(&self, credential: &str) -> Result<Subject, BridgeError> {
        let url = format!("{}/auth/v1/user", self.base_url);
        let resp = self
            .client
            .get(&url)
            .header("apikey", &self.api_key)
            .bearer_auth(credential)
            .send()
            .await
            .map_err(|e| BridgeError::StoreUnavailable(format!("auth authority unreachable: {e}")))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BridgeError::Unauthorized("credential rejected by authority".into()));
        }
        if !status.is_success() {
            return Err(BridgeError::StoreUnavailable(format!("auth authority returned {status}")));
        }

        let payload: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| BridgeError::StoreUnavailable(format!("malformed auth response: {e}")))?;
        let subject = subject_of(&payload)
            .ok_or_else(|| BridgeError::Unauthorized("authority returned no subject".into()))?;

        if let Some(allowed) = &self.allow_sub {
            if &subject != allowed {
                warn!(subject = %subject, "subject not in allow-list");
                return Err(BridgeError::Unauthorized("subject not allowed".into()));
            }
        }
        debug!(subject = %subject, "credential validated");
        Ok(Subject { id: subject })
    }
}

/// User payloads carry the subject as `sub` (JWT claims) or `id` (user record).
fn subject_of(payload: &serde_json::Value) -> Option<String> {
    payload["sub"]
        .as_str()
        .or_else(|| payload["id"].as_str())
        .map(str::to_string)
}

// =============================================================================
// Tests
// =============================================================================
