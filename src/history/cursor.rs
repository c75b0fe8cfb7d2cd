// =============================================================================
// Page Cursor — opaque, signed, backward-only pagination token
// =============================================================================
//
// Wire form: `<base64url(json payload)>.<hex hmac-sha256(payload)>`.
// The payload pins the exclusive upper bound of the next page plus the lower
// bound the first page was requested with, so replaying a cursor always asks
// the store the same question.
// =============================================================================

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::BridgeError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    /// Exclusive upper bound: the next page holds `bucket_start < before`.
    #[serde(rename = "b")]
    pub before: i64,
    /// Inclusive lower bound carried over from the first request.
    #[serde(rename = "f", default, skip_serializing_if = "Option::is_none")]
    pub floor: Option<i64>,
    /// Issue time, epoch seconds.
    #[serde(rename = "i")]
    pub issued_at: i64,
}

/// Signs and verifies cursors.
pub struct CursorCodec {
    key: Vec<u8>,
    ttl_secs: i64,
}

impl CursorCodec {
    pub fn new(secret: impl AsRef<[u8]>, ttl_secs: i64) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
            ttl_secs,
        }
    }

    /// How long an issued cursor stays valid.
    pub fn ttl_secs(&self) -> i64 {
        self.ttl_secs
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key size")
    }

    pub fn encode(&self, cursor: &PageCursor) -> String {
        // Serializing three integers cannot fail.
        let json = serde_json::to_vec(cursor).unwrap_or_default();
        let payload = URL_SAFE_NO_PAD.encode(json);
        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        format!("{payload}.{sig}")
    }

    /// Verify and decode `token`. Rejects tampered tokens and tokens older
    /// than the TTL at `now_secs`.
    pub fn decode(&self, token: &str, now_secs: i64) -> Result<PageCursor, BridgeError> {
        let (payload, sig) = token
            .split_once('.')
            .ok_or_else(|| BridgeError::InvalidCursor("malformed token".into()))?;
        let sig = hex::decode(sig).map_err(|_| BridgeError::InvalidCursor("malformed signature".into()))?;

        let mut mac = self.mac();
        mac.update(payload.as_bytes());
        mac.verify_slice(&sig)
            .map_err(|_| BridgeError::InvalidCursor("signature mismatch".into()))?;

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| BridgeError::InvalidCursor("malformed payload".into()))?;
        let cursor: PageCursor = serde_json::from_slice(&json)
            .map_err(|_| BridgeError::InvalidCursor("malformed payload".into()))?;

        if now_secs - cursor.issued_at > self.ttl_secs {
            return Err(BridgeError::InvalidCursor("cursor expired".into()));
        }
        Ok(cursor)
    }
}
