pub mod bridge;
pub mod phase;
pub mod registry;
pub mod seam;
pub mod stream;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::auth::CredentialAuthority;
use crate::error::BridgeError;
use crate::history::HistoricalPaginator;

pub use bridge::{BridgeMode, GapBridge, StorePollBridge, TradeReplayBridge, TradeReplaySource};
pub use phase::{CloseReason, SessionPhase};
pub use registry::{run_reaper, Session, SessionInfo, SessionRegistry};
pub use seam::SeamGuard;
pub use stream::{run_session_stream, StreamContext, StreamMessage, StreamSettings, StreamWindow};

/// Open a session: validate the credential, pin the store's newest closed
/// bucket, and register the session in `BRIDGING`.
///
/// The whole operation is bounded by `timeout`; running out is reported as
/// `StoreUnavailable` since a collaborator did not answer.
pub async fn start_session(
    authority: &dyn CredentialAuthority,
    paginator: &HistoricalPaginator,
    registry: &SessionRegistry,
    credential: &str,
    from_ts: Option<i64>,
    timeout: Duration,
) -> Result<Arc<Session>, BridgeError> {
    let started = tokio::time::timeout(timeout, async {
        let subject = authority.validate(credential).await?;
        let last_known_ts = paginator.last_known_ts().await?;
        let session = registry.new_session(subject.id, credential, last_known_ts, from_ts);
        session.transition(SessionPhase::Bridging)?;
        Ok::<_, BridgeError>(session)
    })
    .await
    .map_err(|_| BridgeError::StoreUnavailable(format!("session start timed out after {}s", timeout.as_secs())))??;

    let session = registry.insert(started);
    info!(
        session_id = %session.id,
        subject = %session.subject,
        last_known_ts = session.last_known_ts,
        "session started"
    );
    Ok(session)
}
