// =============================================================================
// WebSocket Handler — the gap stream
// =============================================================================
//
// Clients connect to `/stream/gap?session_id=<id>[&from_ts=..][&to_ts=..]`.
// Everything that can be rejected is checked before the upgrade so failures
// come back as ordinary JSON errors:
//   - unknown, closed or expired session     404
//   - no resolvable start timestamp          400
//   - a stream already attached              409
//
// After the upgrade one task runs the session engine and this handler relays
// its messages as JSON text frames, answering pings along the way. A client
// that goes away closes the session; a stream that ends closes the socket.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::rest::parse_ts_param;
use crate::app_state::AppState;
use crate::error::BridgeError;
use crate::session::{run_session_stream, CloseReason, Session, StreamMessage, StreamWindow};

/// Messages buffered between the engine and a slow socket.
const OUTBOUND_BUFFER: usize = 256;

#[derive(Debug, Default, Deserialize)]
pub struct GapQuery {
    session_id: Option<String>,
    from_ts: Option<String>,
    to_ts: Option<String>,
}

/// Validate the request and claim the session's stream slot.
fn prepare_stream(state: &AppState, q: &GapQuery) -> Result<(Arc<Session>, StreamWindow), BridgeError> {
    let id = q
        .session_id
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BridgeError::BadRequest("session_id required".into()))?;
    let session = state.registry.get(id)?;
    let window = StreamWindow {
        from_ts: parse_ts_param("from_ts", q.from_ts.as_deref())?,
        to_ts: parse_ts_param("to_ts", q.to_ts.as_deref())?,
    };
    window.resolve_start(&session)?;
    Ok((session, window))
}

/// Axum handler for the gap stream upgrade request.
pub async fn gap_stream_handler(
    State(state): State<Arc<AppState>>,
    Query(q): Query<GapQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let (session, window) = match prepare_stream(&state, &q) {
        Ok(prepared) => prepared,
        Err(e) => {
            warn!(session_id = ?q.session_id, error = %e, "gap stream rejected");
            return e.into_response();
        }
    };
    let Some(ws) = ws else {
        return BridgeError::BadRequest("websocket upgrade required".into()).into_response();
    };
    if let Err(e) = session.attach_stream() {
        warn!(session_id = %session.id, "gap stream already attached");
        return e.into_response();
    }

    let opened = state.record_stream_opened();
    info!(session_id = %session.id, streams_opened = opened, "gap stream accepted, upgrading");
    ws.on_upgrade(move |socket| handle_gap_stream(socket, state, session, window))
        .into_response()
}

// =============================================================================
// Connection handler
// =============================================================================

async fn handle_gap_stream(socket: WebSocket, state: Arc<AppState>, session: Arc<Session>, window: StreamWindow) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<StreamMessage>(OUTBOUND_BUFFER);

    let ctx = state.stream.clone();
    let engine_session = session.clone();
    let engine = tokio::spawn(async move { run_session_stream(engine_session, &ctx, window, tx).await });

    loop {
        tokio::select! {
            // ── Engine → client ─────────────────────────────────────────
            msg = rx.recv() => {
                let Some(msg) = msg else {
                    // Engine finished; its closing messages were already relayed.
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize stream message");
                        continue;
                    }
                };
                if let Err(e) = sender.send(Message::Text(json)).await {
                    debug!(session_id = %session.id, error = %e, "WebSocket send failed, disconnecting");
                    session.close(CloseReason::ClientDisconnected);
                    break;
                }
            }

            // ── Client → server ─────────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            session.close(CloseReason::ClientDisconnected);
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(session_id = %session.id, "client closed gap stream");
                        session.close(CloseReason::ClientDisconnected);
                        break;
                    }
                    Some(Ok(_)) => {
                        state.registry.touch(&session);
                    }
                    Some(Err(e)) => {
                        warn!(session_id = %session.id, error = %e, "WebSocket receive error, disconnecting");
                        session.close(CloseReason::ClientDisconnected);
                        break;
                    }
                }
            }
        }
    }

    // The engine watches the session's shutdown signal, so this is prompt.
    drop(rx);
    let reason = match engine.await {
        Ok(reason) => reason,
        Err(e) => {
            warn!(session_id = %session.id, error = %e, "gap stream task failed");
            session.close(CloseReason::StoreUnavailable);
            CloseReason::StoreUnavailable
        }
    };
    session.detach_stream();
    state.registry.remove(&session.id);
    info!(session_id = %session.id, reason = %reason, "gap stream connection closed");
}

// =============================================================================
// Tests
// =============================================================================
