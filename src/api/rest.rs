// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
//   GET  /healthz            public health snapshot
//   POST /session/start      bearer; opens a session pinned at the store head
//   POST /session/stop       ends a session and its stream
//   GET  /bootstrap          session or bearer; one page of history
//   GET  /stream/gap         WebSocket gap stream (see `ws`)
//   GET  /api/v1/chart       bearer; recent candles resampled with overlays
//
// Timestamps in query strings and bodies accept RFC3339 or epoch seconds.
// CORS is permissive; viewers are served from other origins.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::{AuthBearer, MaybeBearer};
use crate::app_state::AppState;
use crate::chart::{parse_timeframe, resample};
use crate::clock::{format_timestamp, parse_timestamp};
use crate::error::BridgeError;
use crate::history::{Page, PageRequest};
use crate::indicators::{ema_series, sma_series};
use crate::market_data::{bucket_of, CandleStatus};
use crate::session::start_session;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/healthz", get(health))
        .route("/session/stop", post(session_stop))
        // ── Session / bearer ────────────────────────────────────────
        .route("/session/start", post(session_start))
        .route("/bootstrap", get(bootstrap))
        .route("/stream/gap", get(crate::api::ws::gap_stream_handler))
        .route("/api/v1/chart", get(chart))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

/// Parse an optional timestamp parameter. Blank counts as absent.
pub(crate) fn parse_ts_param(name: &str, raw: Option<&str>) -> Result<Option<i64>, BridgeError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => parse_timestamp(s)
            .map(Some)
            .ok_or_else(|| BridgeError::BadRequest(format!("{name}: invalid timestamp '{s}'"))),
    }
}

// =============================================================================
// Health (public)
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health())
}

// =============================================================================
// Session start / stop
// =============================================================================

#[derive(Debug, Serialize)]
struct StartResponse {
    session_id: String,
    last_known_ts: Option<i64>,
    last_known_iso: Option<String>,
    expires_at: i64,
    stream_url: String,
    bootstrap_url: String,
    page_limit: usize,
    gap_max_minutes: i64,
    resolution_seconds: i64,
}

/// Body is optional: `{ "from_ts": "2024-01-01T00:00:00Z" }` or epoch seconds.
fn body_from_ts(body: Option<Json<serde_json::Value>>) -> Result<Option<i64>, BridgeError> {
    let Some(Json(body)) = body else {
        return Ok(None);
    };
    match body.get("from_ts") {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| BridgeError::BadRequest("from_ts: expected integer seconds".into())),
        Some(serde_json::Value::String(s)) => parse_ts_param("from_ts", Some(s.as_str())),
        Some(_) => Err(BridgeError::BadRequest("from_ts: expected string or integer".into())),
    }
}

async fn session_start(
    auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    body: Option<Json<serde_json::Value>>,
) -> Result<Json<StartResponse>, BridgeError> {
    let from_ts = body_from_ts(body)?;
    let session = start_session(
        state.authority.as_ref(),
        &state.paginator,
        &state.registry,
        &auth.token,
        from_ts,
        state.config.store_timeout(),
    )
    .await?;

    let start = session.last_known_ts.or(session.from_ts);
    let stream_url = match start {
        Some(ts) => format!("/stream/gap?session_id={}&from_ts={}", session.id, ts),
        None => format!("/stream/gap?session_id={}", session.id),
    };
    Ok(Json(StartResponse {
        bootstrap_url: format!("/bootstrap?session_id={}&limit={}", session.id, state.config.page_limit),
        session_id: session.id.clone(),
        last_known_ts: session.last_known_ts,
        last_known_iso: session.last_known_ts.map(format_timestamp),
        expires_at: session.expires_at(),
        stream_url,
        page_limit: state.config.page_limit,
        gap_max_minutes: state.config.gap_max_minutes,
        resolution_seconds: state.config.resolution_secs,
    }))
}

#[derive(Debug, Deserialize)]
struct StopQuery {
    session_id: String,
}

async fn session_stop(State(state): State<Arc<AppState>>, Query(q): Query<StopQuery>) -> impl IntoResponse {
    let stopped = state.registry.stop(&q.session_id);
    info!(session_id = %q.session_id, stopped, "session stop requested");
    Json(serde_json::json!({ "stopped": stopped }))
}

// =============================================================================
// Bootstrap (session or bearer)
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct BootstrapQuery {
    session_id: Option<String>,
    cursor: Option<String>,
    limit: Option<usize>,
    from_ts: Option<String>,
    to_ts: Option<String>,
}

async fn bootstrap(
    State(state): State<Arc<AppState>>,
    MaybeBearer(token): MaybeBearer,
    Query(q): Query<BootstrapQuery>,
) -> Result<Json<Page>, BridgeError> {
    let ceiling = match (q.session_id.as_deref().filter(|s| !s.is_empty()), token.as_deref()) {
        (Some(id), token) => {
            let session = state.registry.get(id)?;
            if let Some(token) = token {
                if !session.credential_matches(token) {
                    warn!(session_id = %id, "bootstrap bearer does not match session");
                    return Err(BridgeError::Unauthorized("token does not match session".into()));
                }
            }
            state.registry.touch(&session);
            // History at or before the pinned head; the gap stream owns the rest.
            session.last_known_ts.or(session.from_ts)
        }
        (None, Some(token)) => {
            state.authority.validate(token).await?;
            None
        }
        (None, None) => return Err(BridgeError::Unauthorized("session_id or bearer token required".into())),
    };

    let request = PageRequest {
        cursor: q.cursor.filter(|c| !c.is_empty()),
        limit: q.limit,
        from_ts: parse_ts_param("from_ts", q.from_ts.as_deref())?,
        to_ts: parse_ts_param("to_ts", q.to_ts.as_deref())?,
    };
    let page = state.paginator.page(&request, ceiling).await?;
    Ok(Json(page))
}

// =============================================================================
// Chart (bearer)
// =============================================================================

const DEFAULT_CHART_BARS: usize = 200;

#[derive(Debug, Default, Deserialize)]
struct ChartQuery {
    timeframe: Option<String>,
    sma: Option<usize>,
    ema: Option<usize>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ChartBar {
    ts: String,
    bucket_start: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    status: CandleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    sma: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ema: Option<f64>,
}

#[derive(Debug, Serialize)]
struct ChartResponse {
    symbol: String,
    timeframe_seconds: i64,
    bars: Vec<ChartBar>,
}

async fn chart(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(q): Query<ChartQuery>,
) -> Result<Json<ChartResponse>, BridgeError> {
    let res = state.config.resolution_secs;
    let timeframe = match q.timeframe.as_deref() {
        None => res,
        Some(label) => parse_timeframe(label)
            .ok_or_else(|| BridgeError::BadRequest(format!("unknown timeframe '{label}'")))?,
    };
    if timeframe % res != 0 {
        return Err(BridgeError::BadRequest(format!(
            "timeframe must be a multiple of {res}s, got {timeframe}s"
        )));
    }

    let buffer = state.hub.buffer();
    let mut base = buffer.closed(usize::MAX);
    let provisional = buffer.provisional();
    base.extend(provisional);

    let bars = resample(&base, timeframe);
    let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
    let sma = q.sma.filter(|p| *p > 0).map(|p| sma_series(&closes, p));
    let ema = q.ema.filter(|p| *p > 0).map(|p| ema_series(&closes, p));
    let open_bucket = provisional.map(|c| bucket_of(c.bucket_start, timeframe));

    let limit = q.limit.unwrap_or(DEFAULT_CHART_BARS).max(1);
    let skip = bars.len().saturating_sub(limit);
    let out = bars
        .iter()
        .enumerate()
        .skip(skip)
        .map(|(i, b)| ChartBar {
            ts: format_timestamp(b.bucket_start),
            bucket_start: b.bucket_start,
            open: b.open,
            high: b.high,
            low: b.low,
            close: b.close,
            volume: b.volume,
            status: if Some(b.bucket_start) == open_bucket {
                CandleStatus::Provisional
            } else {
                CandleStatus::Final
            },
            sma: sma.as_ref().and_then(|s| s[i]),
            ema: ema.as_ref().and_then(|s| s[i]),
        })
        .collect();

    Ok(Json(ChartResponse {
        symbol: state.config.symbol.to_uppercase(),
        timeframe_seconds: timeframe,
        bars: out,
    }))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::tests::{test_state, TOKEN};
    use crate::history::InMemoryStore;
    use crate::market_data::{Candle, CandleUpdate};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    const NOW: i64 = 1_700_000_100;

    fn candle(bucket: i64, close: f64) -> Candle {
        Candle {
            bucket_start: bucket,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 2.0,
        }
    }

    fn store_with(n: i64) -> Arc<InMemoryStore> {
        // n closed candles ending one bucket before NOW's bucket.
        let last = bucket_of(NOW, 15) - 15;
        Arc::new(InMemoryStore::with_candles((0..n).map(|i| candle(last - 15 * i, 100.0 + i as f64))))
    }

    async fn call(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap() };
        (status, body)
    }

    fn get(uri: &str, token: Option<&str>) -> Request<Body> {
        let mut req = Request::get(uri);
        if let Some(t) = token {
            req = req.header("authorization", format!("Bearer {t}"));
        }
        req.body(Body::empty()).unwrap()
    }

    fn post(uri: &str, token: Option<&str>, body: Option<&str>) -> Request<Body> {
        let mut req = Request::post(uri);
        if let Some(t) = token {
            req = req.header("authorization", format!("Bearer {t}"));
        }
        match body {
            Some(b) => req.header("content-type", "application/json").body(Body::from(b.to_string())),
            None => req.body(Body::empty()),
        }
        .unwrap()
    }

    async fn start(state: &Arc<AppState>) -> Value {
        let (status, body) = call(router(state.clone()), post("/session/start", Some(TOKEN), None)).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body
    }

    #[tokio::test]
    async fn healthz_is_public() {
        let (state, _) = test_state(store_with(0), NOW);
        let (status, body) = call(router(state), get("/healthz", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["feed"]["state"], "connecting");
        assert_eq!(body["active_sessions"], 0);
    }

    #[tokio::test]
    async fn start_requires_bearer() {
        let (state, _) = test_state(store_with(3), NOW);
        let (status, body) = call(router(state.clone()), post("/session/start", None, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");

        let (status, _) = call(router(state.clone()), post("/session/start", Some("wrong"), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn start_returns_urls_and_limits() {
        let (state, _) = test_state(store_with(3), NOW);
        let body = start(&state).await;
        let id = body["session_id"].as_str().unwrap();
        let last = bucket_of(NOW, 15) - 15;

        assert_eq!(id.len(), 32);
        assert_eq!(body["last_known_ts"], last);
        assert_eq!(body["last_known_iso"], format_timestamp(last));
        assert_eq!(body["stream_url"], format!("/stream/gap?session_id={id}&from_ts={last}"));
        assert_eq!(body["bootstrap_url"], format!("/bootstrap?session_id={id}&limit=5000"));
        assert_eq!(body["page_limit"], 5000);
        assert_eq!(body["gap_max_minutes"], 15);
        assert_eq!(body["resolution_seconds"], 15);
    }

    #[tokio::test]
    async fn start_accepts_from_ts_for_empty_store() {
        let (state, _) = test_state(store_with(0), NOW);
        let (status, body) = call(
            router(state.clone()),
            post("/session/start", Some(TOKEN), Some(r#"{"from_ts":"2023-11-14T22:00:00Z"}"#)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["last_known_ts"].is_null());
        assert!(body["stream_url"].as_str().unwrap().ends_with("from_ts=1699999200"));

        let (status, body) = call(
            router(state),
            post("/session/start", Some(TOKEN), Some(r#"{"from_ts":"yesterday"}"#)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");
    }

    #[tokio::test]
    async fn stop_ends_the_session() {
        let (state, _) = test_state(store_with(1), NOW);
        let id = start(&state).await["session_id"].as_str().unwrap().to_string();

        let (_, body) = call(router(state.clone()), post(&format!("/session/stop?session_id={id}"), None, None)).await;
        assert_eq!(body["stopped"], true);
        let (_, body) = call(router(state.clone()), post(&format!("/session/stop?session_id={id}"), None, None)).await;
        assert_eq!(body["stopped"], false);

        let (status, body) = call(router(state), get(&format!("/bootstrap?session_id={id}"), None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "session_not_found");
    }

    #[tokio::test]
    async fn bootstrap_by_session_pages_to_the_end() {
        let (state, _) = test_state(store_with(25), NOW);
        let id = start(&state).await["session_id"].as_str().unwrap().to_string();

        let mut uri = format!("/bootstrap?session_id={id}&limit=10");
        let mut seen = Vec::new();
        loop {
            let (status, body) = call(router(state.clone()), get(&uri, None)).await;
            assert_eq!(status, StatusCode::OK, "{body}");
            seen.extend(body["items"].as_array().unwrap().iter().map(|c| c["bucket_start"].as_i64().unwrap()));
            if !body["has_more"].as_bool().unwrap() {
                assert!(body["next_cursor"].is_null());
                break;
            }
            let cursor = body["next_cursor"].as_str().unwrap();
            uri = format!("/bootstrap?session_id={id}&limit=10&cursor={cursor}");
        }
        assert_eq!(seen.len(), 25);
        assert!(seen.windows(2).all(|w| w[0] > w[1]));
    }

    #[tokio::test]
    async fn bootstrap_auth_rules() {
        let (state, _) = test_state(store_with(5), NOW);
        let id = start(&state).await["session_id"].as_str().unwrap().to_string();

        // Neither credential.
        let (status, _) = call(router(state.clone()), get("/bootstrap", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // Bearer only.
        let (status, body) = call(router(state.clone()), get("/bootstrap?limit=2", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["items"].as_array().unwrap().len(), 2);
        assert_eq!(body["has_more"], true);

        // Session plus a bearer that is not the session's.
        let (status, _) = call(router(state.clone()), get(&format!("/bootstrap?session_id={id}"), Some("other"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        // Unknown session.
        let (status, _) = call(router(state), get("/bootstrap?session_id=nope", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bootstrap_rejects_tampered_cursor() {
        let (state, _) = test_state(store_with(5), NOW);
        let (status, body) = call(router(state), get("/bootstrap?cursor=abc.def", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_cursor");
    }

    #[tokio::test]
    async fn chart_resamples_ring_with_overlays() {
        let (state, _) = test_state(store_with(0), NOW);
        let buffer = state.hub.buffer();
        // Eight closed 15s buckets from 22:14:00, then an open one.
        let base = bucket_of(NOW, 60) - 60;
        for i in 0..8 {
            buffer.update(CandleUpdate::finalized(candle(base + 15 * i, 10.0 + i as f64)));
        }
        buffer.update(CandleUpdate::provisional(candle(base + 120, 30.0)));

        let (status, body) = call(router(state), get("/api/v1/chart?timeframe=1m&sma=2&limit=2", Some(TOKEN))).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["timeframe_seconds"], 60);
        let bars = body["bars"].as_array().unwrap();
        assert_eq!(bars.len(), 2);

        assert_eq!(bars[0]["bucket_start"], base + 60);
        assert_eq!(bars[0]["open"], 14.0);
        assert_eq!(bars[0]["close"], 17.0);
        assert_eq!(bars[0]["volume"], 8.0);
        assert_eq!(bars[0]["status"], "final");
        assert_eq!(bars[0]["sma"], 15.0);

        assert_eq!(bars[1]["bucket_start"], base + 120);
        assert_eq!(bars[1]["status"], "provisional");
        assert_eq!(bars[1]["sma"], 23.5);
    }

    #[tokio::test]
    async fn chart_rejects_bad_timeframes() {
        let (state, _) = test_state(store_with(0), NOW);
        for tf in ["fortnight", "20s"] {
            let (status, body) =
                call(router(state.clone()), get(&format!("/api/v1/chart?timeframe={tf}"), Some(TOKEN))).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{tf}");
            assert_eq!(body["error"], "bad_request");
        }
        let (status, _) = call(router(state), get("/api/v1/chart", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn timestamp_params() {
        assert_eq!(parse_ts_param("x", None).unwrap(), None);
        assert_eq!(parse_ts_param("x", Some(" ")).unwrap(), None);
        assert_eq!(parse_ts_param("x", Some("1700000000")).unwrap(), Some(1_700_000_000));
        assert_eq!(parse_ts_param("x", Some("2023-11-14T22:13:20Z")).unwrap(), Some(1_700_000_000));
        assert!(parse_ts_param("x", Some("soon")).is_err());
    }
}
