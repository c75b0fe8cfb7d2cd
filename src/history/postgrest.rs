// =============================================================================
// PostgREST Store — closed candles from a `price_15s`-style REST table
// =============================================================================
//
// Reads `GET {url}/rest/v1/{table}` with PostgREST filter syntax. Each row is
// `{ts, open, high, low, close, volume}`; `ts` is the bucket start as an
// ISO-8601 timestamp, numeric columns may arrive as JSON numbers or strings
// (`numeric` columns are rendered as strings by default).
//
// SECURITY: the API key is never logged.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{debug, instrument, warn};

use super::{HistoricalStore, RangeQuery};
use crate::clock::{format_timestamp, parse_timestamp};
use crate::error::StoreError;
use crate::market_data::Candle;

const SELECT_COLUMNS: &str = "ts,open,high,low,close,volume";

#[derive(Clone)]
pub struct PostgrestStore {
    base_url: String,
    table: String,
    api_key: String,
    client: reqwest::Client,
}

impl PostgrestStore {
    pub fn new(
        base_url: impl Into<String>,
        table: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build store HTTP client: {e}"))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        let table = table.into();
        debug!(base_url = %base_url, table = %table, "PostgrestStore initialised");

        Ok(Self {
            base_url,
            table,
            api_key: api_key.into(),
            client,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }

    async fn fetch_rows(&self, params: &[(String, String)]) -> Result<Vec<serde_json::Value>, StoreError> {
        let resp = self
            .client
            .get(self.endpoint())
            .query(params)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(StoreError::Rejected(status.as_u16()));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %truncate(&body, 200), "store returned an error");
            return Err(StoreError::Unavailable(format!("store returned {status}")));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| StoreError::Malformed(e.to_string()))?;
        match body {
            serde_json::Value::Array(rows) => Ok(rows),
            other => Err(StoreError::Malformed(format!("expected array, got {other}"))),
        }
    }
}

#[async_trait]
impl HistoricalStore for PostgrestStore {
    #[instrument(skip(self), name = "store::latest_closed")]
    async fn latest_closed(&self) -> Result<Option<i64>, StoreError> {
        let params = vec![
            ("select".to_string(), "ts".to_string()),
            ("order".to_string(), "ts.desc".to_string()),
            ("limit".to_string(), "1".to_string()),
        ];
        let rows = self.fetch_rows(&params).await?;
        match rows.first() {
            None => Ok(None),
            Some(row) => row["ts"]
                .as_str()
                .and_then(parse_timestamp)
                .map(Some)
                .ok_or_else(|| StoreError::Malformed(format!("bad ts in {row}"))),
        }
    }

    #[instrument(skip(self), name = "store::query")]
    async fn query(&self, query: &RangeQuery) -> Result<Vec<Candle>, StoreError> {
        let rows = self.fetch_rows(&query_params(query)).await?;
        let mut candles = Vec::with_capacity(rows.len());
        for row in &rows {
            match parse_row(row) {
                Some(c) => candles.push(c),
                None => warn!(row = %row, "skipping malformed store row"),
            }
        }
        debug!(count = candles.len(), "store page fetched");
        Ok(candles)
    }
}

/// PostgREST query string for a range read. Repeated `ts` keys AND together.
pub fn query_params(query: &RangeQuery) -> Vec<(String, String)> {
    let mut params = vec![
        ("select".to_string(), SELECT_COLUMNS.to_string()),
        ("order".to_string(), "ts.desc".to_string()),
        ("limit".to_string(), query.limit.to_string()),
    ];
    if let Some(before) = query.before {
        params.push(("ts".to_string(), format!("lt.{}", format_timestamp(before))));
    }
    if let Some(from) = query.from {
        params.push(("ts".to_string(), format!("gte.{}", format_timestamp(from))));
    }
    if let Some(to) = query.to {
        params.push(("ts".to_string(), format!("lte.{}", format_timestamp(to))));
    }
    params
}

/// Parse one store row. Missing OHLC columns make the row unusable; a missing
/// volume reads as zero.
pub fn parse_row(row: &serde_json::Value) -> Option<Candle> {
    let bucket_start = row["ts"].as_str().and_then(parse_timestamp)?;
    Some(Candle {
        bucket_start,
        open: number(&row["open"])?,
        high: number(&row["high"])?,
        low: number(&row["low"])?,
        close: number(&row["close"])?,
        volume: number(&row["volume"]).unwrap_or(0.0),
    })
}

fn number(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn row_with_string_numerics_parses() {
        let row = json!({
            "ts": "2023-11-14T22:13:15+00:00",
            "open": "37000.5", "high": 37010.0, "low": "36990", "close": 37005.25, "volume": "1.5"
        });
        let c = parse_row(&row).unwrap();
        assert_eq!(c.bucket_start, 1_699_999_995);
        assert_eq!(c.open, 37_000.5);
        assert_eq!(c.low, 36_990.0);
        assert_eq!(c.volume, 1.5);
    }

    #[test]
    fn row_without_close_is_rejected() {
        let row = json!({"ts": "2023-11-14T22:13:15Z", "open": 1, "high": 1, "low": 1});
        assert!(parse_row(&row).is_none());
        let row = json!({"ts": null, "open": 1, "high": 1, "low": 1, "close": 1});
        assert!(parse_row(&row).is_none());
    }

    #[test]
    fn null_volume_reads_as_zero() {
        let row = json!({"ts": "2023-11-14T22:13:15Z", "open": 1, "high": 1, "low": 1, "close": 1, "volume": null});
        assert_eq!(parse_row(&row).unwrap().volume, 0.0);
    }

    #[test]
    fn range_filters_become_repeated_ts_params() {
        let params = query_params(&RangeQuery {
            before: Some(1_700_000_000),
            from: Some(1_699_999_100),
            to: None,
            limit: 5001,
        });
        let ts: Vec<&str> = params
            .iter()
            .filter(|(k, _)| k == "ts")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(ts, vec!["lt.2023-11-14T22:13:20Z", "gte.2023-11-14T21:58:20Z"]);
        assert!(params.contains(&("limit".to_string(), "5001".to_string())));
        assert!(params.contains(&("order".to_string(), "ts.desc".to_string())));
    }
}
