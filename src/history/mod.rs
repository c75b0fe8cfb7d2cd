// =============================================================================
// Historical Store — read-only access to closed candles
// =============================================================================
//
// The store is an external collaborator that holds finalized candles at the
// base resolution. It is only ever read here; the write path belongs to the
// ingestion pipeline. Stores answer newest-first so a backward pager can ask
// for "the next `limit` rows older than X" in one call.
// =============================================================================

pub mod cursor;
pub mod memory;
pub mod paginator;
pub mod postgrest;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use tracing::warn;

use crate::error::StoreError;
use crate::market_data::Candle;

pub use cursor::{CursorCodec, PageCursor};
pub use memory::InMemoryStore;
pub use paginator::{HistoricalPaginator, Page, PageRequest, PaginatorConfig};
pub use postgrest::PostgrestStore;

/// Bounds of a store read. All timestamps are bucket starts in epoch seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RangeQuery {
    /// Exclusive upper bound (`bucket_start < before`).
    pub before: Option<i64>,
    /// Inclusive lower bound.
    pub from: Option<i64>,
    /// Inclusive upper bound.
    pub to: Option<i64>,
    pub limit: usize,
}

impl RangeQuery {
    pub fn contains(&self, bucket_start: i64) -> bool {
        self.before.map_or(true, |b| bucket_start < b)
            && self.from.map_or(true, |f| bucket_start >= f)
            && self.to.map_or(true, |t| bucket_start <= t)
    }
}

#[async_trait]
pub trait HistoricalStore: Send + Sync {
    /// Bucket start of the newest closed candle, `None` for an empty store.
    async fn latest_closed(&self) -> Result<Option<i64>, StoreError>;

    /// Candles within `query`, newest first, at most `query.limit` rows.
    async fn query(&self, query: &RangeQuery) -> Result<Vec<Candle>, StoreError>;
}

/// Store retry delays: 200ms → 400ms → … capped at 2s, jittered.
pub fn store_backoff(max_attempts: usize) -> impl Iterator<Item = Duration> {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(200))
        .with_max_delay(Duration::from_secs(2))
        .with_jitter()
        .with_max_times(max_attempts)
        .build()
}

/// Run a store call under a per-attempt timeout, retrying transient failures
/// with [`store_backoff`]. Credential rejections are returned immediately.
pub async fn with_store_retry<T, F, Fut>(
    op: &'static str,
    max_attempts: usize,
    call_timeout: Duration,
    mut call: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut delays = store_backoff(max_attempts);
    let mut attempt = 0usize;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable(format!(
                "{op} timed out after {}ms",
                call_timeout.as_millis()
            ))),
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() => match delays.next() {
                Some(delay) => {
                    warn!(op, attempt, error = %e, delay_ms = delay.as_millis() as u64, "store call failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(op, attempt, error = %e, "store call failed, retries exhausted");
                    return Err(e);
                }
            },
            Err(e) => return Err(e),
        }
    }
}
