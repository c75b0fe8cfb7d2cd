// =============================================================================
// Historical Paginator — backward cursor paging over closed candles
// =============================================================================
//
// Pages run newest → oldest. A page for cursor C holds the `limit` newest
// candles strictly older than C's bound, so consecutive pages partition the
// series with `max(older page) < min(newer page)` and no overlap.
//
// The first page (no cursor) is capped at the caller's ceiling, normally the
// session's `last_known_ts`, so bootstrap and the gap stream meet at exactly
// one bucket boundary.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::cursor::{CursorCodec, PageCursor};
use super::{with_store_retry, HistoricalStore, RangeQuery};
use crate::clock::Clock;
use crate::error::BridgeError;
use crate::market_data::Candle;

/// Upper bound on pinned pages kept for a rewritable store.
const MAX_PINNED_PAGES: usize = 4096;

/// Pins are keyed by cursor token and effective page size.
type PinKey = (String, usize);

struct Pinned {
    page: Page,
    /// Issue time of the cursor the page was served for.
    issued_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub cursor: Option<String>,
    pub limit: Option<usize>,
    /// Inclusive lower bound, epoch seconds.
    pub from_ts: Option<i64>,
    /// Inclusive upper bound, epoch seconds. Ignored when a cursor is given.
    pub to_ts: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// Newest first.
    pub items: Vec<Candle>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

#[derive(Debug, Clone)]
pub struct PaginatorConfig {
    pub max_page_size: usize,
    pub retry_attempts: usize,
    pub call_timeout: Duration,
    /// When set, the first read of a cursor is pinned and replayed on retry,
    /// since a rewritable store may answer the same question differently.
    pub rewritable: bool,
}

impl Default for PaginatorConfig {
    fn default() -> Self {
        Self {
            max_page_size: 5000,
            retry_attempts: 3,
            call_timeout: Duration::from_secs(20),
            rewritable: false,
        }
    }
}

pub struct HistoricalPaginator {
    store: Arc<dyn HistoricalStore>,
    codec: CursorCodec,
    clock: Arc<dyn Clock>,
    config: PaginatorConfig,
    pinned: Mutex<HashMap<PinKey, Pinned>>,
}

impl HistoricalPaginator {
    pub fn new(
        store: Arc<dyn HistoricalStore>,
        codec: CursorCodec,
        clock: Arc<dyn Clock>,
        config: PaginatorConfig,
    ) -> Self {
        Self {
            store,
            codec,
            clock,
            config,
            pinned: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn HistoricalStore> {
        &self.store
    }

    pub fn max_page_size(&self) -> usize {
        self.config.max_page_size
    }

    /// Bucket start of the newest closed candle in the store.
    pub async fn last_known_ts(&self) -> Result<Option<i64>, BridgeError> {
        let store = self.store.clone();
        let ts = with_store_retry(
            "latest_closed",
            self.config.retry_attempts,
            self.config.call_timeout,
            || {
                let store = store.clone();
                async move { store.latest_closed().await }
            },
        )
        .await?;
        Ok(ts)
    }

    /// Serve one page. `ceiling` caps the first page's upper bound.
    pub async fn page(&self, request: &PageRequest, ceiling: Option<i64>) -> Result<Page, BridgeError> {
        let limit = request
            .limit
            .unwrap_or(self.config.max_page_size)
            .clamp(1, self.config.max_page_size.max(1));

        let mut issued_at = None;
        let query = match &request.cursor {
            Some(token) => {
                let cursor = self.codec.decode(token, self.clock.now_secs())?;
                if self.config.rewritable {
                    if let Some(pinned) = self.pinned.lock().get(&(token.clone(), limit)) {
                        debug!(before = cursor.before, limit, "replaying pinned page");
                        return Ok(pinned.page.clone());
                    }
                }
                issued_at = Some(cursor.issued_at);
                RangeQuery {
                    before: Some(cursor.before),
                    from: cursor.floor,
                    to: None,
                    limit: limit + 1,
                }
            }
            None => RangeQuery {
                before: None,
                from: request.from_ts,
                to: match (request.to_ts, ceiling) {
                    (Some(t), Some(c)) => Some(t.min(c)),
                    (t, c) => t.or(c),
                },
                limit: limit + 1,
            },
        };

        if let (Some(from), Some(to)) = (query.from, query.to) {
            if from > to {
                return Err(BridgeError::BadRequest(format!("from_ts {from} is after to_ts {to}")));
            }
        }

        let store = self.store.clone();
        let mut rows = with_store_retry(
            "query",
            self.config.retry_attempts,
            self.config.call_timeout,
            || {
                let store = store.clone();
                async move { store.query(&query).await }
            },
        )
        .await?;

        // Stores promise newest-first; enforce it so the partition holds even
        // if one misbehaves.
        rows.retain(|c| query.contains(c.bucket_start));
        rows.sort_by(|a, b| b.bucket_start.cmp(&a.bucket_start));
        rows.dedup_by_key(|c| c.bucket_start);

        let has_more = rows.len() > limit;
        rows.truncate(limit);

        let next_cursor = if has_more {
            rows.last().map(|oldest| {
                self.codec.encode(&PageCursor {
                    before: oldest.bucket_start,
                    floor: query.from,
                    issued_at: self.clock.now_secs(),
                })
            })
        } else {
            None
        };

        let page = Page {
            items: rows,
            next_cursor,
            has_more,
        };

        info!(
            items = page.items.len(),
            has_more = page.has_more,
            newest = page.items.first().map(|c| c.bucket_start),
            oldest = page.items.last().map(|c| c.bucket_start),
            "bootstrap page served"
        );

        if self.config.rewritable {
            if let (Some(token), Some(issued_at)) = (&request.cursor, issued_at) {
                self.pin((token.clone(), limit), &page, issued_at);
            }
        }

        Ok(page)
    }

    /// Remember the page served for a cursor. Pins die with their cursor;
    /// when the cache is full of live pins the new page is served unpinned
    /// rather than evicting a pin a client may still retry.
    fn pin(&self, key: PinKey, page: &Page, issued_at: i64) {
        let now = self.clock.now_secs();
        let ttl = self.codec.ttl_secs();
        let mut pinned = self.pinned.lock();
        if pinned.len() >= MAX_PINNED_PAGES {
            pinned.retain(|_, p| now - p.issued_at <= ttl);
        }
        if pinned.len() >= MAX_PINNED_PAGES {
            warn!(pinned = pinned.len(), "pinned page cache full, serving page unpinned");
            return;
        }
        pinned.insert(
            key,
            Pinned {
                page: page.clone(),
                issued_at,
            },
        );
    }

    #[cfg(test)]
    fn pinned_len(&self) -> usize {
        self.pinned.lock().len()
    }
}

// =============================================================================
// Tests
// =============================================================================
