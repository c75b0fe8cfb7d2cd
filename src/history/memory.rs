use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{HistoricalStore, RangeQuery};
use crate::error::StoreError;
use crate::market_data::Candle;

// ---------------------------------------------------------------------------
// InMemoryStore -- process-local store for development and tests
// ---------------------------------------------------------------------------

/// A candle store held in memory, keyed by `bucket_start`.
///
/// Used when no remote store is configured, and as the store collaborator in
/// tests. `fail_next` injects transient failures.
#[derive(Default)]
pub struct InMemoryStore {
    rows: RwLock<BTreeMap<i64, Candle>>,
    failures: AtomicUsize,
    queries: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_candles(candles: impl IntoIterator<Item = Candle>) -> Self {
        let store = Self::new();
        store.extend(candles);
        store
    }

    /// Insert or overwrite one candle.
    pub fn insert(&self, candle: Candle) {
        self.rows.write().insert(candle.bucket_start, candle);
    }

    pub fn extend(&self, candles: impl IntoIterator<Item = Candle>) {
        let mut rows = self.rows.write();
        for c in candles {
            rows.insert(c.bucket_start, c);
        }
    }

    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Make the next `n` calls fail with `StoreError::Unavailable`.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Number of `query` calls served so far, failed ones included.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> Result<(), StoreError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(StoreError::Unavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl HistoricalStore for InMemoryStore {
    async fn latest_closed(&self) -> Result<Option<i64>, StoreError> {
        self.take_failure()?;
        Ok(self.rows.read().keys().next_back().copied())
    }

    async fn query(&self, query: &RangeQuery) -> Result<Vec<Candle>, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;
        Ok(self
            .rows
            .read()
            .values()
            .rev()
            .filter(|c| query.contains(c.bucket_start))
            .take(query.limit)
            .copied()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn query_is_newest_first_and_bounded() {
        let store = InMemoryStore::with_candles((0..10).map(|i| Candle::carry_forward(i * 15, 1.0)));
        let rows = store
            .query(&RangeQuery {
                before: Some(120),
                from: Some(30),
                to: None,
                limit: 3,
            })
            .await
            .unwrap();
        let buckets: Vec<i64> = rows.iter().map(|c| c.bucket_start).collect();
        assert_eq!(buckets, vec![105, 90, 75]);
        assert_eq!(store.latest_closed().await.unwrap(), Some(135));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = InMemoryStore::new();
        store.fail_next(1);
        assert!(store.latest_closed().await.is_err());
        assert_eq!(store.latest_closed().await.unwrap(), None);
    }
}
