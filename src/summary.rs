//! Windowed aggregation over recorded payments, with a short-lived cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::error::StoreError;
use crate::storage::{Keyspace, Store};
use crate::telemetry::metric_inc;
use crate::types::{PaymentRecord, Summary};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    pub cache_ttl_ms: u64,
    /// Entries allowed before eviction kicks in.
    pub cache_capacity: usize,
    /// Entries kept (most recently computed) after eviction.
    pub cache_retain: usize,
    pub scan_page_size: usize,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 3_000,
            cache_capacity: 50,
            cache_retain: 20,
            scan_page_size: 1_000,
        }
    }
}

/// Cache key: the exact window bounds in epoch milliseconds.
type Window = (i64, i64);

struct CachedSummary {
    summary: Summary,
    computed_at: Instant,
}

/// Summaries keyed by exact window, valid for a fixed TTL.
pub struct SummaryCache {
    entries: Mutex<HashMap<Window, CachedSummary>>,
    ttl: Duration,
    capacity: usize,
    retain: usize,
}

impl SummaryCache {
    pub fn new(ttl: Duration, capacity: usize, retain: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            capacity,
            retain: retain.min(capacity),
        }
    }

    pub fn get(&self, window: Window) -> Option<Summary> {
        let entries = self.lock();
        let cached = entries.get(&window)?;
        (cached.computed_at.elapsed() < self.ttl).then_some(cached.summary)
    }

    pub fn insert(&self, window: Window, summary: Summary) {
        let mut entries = self.lock();
        entries.insert(
            window,
            CachedSummary {
                summary,
                computed_at: Instant::now(),
            },
        );

        if entries.len() > self.capacity {
            let mut by_age: Vec<(Window, Instant)> =
                entries.iter().map(|(k, v)| (*k, v.computed_at)).collect();
            by_age.sort_by(|a, b| b.1.cmp(&a.1));
            for (stale, _) in by_age.into_iter().skip(self.retain) {
                entries.remove(&stale);
            }
        }
    }

    pub fn invalidate(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Window, CachedSummary>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Computes `{count, amount}` over records whose `requestedAt` lies in
/// `[from, to]`.
pub struct SummaryEngine {
    store: Arc<dyn Store>,
    keys: Keyspace,
    cache: SummaryCache,
    page_size: usize,
}

impl SummaryEngine {
    pub fn new(store: Arc<dyn Store>, keys: Keyspace, config: &SummaryConfig) -> Self {
        Self {
            store,
            keys,
            cache: SummaryCache::new(
                Duration::from_millis(config.cache_ttl_ms),
                config.cache_capacity,
                config.cache_retain,
            ),
            page_size: config.scan_page_size.max(1),
        }
    }

    pub fn cache(&self) -> &SummaryCache {
        &self.cache
    }

    /// Like [`try_summarize`](Self::try_summarize), but a store failure
    /// yields an all-zero summary. Zero is then indistinguishable from an
    /// empty window; the failure is only visible in the logs.
    pub async fn summarize(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Summary {
        match self.try_summarize(from, to).await {
            Ok(summary) => summary,
            Err(err) => {
                error!(error = %err, "summary scan failed, returning zero");
                Summary::default()
            }
        }
    }

    /// Missing `from` is the epoch, missing `to` is now. Failed scans are
    /// not cached.
    pub async fn try_summarize(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Summary, StoreError> {
        let from = from.unwrap_or(DateTime::UNIX_EPOCH);
        let to = to.unwrap_or_else(Utc::now);
        let window = (from.timestamp_millis(), to.timestamp_millis());

        if let Some(hit) = self.cache.get(window) {
            metric_inc("relay.summary.cache_hit");
            return Ok(hit);
        }

        let summary = self.scan(from, to).await?;
        self.cache.insert(window, summary);
        Ok(summary)
    }

    async fn scan(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Summary, StoreError> {
        let pattern = self.keys.record_pattern();
        let mut summary = Summary::default();
        let mut cursor = 0;
        let mut skipped = 0usize;

        loop {
            let (next, keys) = self.store.scan(cursor, &pattern, self.page_size).await?;
            if !keys.is_empty() {
                for raw in self.store.batch_get(&keys).await?.into_iter().flatten() {
                    let Some(record) = PaymentRecord::parse(&raw) else {
                        skipped += 1;
                        continue;
                    };
                    if record.requested_at >= from && record.requested_at <= to {
                        summary.total_count += 1;
                        summary.total_amount = summary.total_amount.saturating_add(record.amount);
                    }
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(
            count = summary.total_count,
            amount = %summary.total_amount,
            skipped,
            "summary computed"
        );
        Ok(summary)
    }
}
