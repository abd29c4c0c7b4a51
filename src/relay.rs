use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::dispatcher::{CycleReport, Dispatcher, DispatcherHandle};
use crate::error::{RelayError, StoreError};
use crate::queue::QueueManager;
use crate::retry::RetryScheduler;
use crate::settings::RelayConfig;
use crate::storage::{Keyspace, Store};
use crate::summary::SummaryEngine;
use crate::types::{JobId, PaymentPayload, PermanentFailureRecord, QueueStats, Summary};
use crate::worker::Forwarder;

/// The relay instance: one per process, shared behind an `Arc` by the
/// request-facing layer and the dispatch loop.
pub struct PaymentRelay {
    queue: Arc<QueueManager>,
    scheduler: Arc<RetryScheduler>,
    dispatcher: Arc<Dispatcher>,
    summary: SummaryEngine,
    page_size: usize,
    running: Mutex<Option<DispatcherHandle>>,
}

impl PaymentRelay {
    pub fn new(store: Arc<dyn Store>, forwarder: Arc<dyn Forwarder>, config: &RelayConfig) -> Self {
        let keys = Keyspace::new(config.key_prefix.clone());
        let queue = Arc::new(QueueManager::new(
            store.clone(),
            keys.clone(),
            config.retry.max_attempts,
        ));
        let scheduler = Arc::new(RetryScheduler::new(
            store.clone(),
            keys.clone(),
            config.retry.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            scheduler.clone(),
            forwarder,
            config.dispatcher.clone(),
        ));

        Self {
            queue,
            scheduler,
            dispatcher,
            summary: SummaryEngine::new(store, keys, &config.summary),
            page_size: config.summary.scan_page_size.max(1),
            running: Mutex::new(None),
        }
    }

    /// Validate and queue a payment. Delivery happens asynchronously.
    pub async fn submit(&self, payment: Value) -> Result<JobId, RelayError> {
        let payload = PaymentPayload::from_value(payment)?;
        Ok(self.queue.enqueue(payload).await?)
    }

    /// Zero on store failure; see [`try_summary`](Self::try_summary).
    pub async fn summary(&self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Summary {
        self.summary.summarize(from, to).await
    }

    pub async fn try_summary(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Summary, RelayError> {
        Ok(self.summary.try_summarize(from, to).await?)
    }

    /// Drop queued work and recorded payments.
    ///
    /// Calls already in flight are not cancelled. Permanent failure records
    /// are kept.
    pub async fn purge(&self) -> Result<(), RelayError> {
        let result = self.purge_state().await;
        self.summary.cache().invalidate();
        result?;
        info!("relay state purged");
        Ok(())
    }

    async fn purge_state(&self) -> Result<(), StoreError> {
        self.queue.purge().await?;
        let removed = self
            .queue
            .store()
            .delete_matching(&self.queue.keys().record_pattern(), self.page_size)
            .await?;
        info!(records = removed, "payment records deleted");
        Ok(())
    }

    pub async fn stats(&self) -> Result<QueueStats, RelayError> {
        Ok(self.queue.stats().await?)
    }

    /// Make every non-terminal retry-queue job eligible now.
    pub async fn retry_failed_jobs(&self) -> Result<usize, RelayError> {
        Ok(self.scheduler.retry_failed_jobs().await?)
    }

    /// Every stored permanent failure. Unreadable records are skipped.
    pub async fn permanent_failures(&self) -> Result<Vec<PermanentFailureRecord>, RelayError> {
        let store = self.queue.store();
        let pattern = self.queue.keys().failure_pattern();
        let mut records = Vec::new();
        let mut cursor = 0;

        loop {
            let (next, keys) = store.scan(cursor, &pattern, self.page_size).await?;
            if !keys.is_empty() {
                for (key, raw) in keys.iter().zip(store.batch_get(&keys).await?) {
                    let Some(raw) = raw else { continue };
                    match serde_json::from_str::<PermanentFailureRecord>(&raw) {
                        Ok(record) => records.push(record),
                        Err(err) => warn!(key = %key, error = %err, "unreadable failure record"),
                    }
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        records.sort_by(|a, b| a.failed_at.cmp(&b.failed_at));
        Ok(records)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Drive one dispatch cycle on the caller's task.
    pub async fn run_cycle(&self) -> Result<CycleReport, RelayError> {
        Ok(self.dispatcher.run_cycle().await?)
    }

    /// Spawn the dispatch loop. Does nothing if it is already running.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        *running = Some(self.dispatcher.clone().spawn());
    }

    /// Stop the dispatch loop and wait for its current cycle to finish.
    pub async fn shutdown(&self) {
        let handle = self.running.lock().await.take();
        if let Some(mut handle) = handle {
            handle.shutdown().await;
        }
    }
}
