use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::storage::{Keyspace, Store};
use crate::telemetry::metric_inc;
use crate::types::{Job, JobId, PaymentPayload, QueueStats};

/// Owns the ready queue and the process-local view of in-flight work.
pub struct QueueManager {
    store: Arc<dyn Store>,
    keys: Keyspace,
    max_attempts: u32,
    in_flight: InFlight,
    processing: AtomicBool,
}

impl QueueManager {
    pub fn new(store: Arc<dyn Store>, keys: Keyspace, max_attempts: u32) -> Self {
        Self {
            store,
            keys,
            max_attempts: max_attempts.max(1),
            in_flight: InFlight::default(),
            processing: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn keys(&self) -> &Keyspace {
        &self.keys
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Queue a payment for its first dispatch. Returns as soon as the job is
    /// durably stored.
    pub async fn enqueue(&self, payload: PaymentPayload) -> Result<JobId, StoreError> {
        let job = Job::new(payload, self.max_attempts, Utc::now());
        let encoded = serde_json::to_string(&job)?;
        self.store.push(&self.keys.ready_queue(), encoded).await?;
        metric_inc("relay.job.enqueued");
        debug!(job_id = %job.id, "job enqueued");
        Ok(job.id)
    }

    /// Pop one job from the ready queue.
    ///
    /// Entries that no longer parse are discarded so they cannot block the
    /// queue, and the next entry is tried without waiting again.
    pub async fn pop_ready(&self, timeout: Duration) -> Result<Option<Job>, StoreError> {
        let list = self.keys.ready_queue();
        let mut timeout = timeout;
        loop {
            let Some(raw) = self.store.pop(&list, timeout).await? else {
                return Ok(None);
            };
            match serde_json::from_str::<Job>(&raw) {
                Ok(job) => return Ok(Some(job)),
                Err(err) => {
                    warn!(error = %err, "discarding malformed ready-queue entry");
                    timeout = Duration::ZERO;
                }
            }
        }
    }

    pub async fn stats(&self) -> Result<QueueStats, StoreError> {
        let ready_depth = self.store.len(&self.keys.ready_queue()).await?;
        let retry_depth = self.store.len(&self.keys.retry_queue()).await?;
        Ok(QueueStats {
            ready_depth,
            retry_depth,
            in_flight: self.in_flight.len(),
            processing: self.is_processing(),
        })
    }

    /// Empty both queues and forget local in-flight ids.
    ///
    /// Jobs already being forwarded are not cancelled and still record their
    /// outcome.
    pub async fn purge(&self) -> Result<(), StoreError> {
        self.store
            .delete(&[self.keys.ready_queue(), self.keys.retry_queue()])
            .await?;
        self.in_flight.clear();
        Ok(())
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    pub(crate) fn set_processing(&self, running: bool) {
        self.processing.store(running, Ordering::SeqCst);
    }
}

/// Ids of jobs this process is currently forwarding.
///
/// Advisory only: it skips a job that shows up twice in this process, but
/// cross-process exclusivity comes from the store's atomic pop.
#[derive(Clone, Default)]
pub struct InFlight {
    ids: Arc<Mutex<HashSet<JobId>>>,
}

impl InFlight {
    /// Mark `id` as in flight. Returns `None` if it already is.
    pub fn try_claim(&self, id: &JobId) -> Option<InFlightGuard> {
        if self.lock().insert(id.clone()) {
            Some(InFlightGuard {
                ids: self.ids.clone(),
                id: id.clone(),
            })
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<JobId>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the in-flight claim when the attempt finishes.
pub struct InFlightGuard {
    ids: Arc<Mutex<HashSet<JobId>>>,
    id: JobId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}
