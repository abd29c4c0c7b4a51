use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::error::{FailureReason, StoreError};
use crate::queue::QueueManager;
use crate::retry::{RetryOutcome, RetryScheduler};
use crate::telemetry::metric_inc;
use crate::types::Job;

/// Sends one payment to the external processor.
///
/// Success means an HTTP 2xx; every other outcome is a [`FailureReason`].
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, url: &str, body: &Value) -> Result<(), FailureReason>;
}

/// JSON-over-HTTP forwarder.
#[derive(Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpForwarder {
    pub fn new(timeout: Duration) -> Self {
        Self::with_client(reqwest::Client::new(), timeout)
    }

    pub fn with_client(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, url: &str, body: &Value) -> Result<(), FailureReason> {
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(FailureReason::Rejected {
                status: resp.status().as_u16(),
            }),
            Err(err) if err.is_timeout() => Err(FailureReason::Timeout),
            Err(err) => Err(FailureReason::Network(err.to_string())),
        }
    }
}

/// What a single dispatch attempt ended in.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Forwarded and recorded.
    Delivered,
    /// Failed and handed to the retry scheduler.
    Retrying,
    /// Failed for the last time.
    FailedPermanently,
    /// Already being dispatched by this process.
    Skipped,
}

/// Shared, read-only context for all dispatch tasks.
pub struct WorkerContext {
    pub queue: Arc<QueueManager>,
    pub scheduler: Arc<RetryScheduler>,
    pub forwarder: Arc<dyn Forwarder>,

    /// Ceiling on concurrent forwarding calls in this process.
    pub concurrency: Arc<Semaphore>,

    /// Hard bound on a single forwarding call.
    pub dispatch_timeout: Duration,
}

impl WorkerContext {
    /// Attempt one job. Store errors are returned; delivery failures are not,
    /// they go to the retry scheduler.
    pub async fn process_job(&self, mut job: Job) -> Result<JobOutcome, StoreError> {
        let Some(_claim) = self.queue.in_flight().try_claim(&job.id) else {
            debug!(job_id = %job.id, "job already in flight, skipping");
            return Ok(JobOutcome::Skipped);
        };

        let result = {
            // A closed semaphore only happens on teardown; run unthrottled then.
            let _permit = self.concurrency.acquire().await.ok();
            self.attempt(&job).await
        };

        match result {
            Ok(()) => {
                metric_inc("relay.delivery.success");
                info!(job_id = %job.id, attempt = job.attempts + 1, "payment forwarded");
                Ok(JobOutcome::Delivered)
            }
            Err(reason) => {
                metric_inc("relay.delivery.failure");
                warn!(
                    job_id = %job.id,
                    attempt = job.attempts + 1,
                    error = %reason,
                    "payment forwarding failed"
                );
                job.attempts = job.attempts.saturating_add(1);
                match self.scheduler.handle_failure(job, &reason).await? {
                    RetryOutcome::Scheduled { .. } => Ok(JobOutcome::Retrying),
                    RetryOutcome::Exhausted => Ok(JobOutcome::FailedPermanently),
                }
            }
        }
    }

    /// Forward the payload and, on success, persist the payment record.
    /// The attempt only succeeds once both have happened.
    async fn attempt(&self, job: &Job) -> Result<(), FailureReason> {
        let (Some(url), Some(correlation_id)) =
            (job.payload.target_url(), job.payload.correlation_id())
        else {
            return Err(FailureReason::InvalidPayload(
                "missing url or correlationId".to_string(),
            ));
        };

        let body = job.payload.forward_body(Utc::now());
        match tokio::time::timeout(self.dispatch_timeout, self.forwarder.forward(url, &body)).await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(reason),
            Err(_) => return Err(FailureReason::Timeout),
        }

        // Redelivery overwrites the record, so a failed write is retried
        // like any other failed attempt.
        let key = self.queue.keys().record(correlation_id);
        let stored = match serde_json::to_string(&body) {
            Ok(encoded) => self.queue.store().set(&key, encoded).await,
            Err(err) => Err(StoreError::from(err)),
        };
        stored.map_err(|err| {
            error!(job_id = %job.id, correlation_id, error = %err, "failed to record forwarded payment");
            FailureReason::RecordWrite(err.to_string())
        })
    }
}
