//! Retry scheduling: exponential backoff with jitter and permanent failure.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::error::{FailureReason, StoreError};
use crate::storage::{Keyspace, Store};
use crate::telemetry::metric_inc;
use crate::types::{Job, PermanentFailureRecord};

/// Backoff and attempt limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts allowed before a job fails permanently.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Ceiling on the exponential delay, before jitter.
    pub max_delay_ms: u64,
    /// Floor applied after jitter.
    pub min_delay_ms: u64,
    /// Symmetric jitter as a fraction of the capped delay.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 100,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            min_delay_ms: 100,
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    /// `min(max_delay, base * 2^(attempts - 1))`, without jitter.
    pub fn capped_delay_ms(&self, attempts: u32) -> u64 {
        let exponent = attempts.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms)
    }

    /// Backoff for the given attempt count with fresh random jitter.
    pub fn backoff(&self, attempts: u32) -> Duration {
        self.backoff_with(attempts, fastrand::f64())
    }

    /// Backoff with caller-supplied jitter; `unit` in `[0, 1]` maps linearly
    /// onto `[-jitter_ratio, +jitter_ratio]` of the capped delay.
    pub fn backoff_with(&self, attempts: u32, unit: f64) -> Duration {
        let capped = self.capped_delay_ms(attempts) as f64;
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        let offset = capped * ratio * (2.0 * unit.clamp(0.0, 1.0) - 1.0);
        let jittered_ms = (capped + offset).max(self.min_delay_ms as f64);
        Duration::from_micros((jittered_ms * 1000.0).round() as u64)
    }
}

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    /// Re-admitted to the retry queue.
    Scheduled { delay: Duration, next_eligible_at: DateTime<Utc> },
    /// Attempts exhausted; a failure record was written.
    Exhausted,
}

/// Turns failed attempts into re-admissions or permanent failures.
pub struct RetryScheduler {
    store: Arc<dyn Store>,
    keys: Keyspace,
    policy: RetryPolicy,
}

impl RetryScheduler {
    pub fn new(store: Arc<dyn Store>, keys: Keyspace, policy: RetryPolicy) -> Self {
        Self { store, keys, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Handle a job whose `attempts` already counts the failed attempt.
    pub async fn handle_failure(
        &self,
        mut job: Job,
        reason: &FailureReason,
    ) -> Result<RetryOutcome, StoreError> {
        let now = Utc::now();

        if job.is_exhausted() {
            error!(
                job_id = %job.id,
                attempts = job.attempts,
                error = %reason,
                "job failed permanently"
            );
            let record = PermanentFailureRecord {
                job,
                final_error: reason.to_string(),
                failed_at: now,
            };
            self.store
                .set(&self.keys.failure(&record.job.id), serde_json::to_string(&record)?)
                .await?;
            metric_inc("relay.job.failed_permanently");
            return Ok(RetryOutcome::Exhausted);
        }

        let delay = self.policy.backoff(job.attempts);
        let next_eligible_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);
        job.last_attempt_at = Some(now);
        job.next_eligible_at = next_eligible_at;

        self.store
            .push(&self.keys.retry_queue(), serde_json::to_string(&job)?)
            .await?;
        metric_inc("relay.retry.scheduled");
        info!(
            job_id = %job.id,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %reason,
            "retry scheduled"
        );

        Ok(RetryOutcome::Scheduled { delay, next_eligible_at })
    }

    /// Move up to `limit` jobs whose eligibility time has passed from the
    /// oldest end of the retry queue into `batch`.
    ///
    /// Stops at the first job that is not yet eligible instead of scanning
    /// the whole queue; later entries wait for a following cycle. Jobs taken
    /// before a store error stay in `batch`.
    pub async fn take_eligible(&self, limit: usize, batch: &mut Vec<Job>) -> Result<usize, StoreError> {
        let list = self.keys.retry_queue();
        let mut taken = 0;

        while taken < limit {
            let Some(raw) = self.store.peek_oldest(&list).await? else {
                break;
            };
            let job = match serde_json::from_str::<Job>(&raw) {
                Ok(job) => job,
                Err(err) => {
                    warn!(error = %err, "discarding malformed retry-queue entry");
                    self.store.remove(&list, &raw).await?;
                    continue;
                }
            };
            if !job.is_eligible(Utc::now()) {
                break;
            }
            // Another process may have taken it between peek and remove.
            if self.store.remove(&list, &raw).await? > 0 {
                batch.push(job);
                taken += 1;
            }
        }

        Ok(taken)
    }

    /// Make every non-terminal job in the retry queue eligible now.
    /// Returns how many were rescheduled.
    pub async fn retry_failed_jobs(&self) -> Result<usize, StoreError> {
        let list = self.keys.retry_queue();
        let snapshot = self.store.range(&list).await?;
        let now = Utc::now();
        let mut retried = 0;

        for raw in snapshot {
            let Ok(mut job) = serde_json::from_str::<Job>(&raw) else {
                continue;
            };
            if job.is_exhausted() {
                continue;
            }
            job.next_eligible_at = now;
            let encoded = serde_json::to_string(&job)?;
            // The eligible copy goes in before the old entry comes out, so a
            // failure in between leaves a duplicate rather than a gap.
            self.store.push(&list, encoded.clone()).await?;
            if self.store.remove(&list, &raw).await? == 0 {
                // A worker took the old entry meanwhile; withdraw the copy.
                self.store.remove(&list, &encoded).await?;
                continue;
            }
            retried += 1;
        }

        info!(count = retried, "forced retry of failed jobs");
        Ok(retried)
    }
}
