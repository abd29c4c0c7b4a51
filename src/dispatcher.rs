use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

use crate::error::StoreError;
use crate::queue::QueueManager;
use crate::retry::RetryScheduler;
use crate::types::Job;
use crate::worker::{Forwarder, JobOutcome, WorkerContext};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Jobs pulled from each queue per cycle.
    pub batch_size: usize,
    /// Forwarding calls allowed at once, independent of batch size.
    pub max_concurrent: usize,
    pub dispatch_timeout_ms: u64,
    /// How long the first ready-queue pop of a cycle may block.
    pub pop_timeout_ms: u64,
    /// Pause after a cycle that found no work.
    pub idle_pause_ms: u64,
    /// Pause after a cycle that hit a store error.
    pub error_pause_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrent: 5,
            dispatch_timeout_ms: 10_000,
            pop_timeout_ms: 1_000,
            idle_pause_ms: 100,
            error_pause_ms: 1_000,
        }
    }
}

/// Counts from one dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub pulled: usize,
    pub delivered: usize,
    pub retrying: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Delivered => self.delivered += 1,
            JobOutcome::Retrying => self.retrying += 1,
            JobOutcome::FailedPermanently => self.failed += 1,
            JobOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Pulls ready and retry-eligible jobs and forwards them.
///
/// The only component that talks to the external processor.
pub struct Dispatcher {
    ctx: Arc<WorkerContext>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<QueueManager>,
        scheduler: Arc<RetryScheduler>,
        forwarder: Arc<dyn Forwarder>,
        config: DispatcherConfig,
    ) -> Self {
        let ctx = Arc::new(WorkerContext {
            queue,
            scheduler,
            forwarder,
            concurrency: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            dispatch_timeout: Duration::from_millis(config.dispatch_timeout_ms),
        });
        Self { ctx, config }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Run one cycle: pull a batch from both queues, forward everything
    /// concurrently under the ceiling, and wait for all attempts to finish.
    ///
    /// A store error while pulling does not drop what was already pulled:
    /// that partial batch is dispatched first and the error reported after.
    pub async fn run_cycle(&self) -> Result<CycleReport, StoreError> {
        let mut batch = Vec::with_capacity(self.config.batch_size.saturating_mul(2));
        let mut first_error = match self.pull_ready(&mut batch).await {
            Ok(()) => self
                .ctx
                .scheduler
                .take_eligible(self.config.batch_size, &mut batch)
                .await
                .err(),
            Err(err) => Some(err),
        };

        let mut report = CycleReport {
            pulled: batch.len(),
            ..CycleReport::default()
        };
        if batch.is_empty() {
            return match first_error {
                Some(err) => Err(err),
                None => Ok(report),
            };
        }

        let mut tasks = JoinSet::new();
        for job in batch {
            let ctx = self.ctx.clone();
            tasks.spawn(async move { ctx.process_job(job).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => report.record(&outcome),
                Ok(Err(err)) => {
                    error!(error = %err, "store error while settling job");
                    first_error.get_or_insert(err);
                }
                Err(err) => error!(error = %err, "dispatch task panicked"),
            }
        }

        debug!(?report, "dispatch cycle finished");
        match first_error {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Loop until `shutdown` flips to `true`. Never returns early on errors.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let queue = &self.ctx.queue;
        queue.set_processing(true);
        info!(
            batch_size = self.config.batch_size,
            max_concurrent = self.config.max_concurrent,
            "dispatcher started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.run_cycle().await {
                Ok(report) if report.pulled == 0 => Some(Duration::from_millis(self.config.idle_pause_ms)),
                Ok(_) => None,
                Err(err) => {
                    error!(error = %err, "dispatch cycle failed");
                    Some(Duration::from_millis(self.config.error_pause_ms))
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    changed = shutdown.changed() => {
                        // A dropped handle stops the loop too.
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        queue.set_processing(false);
        info!("dispatcher stopped");
    }

    /// Spawn [`run`](Self::run) on the runtime.
    pub fn spawn(self: Arc<Self>) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { self.run(shutdown_rx).await });
        DispatcherHandle {
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// The first pop may block briefly; the rest only take what is there.
    async fn pull_ready(&self, batch: &mut Vec<Job>) -> Result<(), StoreError> {
        let mut timeout = Duration::from_millis(self.config.pop_timeout_ms);
        for _ in 0..self.config.batch_size {
            match self.ctx.queue.pop_ready(timeout).await? {
                Some(job) => batch.push(job),
                None => break,
            }
            timeout = Duration::ZERO;
        }
        Ok(())
    }
}

/// Handle to a running dispatch loop. Dropping it also stops the loop,
/// without waiting for it.
pub struct DispatcherHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Signal the loop and wait for the current cycle to drain.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                error!(error = %err, "dispatcher task ended abnormally");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }
}
