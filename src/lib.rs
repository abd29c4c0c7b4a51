//! A durable payment-forwarding relay.
//!
//! Payments are accepted into a queue held in a shared store, forwarded
//! to an external processor over HTTP by a dispatch loop, retried with
//! exponential backoff on failure, and recorded on success so they can be
//! aggregated over time windows.
//!
//! ## Guarantees
//! - At-least-once delivery for every accepted payment
//! - One success record per correlation id
//! - One permanent failure record per exhausted job
//! - Bounded outbound concurrency and bounded call duration
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Submission order of forwarding
//! - Strict eligibility order in the retry queue
//! - Cancellation of calls already in flight
//!
//! Several processes may share one store; the store's atomic pop is what
//! keeps a job from being handed out twice.

mod dispatcher;
mod error;
mod queue;
mod relay;
mod retry;
mod settings;
mod storage;
mod summary;
mod telemetry;
mod types;
mod worker;

#[cfg(feature = "redis")]
mod storage_redis;

pub use dispatcher::{CycleReport, Dispatcher, DispatcherConfig, DispatcherHandle};
pub use error::{FailureReason, RelayError, StoreError};
pub use queue::{InFlight, InFlightGuard, QueueManager};
pub use relay::PaymentRelay;
pub use retry::{RetryOutcome, RetryPolicy, RetryScheduler};
pub use settings::RelayConfig;
pub use storage::{InMemoryStore, Keyspace, Store};
pub use summary::{SummaryCache, SummaryConfig, SummaryEngine};
pub use telemetry::init_tracing;
pub use types::{
    coerce_amount, Job, JobId, PaymentPayload, PaymentRecord, PermanentFailureRecord, QueueStats,
    Summary,
};
pub use worker::{Forwarder, HttpForwarder, JobOutcome, WorkerContext};

#[cfg(feature = "redis")]
pub use storage_redis::RedisStore;
