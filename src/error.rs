use std::fmt;

use thiserror::Error;

/// Errors raised by the durable store.
///
/// All of these are treated as transient by the dispatch loop: the cycle
/// pauses and tries again.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached (connection refused, dropped, timed out).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store answered but rejected the command.
    #[error("store command failed: {0}")]
    Command(String),

    /// A value could not be encoded for storage.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}

/// Why a single forwarding attempt did not succeed.
///
/// Every variant consumes an attempt; the processor rejecting a payment and
/// the processor being unreachable are handled identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// No response within the dispatch timeout.
    Timeout,

    /// Connection-level failure.
    Network(String),

    /// The processor answered with a non-2xx status.
    Rejected { status: u16 },

    /// The stored payload lacks what is needed to forward it.
    InvalidPayload(String),

    /// The processor accepted the payment but its record could not be stored.
    RecordWrite(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout =>
                write!(f, "request timed out"),
            FailureReason::Network(detail) =>
                write!(f, "network error: {detail}"),
            FailureReason::Rejected { status } =>
                write!(f, "processor returned status {status}"),
            FailureReason::InvalidPayload(detail) =>
                write!(f, "invalid payload: {detail}"),
            FailureReason::RecordWrite(detail) =>
                write!(f, "record write failed: {detail}"),
        }
    }
}

impl std::error::Error for FailureReason {}

/// Errors returned by the relay's operation surface.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The submitted payment was rejected before reaching the queue.
    #[error("invalid payment: {0}")]
    Validation(String),

    /// Infrastructure is unavailable; the caller may retry.
    #[error(transparent)]
    Store(#[from] StoreError),
}
