use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RelayError;

/// Unique identifier for a queued job.
///
/// Assigned once at enqueue time and kept across every retry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payment payload carried by a job.
///
/// The relay treats the payload as an opaque JSON object; it only looks at
/// `correlationId`, `amount` and `url`. Extra fields are forwarded untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentPayload(Map<String, Value>);

impl PaymentPayload {
    /// Validate a submitted object.
    ///
    /// `correlationId` and `url` must be non-empty strings. `amount` is not
    /// checked here: anything non-numeric counts as zero downstream.
    pub fn new(fields: Map<String, Value>) -> Result<Self, RelayError> {
        let payload = Self(fields);
        if payload.correlation_id().is_none() {
            return Err(RelayError::Validation("correlationId must be a non-empty string".into()));
        }
        if payload.target_url().is_none() {
            return Err(RelayError::Validation("url must be a non-empty string".into()));
        }
        Ok(payload)
    }

    /// Validate an arbitrary JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self, RelayError> {
        match value {
            Value::Object(fields) => Self::new(fields),
            _ => Err(RelayError::Validation("payment must be a JSON object".into())),
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        non_empty_str(self.0.get("correlationId"))
    }

    pub fn target_url(&self) -> Option<&str> {
        non_empty_str(self.0.get("url"))
    }

    pub fn amount(&self) -> Decimal {
        self.0.get("amount").map(coerce_amount).unwrap_or(Decimal::ZERO)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Body sent to the processor: the payload plus `requestedAt`.
    pub fn forward_body(&self, requested_at: DateTime<Utc>) -> Value {
        let mut body = self.0.clone();
        body.insert(
            "requestedAt".to_string(),
            Value::String(requested_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        Value::Object(body)
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.as_str()),
        _ => None,
    }
}

/// Interpret a JSON value as a monetary amount.
///
/// Numbers and numeric strings are accepted; everything else is zero.
pub fn coerce_amount(value: &Value) -> Decimal {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return Decimal::ZERO,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .unwrap_or(Decimal::ZERO)
}

/// A unit of work flowing through the ready and retry queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,

    pub payload: PaymentPayload,

    /// Dispatch attempts made so far.
    pub attempts: u32,

    /// Attempts allowed before the job fails permanently.
    pub max_attempts: u32,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub enqueued_at: DateTime<Utc>,

    /// The job must not be dispatched before this instant.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub next_eligible_at: DateTime<Utc>,

    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a job that is immediately eligible.
    pub fn new(payload: PaymentPayload, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::generate(),
            payload,
            attempts: 0,
            max_attempts,
            enqueued_at: now,
            next_eligible_at: now,
            last_attempt_at: None,
        }
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.next_eligible_at <= now
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// A successfully forwarded payment, as read back for aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentRecord {
    pub correlation_id: String,
    pub amount: Decimal,
    pub requested_at: DateTime<Utc>,
}

impl PaymentRecord {
    /// Parse a stored record.
    ///
    /// Returns `None` for anything without a valid `requestedAt`; such
    /// records are treated as absent. A bad `amount` counts as zero.
    pub fn parse(raw: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(raw).ok()?;
        let fields = value.as_object()?;
        let requested_at = fields
            .get("requestedAt")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())?
            .with_timezone(&Utc);

        Some(Self {
            correlation_id: fields
                .get("correlationId")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            amount: fields.get("amount").map(coerce_amount).unwrap_or(Decimal::ZERO),
            requested_at,
        })
    }
}

/// Terminal snapshot of a job that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermanentFailureRecord {
    #[serde(flatten)]
    pub job: Job,
    pub final_error: String,
    pub failed_at: DateTime<Utc>,
}

/// Point-in-time queue counts. Eventually consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub ready_depth: usize,
    pub retry_depth: usize,
    pub in_flight: usize,
    /// Whether a dispatch loop is running in this process.
    pub processing: bool,
}

/// Aggregate of recorded payments over a time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total_count: u64,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_amount: Decimal,
}
