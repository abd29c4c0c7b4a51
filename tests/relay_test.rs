use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use payment_relay::{
    FailureReason, Forwarder, HttpForwarder, InMemoryStore, Job, JobOutcome, Keyspace,
    PaymentPayload, PaymentRecord, PaymentRelay, QueueManager, RelayConfig, RelayError,
    RetryPolicy, RetryScheduler, Store, StoreError, WorkerContext,
};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.dispatcher.pop_timeout_ms = 0;
    config.dispatcher.idle_pause_ms = 5;
    config.dispatcher.error_pause_ms = 5;
    config.dispatcher.dispatch_timeout_ms = 2_000;
    config.retry = RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 1,
        max_delay_ms: 1,
        min_delay_ms: 0,
        jitter_ratio: 0.0,
    };
    config
}

fn relay_with(config: &RelayConfig) -> (Arc<InMemoryStore>, PaymentRelay) {
    let store = Arc::new(InMemoryStore::new());
    let forwarder = HttpForwarder::new(Duration::from_millis(config.dispatcher.dispatch_timeout_ms));
    let relay = PaymentRelay::new(store.clone(), Arc::new(forwarder), config);
    (store, relay)
}

fn payment(server: &MockServer, correlation_id: &str, amount: Value) -> Value {
    json!({
        "correlationId": correlation_id,
        "amount": amount,
        "url": format!("{}/payments", server.uri()),
    })
}

async fn stored_record(store: &InMemoryStore, correlation_id: &str) -> Option<PaymentRecord> {
    let raw = store.get(&format!("payments:record:{correlation_id}")).await.unwrap()?;
    PaymentRecord::parse(&raw)
}

#[tokio::test]
async fn successful_delivery_is_recorded_and_summarized() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/payments"))
        .and(body_partial_json(json!({"correlationId": "c-1", "amount": 100})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (store, relay) = relay_with(&fast_config());
    relay.submit(payment(&server, "c-1", json!(100))).await.unwrap();

    let report = relay.run_cycle().await.unwrap();
    assert_eq!(report.pulled, 1);
    assert_eq!(report.delivered, 1);

    let record = stored_record(&store, "c-1").await.expect("record written");
    assert_eq!(record.amount, Decimal::from(100));

    let summary = relay
        .summary(
            Some(record.requested_at - chrono::Duration::seconds(1)),
            Some(Utc::now() + chrono::Duration::seconds(1)),
        )
        .await;
    assert_eq!(summary.total_count, 1);
    assert_eq!(summary.total_amount, Decimal::from(100));

    let stats = relay.stats().await.unwrap();
    assert_eq!((stats.ready_depth, stats.retry_depth, stats.in_flight), (0, 0, 0));
}

#[tokio::test]
async fn forwarded_body_carries_requested_at() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let (_store, relay) = relay_with(&fast_config());
    let mut body = payment(&server, "c-extra", json!("12.50"));
    body["memo"] = json!("kept as is");
    relay.submit(body).await.unwrap();
    relay.run_cycle().await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(sent["memo"], json!("kept as is"));
    assert_eq!(sent["amount"], json!("12.50"));
    assert!(sent["requestedAt"].as_str().is_some_and(|s| s.ends_with('Z')));
}

#[tokio::test]
async fn always_failing_target_ends_in_one_permanent_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let config = fast_config();
    let (_store, relay) = relay_with(&config);
    let job_id = relay.submit(payment(&server, "c-fail", json!(10))).await.unwrap();

    for _ in 0..50 {
        relay.run_cycle().await.unwrap();
        if !relay.permanent_failures().await.unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Further cycles must not attempt the job again.
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(relay.run_cycle().await.unwrap().pulled, 0);
    }

    let failures = relay.permanent_failures().await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].job.id, job_id);
    assert_eq!(failures[0].job.attempts, 3);
    assert!(failures[0].final_error.contains("500"));

    let stats = relay.stats().await.unwrap();
    assert_eq!((stats.ready_depth, stats.retry_depth), (0, 0));
    assert_eq!(relay.summary(None, None).await.total_count, 0);
}

#[tokio::test]
async fn timeout_counts_as_failed_attempt() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let mut config = fast_config();
    config.dispatcher.dispatch_timeout_ms = 50;
    config.retry.max_attempts = 1;
    let (store, relay) = relay_with(&config);
    relay.submit(payment(&server, "c-slow", json!(1))).await.unwrap();

    let report = relay.run_cycle().await.unwrap();
    assert_eq!(report.failed, 1);
    assert!(stored_record(&store, "c-slow").await.is_none());

    let failures = relay.permanent_failures().await.unwrap();
    assert_eq!(failures[0].final_error, FailureReason::Timeout.to_string());
}

#[tokio::test]
async fn purge_empties_queues_and_records() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (store, relay) = relay_with(&fast_config());
    relay.submit(payment(&server, "c-done", json!(5))).await.unwrap();
    relay.run_cycle().await.unwrap();
    assert_eq!(relay.summary(None, None).await.total_count, 1);

    for i in 0..3 {
        relay.submit(payment(&server, &format!("c-{i}"), json!(1))).await.unwrap();
    }
    store.set("payments:failed:kept", "{}".into()).await.unwrap();

    relay.purge().await.unwrap();

    let stats = relay.stats().await.unwrap();
    assert_eq!((stats.ready_depth, stats.retry_depth, stats.in_flight), (0, 0, 0));
    assert!(stored_record(&store, "c-done").await.is_none());
    assert_eq!(relay.summary(None, None).await.total_count, 0);
    assert!(store.get("payments:failed:kept").await.unwrap().is_some());
}

#[tokio::test]
async fn forced_retry_makes_waiting_jobs_eligible() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut config = fast_config();
    config.retry = RetryPolicy {
        max_attempts: 10,
        base_delay_ms: 60_000,
        max_delay_ms: 60_000,
        min_delay_ms: 60_000,
        jitter_ratio: 0.0,
    };
    let (_store, relay) = relay_with(&config);
    relay.submit(payment(&server, "c-a", json!(1))).await.unwrap();
    relay.submit(payment(&server, "c-b", json!(2))).await.unwrap();

    assert_eq!(relay.run_cycle().await.unwrap().retrying, 2);
    assert_eq!(relay.run_cycle().await.unwrap().pulled, 0);

    assert_eq!(relay.retry_failed_jobs().await.unwrap(), 2);

    let report = relay.run_cycle().await.unwrap();
    assert_eq!(report.pulled, 2);
    assert_eq!(report.retrying, 2);
    assert_eq!(server.received_requests().await.unwrap().len(), 4);
}

#[tokio::test]
async fn forced_retry_leaves_exhausted_jobs_alone() {
    let server = MockServer::start().await;
    let (store, relay) = relay_with(&fast_config());

    let payload = PaymentPayload::from_value(payment(&server, "c-x", json!(3))).unwrap();
    let mut exhausted = Job::new(payload, 2, Utc::now());
    exhausted.attempts = 2;
    let raw = serde_json::to_string(&exhausted).unwrap();
    store.push("payments:retry", raw.clone()).await.unwrap();

    assert_eq!(relay.retry_failed_jobs().await.unwrap(), 0);
    assert_eq!(store.range("payments:retry").await.unwrap(), vec![raw]);
}

#[tokio::test]
async fn job_already_in_flight_is_skipped() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let keys = Keyspace::default();
    let queue = Arc::new(QueueManager::new(store.clone(), keys.clone(), 3));
    let scheduler = Arc::new(RetryScheduler::new(store, keys, RetryPolicy::default()));
    let ctx = WorkerContext {
        queue: queue.clone(),
        scheduler,
        forwarder: Arc::new(HttpForwarder::new(Duration::from_millis(100))),
        concurrency: Arc::new(Semaphore::new(1)),
        dispatch_timeout: Duration::from_millis(100),
    };

    let payload = PaymentPayload::from_value(json!({
        "correlationId": "c-dup",
        "amount": 1,
        "url": "http://127.0.0.1:9/unused",
    }))
    .unwrap();
    let job = Job::new(payload, 3, Utc::now());

    let _claim = queue.in_flight().try_claim(&job.id).unwrap();
    assert_eq!(ctx.process_job(job).await.unwrap(), JobOutcome::Skipped);
    assert_eq!(queue.stats().await.unwrap().retry_depth, 0);
}

#[tokio::test]
async fn concurrency_ceiling_is_independent_of_batch_size() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(100)))
        .mount(&server)
        .await;

    let mut config = fast_config();
    config.dispatcher.batch_size = 10;
    config.dispatcher.max_concurrent = 2;
    let (_store, relay) = relay_with(&config);
    for i in 0..4 {
        relay.submit(payment(&server, &format!("c-{i}"), json!(1))).await.unwrap();
    }

    let started = Instant::now();
    let report = relay.run_cycle().await.unwrap();
    assert_eq!(report.delivered, 4);
    assert!(started.elapsed() >= Duration::from_millis(190));
}

#[tokio::test]
async fn redelivery_overwrites_the_same_record() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let (_store, relay) = relay_with(&fast_config());
    relay.submit(payment(&server, "c-same", json!(40))).await.unwrap();
    relay.run_cycle().await.unwrap();
    relay.submit(payment(&server, "c-same", json!(40))).await.unwrap();
    relay.run_cycle().await.unwrap();

    let summary = relay.summary(None, None).await;
    assert_eq!(summary.total_count, 1);
    assert_eq!(summary.total_amount, Decimal::from(40));
}

#[tokio::test]
async fn summary_skips_malformed_records_and_respects_window() {
    let (store, relay) = relay_with(&fast_config());
    let record = |id: &str, amount: &str, at: &str| {
        json!({"correlationId": id, "amount": amount, "requestedAt": at}).to_string()
    };
    store.set("payments:record:a", record("a", "10.10", "2025-07-01T10:00:00.000Z")).await.unwrap();
    store.set("payments:record:b", record("b", "5", "2025-07-01T12:00:00.000Z")).await.unwrap();
    store.set("payments:record:c", record("c", "7", "2025-07-02T00:00:00.000Z")).await.unwrap();
    store.set("payments:record:bad", "{not json".into()).await.unwrap();

    let from = "2025-07-01T10:00:00.000Z".parse().unwrap();
    let to = "2025-07-01T12:00:00.000Z".parse().unwrap();
    let summary = relay.summary(Some(from), Some(to)).await;
    assert_eq!(summary.total_count, 2);
    assert_eq!(summary.total_amount, "15.10".parse::<Decimal>().unwrap());

    let empty_from = "2030-01-01T00:00:00.000Z".parse().unwrap();
    let empty = relay.summary(Some(empty_from), None).await;
    assert_eq!(empty.total_count, 0);
    assert_eq!(empty.total_amount, Decimal::ZERO);
}

#[tokio::test]
async fn summary_is_cached_until_ttl_expires() {
    let mut config = fast_config();
    config.summary.cache_ttl_ms = 100;
    let (store, relay) = relay_with(&config);
    let to = Utc::now() + chrono::Duration::hours(1);
    let insert = |id: &'static str| {
        let store = store.clone();
        async move {
            let value = json!({"correlationId": id, "amount": 1, "requestedAt": "2025-07-01T10:00:00.000Z"});
            store.set(&format!("payments:record:{id}"), value.to_string()).await.unwrap();
        }
    };

    insert("one").await;
    let first = relay.summary(None, Some(to)).await;
    insert("two").await;
    assert_eq!(relay.summary(None, Some(to)).await, first);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(relay.summary(None, Some(to)).await.total_count, 2);
}

#[tokio::test]
async fn submit_rejects_invalid_payments() {
    let (_store, relay) = relay_with(&fast_config());
    let missing_url = json!({"correlationId": "c", "amount": 1});
    assert!(matches!(relay.submit(missing_url).await, Err(RelayError::Validation(_))));
    assert!(matches!(relay.submit(json!("nope")).await, Err(RelayError::Validation(_))));
    assert_eq!(relay.stats().await.unwrap().ready_depth, 0);
}

#[tokio::test]
async fn dispatch_loop_runs_until_shutdown() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (store, relay) = relay_with(&fast_config());
    relay.start().await;
    relay.start().await;
    relay.submit(payment(&server, "c-loop", json!(3))).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while stored_record(&store, "c-loop").await.is_none() {
        assert!(Instant::now() < deadline, "payment was never forwarded");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(relay.stats().await.unwrap().processing);

    relay.shutdown().await;
    assert!(!relay.stats().await.unwrap().processing);
}

/// A store that is always down.
struct UnavailableStore;

#[async_trait]
impl Store for UnavailableStore {
    async fn push(&self, _: &str, _: String) -> Result<(), StoreError> {
        Err(down())
    }
    async fn pop(&self, _: &str, _: Duration) -> Result<Option<String>, StoreError> {
        Err(down())
    }
    async fn peek_oldest(&self, _: &str) -> Result<Option<String>, StoreError> {
        Err(down())
    }
    async fn remove(&self, _: &str, _: &str) -> Result<usize, StoreError> {
        Err(down())
    }
    async fn range(&self, _: &str) -> Result<Vec<String>, StoreError> {
        Err(down())
    }
    async fn len(&self, _: &str) -> Result<usize, StoreError> {
        Err(down())
    }
    async fn scan(&self, _: u64, _: &str, _: usize) -> Result<(u64, Vec<String>), StoreError> {
        Err(down())
    }
    async fn batch_get(&self, _: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        Err(down())
    }
    async fn set(&self, _: &str, _: String) -> Result<(), StoreError> {
        Err(down())
    }
    async fn delete(&self, _: &[String]) -> Result<(), StoreError> {
        Err(down())
    }
}

fn down() -> StoreError {
    StoreError::Unavailable("connection refused".into())
}

struct NeverCalled;

#[async_trait]
impl Forwarder for NeverCalled {
    async fn forward(&self, _: &str, _: &Value) -> Result<(), FailureReason> {
        panic!("nothing should be forwarded");
    }
}

#[tokio::test]
async fn store_outage_degrades_summary_and_surfaces_elsewhere() {
    let relay = PaymentRelay::new(Arc::new(UnavailableStore), Arc::new(NeverCalled), &fast_config());

    let summary = relay.summary(None, None).await;
    assert_eq!(summary.total_count, 0);
    assert_eq!(summary.total_amount, Decimal::ZERO);
    assert!(matches!(relay.try_summary(None, None).await, Err(RelayError::Store(_))));

    assert!(relay.run_cycle().await.is_err());
    let valid = json!({"correlationId": "c", "amount": 1, "url": "http://p"});
    assert!(matches!(relay.submit(valid).await, Err(RelayError::Store(_))));
}
