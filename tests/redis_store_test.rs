#![cfg(feature = "redis")]

//! Runs against a live Redis: `REDIS_URL=redis://127.0.0.1 cargo test --features redis -- --ignored`

use std::time::Duration;

use payment_relay::{RedisStore, Store};

async fn connect() -> RedisStore {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    RedisStore::connect(&url).await.expect("redis reachable")
}

fn prefix() -> String {
    format!("relay-test-{}", uuid::Uuid::now_v7())
}

#[tokio::test]
#[ignore = "needs a running Redis"]
async fn lists_behave_like_the_in_memory_store() {
    let store = connect().await;
    let list = format!("{}:queue", prefix());

    store.push(&list, "a".into()).await.unwrap();
    store.push(&list, "b".into()).await.unwrap();
    assert_eq!(store.len(&list).await.unwrap(), 2);
    assert_eq!(store.peek_oldest(&list).await.unwrap().as_deref(), Some("a"));
    assert_eq!(store.range(&list).await.unwrap(), vec!["a", "b"]);

    assert_eq!(store.pop(&list, Duration::ZERO).await.unwrap().as_deref(), Some("a"));
    assert_eq!(store.remove(&list, "b").await.unwrap(), 1);
    assert_eq!(store.pop(&list, Duration::from_millis(600)).await.unwrap(), None);
}

#[tokio::test]
#[ignore = "needs a running Redis"]
async fn scan_and_delete_matching_cover_every_key() {
    let store = connect().await;
    let prefix = prefix();
    for i in 0..30 {
        store.set(&format!("{prefix}:record:{i}"), i.to_string()).await.unwrap();
    }
    store.set(&format!("{prefix}:failed:x"), "f".into()).await.unwrap();

    let pattern = format!("{prefix}:record:*");
    let mut cursor = 0;
    let mut seen = std::collections::HashSet::new();
    loop {
        let (next, keys) = store.scan(cursor, &pattern, 10).await.unwrap();
        seen.extend(keys);
        if next == 0 {
            break;
        }
        cursor = next;
    }
    assert_eq!(seen.len(), 30);

    let keys: Vec<String> = seen.into_iter().collect();
    let values = store.batch_get(&keys).await.unwrap();
    assert!(values.iter().all(Option::is_some));

    store.delete_matching(&pattern, 10).await.unwrap();
    assert!(store.batch_get(&keys).await.unwrap().iter().all(Option::is_none));

    let failure = format!("{prefix}:failed:x");
    assert_eq!(store.get(&failure).await.unwrap().as_deref(), Some("f"));
    store.delete(&[failure]).await.unwrap();
}
