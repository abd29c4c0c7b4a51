use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::error::StoreError;
use crate::types::JobId;

/// Primitives the relay needs from the shared durable store.
///
/// Lists have a newest end (`push`) and an oldest end (`pop`,
/// `peek_oldest`). `pop` and `remove` must be atomic across every process
/// sharing the store: that atomicity, not any local bookkeeping, is what
/// keeps a job from being handed out twice.
#[async_trait]
pub trait Store: Send + Sync {
    async fn push(&self, list: &str, item: String) -> Result<(), StoreError>;

    /// Remove the oldest item, waiting up to `timeout`. A zero timeout never waits.
    async fn pop(&self, list: &str, timeout: Duration) -> Result<Option<String>, StoreError>;

    async fn peek_oldest(&self, list: &str) -> Result<Option<String>, StoreError>;

    /// Remove one occurrence of `item`, searching from the oldest end.
    /// Returns how many were removed (0 or 1).
    async fn remove(&self, list: &str, item: &str) -> Result<usize, StoreError>;

    /// Snapshot of a list, oldest first.
    async fn range(&self, list: &str) -> Result<Vec<String>, StoreError>;

    async fn len(&self, list: &str) -> Result<usize, StoreError>;

    /// One page of a cursor scan over plain keys. Cursor 0 starts a scan and
    /// a returned cursor of 0 ends it.
    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        page_size: usize,
    ) -> Result<(u64, Vec<String>), StoreError>;

    /// Fetch many keys in one round trip; missing keys yield `None`.
    async fn batch_get(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut values = self.batch_get(&[key.to_string()]).await?;
        Ok(values.pop().flatten())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Delete keys or whole lists.
    async fn delete(&self, keys: &[String]) -> Result<(), StoreError>;

    /// Delete every key matching `pattern`, page by page.
    async fn delete_matching(&self, pattern: &str, page_size: usize) -> Result<usize, StoreError> {
        let mut cursor = 0;
        let mut deleted = 0;
        loop {
            let (next, keys) = self.scan(cursor, pattern, page_size).await?;
            if !keys.is_empty() {
                deleted += keys.len();
                self.delete(&keys).await?;
            }
            if next == 0 {
                return Ok(deleted);
            }
            cursor = next;
        }
    }
}

/// Key layout shared by every process using the same prefix.
#[derive(Debug, Clone)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn ready_queue(&self) -> String {
        format!("{}:queue", self.prefix)
    }

    pub fn retry_queue(&self) -> String {
        format!("{}:retry", self.prefix)
    }

    pub fn record(&self, correlation_id: &str) -> String {
        format!("{}:record:{}", self.prefix, correlation_id)
    }

    pub fn record_pattern(&self) -> String {
        format!("{}:record:*", self.prefix)
    }

    pub fn failure(&self, job_id: &JobId) -> String {
        format!("{}:failed:{}", self.prefix, job_id.0)
    }

    pub fn failure_pattern(&self) -> String {
        format!("{}:failed:*", self.prefix)
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new("payments")
    }
}

/// In-memory store for tests and single-process deployments.
///
/// Lists and plain keys live in separate maps, as in Redis a key holds one
/// or the other.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
    pushed: Notify,
}

#[derive(Default)]
struct MemoryState {
    lists: HashMap<String, VecDeque<String>>,
    values: BTreeMap<String, String>,
    /// Resume points of unfinished scans, keyed by cursor id.
    cursors: HashMap<u64, String>,
    next_cursor: u64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn push(&self, list: &str, item: String) -> Result<(), StoreError> {
        // Newest at the front, oldest at the back.
        self.state
            .lock()
            .await
            .lists
            .entry(list.to_string())
            .or_default()
            .push_front(item);
        self.pushed.notify_one();
        Ok(())
    }

    async fn pop(&self, list: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some(item) = state.lists.get_mut(list).and_then(VecDeque::pop_back) {
                    return Ok(Some(item));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout_at(deadline, self.pushed.notified()).await;
        }
    }

    async fn peek_oldest(&self, list: &str) -> Result<Option<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.lists.get(list).and_then(|items| items.back().cloned()))
    }

    async fn remove(&self, list: &str, item: &str) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let Some(items) = state.lists.get_mut(list) else {
            return Ok(0);
        };
        match items.iter().rposition(|candidate| candidate == item) {
            Some(index) => {
                items.remove(index);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn range(&self, list: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .lists
            .get(list)
            .map(|items| items.iter().rev().cloned().collect())
            .unwrap_or_default())
    }

    async fn len(&self, list: &str) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state.lists.get(list).map_or(0, VecDeque::len))
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        page_size: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        let mut state = self.state.lock().await;
        let resume = match cursor {
            0 => None,
            id => match state.cursors.remove(&id) {
                Some(key) => Some(key),
                None => return Ok((0, Vec::new())),
            },
        };

        let page = page_size.max(1);
        let mut window: Vec<String> = match resume {
            Some(after) => state
                .values
                .range::<String, _>((Bound::Excluded(after), Bound::Unbounded))
                .take(page + 1)
                .map(|(key, _)| key.clone())
                .collect(),
            None => state.values.keys().take(page + 1).cloned().collect(),
        };
        let has_more = window.len() > page;
        window.truncate(page);

        let next_cursor = match window.last() {
            Some(last) if has_more => {
                state.next_cursor += 1;
                let id = state.next_cursor;
                state.cursors.insert(id, last.clone());
                id
            }
            _ => 0,
        };
        let keys = window.into_iter().filter(|key| glob_match(pattern, key)).collect();
        Ok((next_cursor, keys))
    }

    async fn batch_get(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        let state = self.state.lock().await;
        Ok(keys.iter().map(|key| state.values.get(key).cloned()).collect())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.state.lock().await.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for key in keys {
            state.values.remove(key);
            state.lists.remove(key);
        }
        Ok(())
    }
}

/// Glob matching with `*` as the only metacharacter.
fn glob_match(pattern: &str, text: &str) -> bool {
    let mut parts = pattern.split('*');
    let Some(first) = parts.next() else {
        return text.is_empty();
    };
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };
    let tail: Vec<&str> = parts.collect();
    let Some((last, middle)) = tail.split_last() else {
        // No '*' at all: exact match.
        return rest.is_empty();
    };
    for part in middle {
        match rest.find(part) {
            Some(index) => rest = &rest[index + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}
