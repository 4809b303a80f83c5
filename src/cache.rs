// ABOUTME: Bounded in-memory TTL cache used for relay request deduplication.
// ABOUTME: Async-mutex protected; expired entries are dropped on access, nearest-expiry evicted when full.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const DEFAULT_CAPACITY: usize = 1024;

/// Key/value cache where every entry carries its own expiry.
///
/// Uses `tokio::time::Instant` so tests under a paused clock see expiry
/// advance with `tokio::time::advance`.
pub struct TtlCache<V> {
    entries: Mutex<HashMap<String, (V, Instant)>>,
    capacity: usize,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Returns the live value for `key`, dropping it if expired.
    pub async fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((_, expiry)) if *expiry <= Instant::now() => {
                entries.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }

    /// Inserts `value` under `key` for `ttl`. A zero TTL is a no-op.
    pub async fn insert(&self, key: String, value: V, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, (_, expiry)| *expiry > now);
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            let nearest = entries
                .iter()
                .min_by_key(|(_, (_, expiry))| *expiry)
                .map(|(k, _)| k.clone());
            if let Some(nearest) = nearest {
                entries.remove(&nearest);
            }
        }
        entries.insert(key, (value, now + ttl));
    }

    pub async fn remove(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
