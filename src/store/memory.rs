//! In-memory implementation of the shared store.
//!
//! Backs single-node deployments and every test. Entries carry an optional
//! expiry deadline; expired entries are dropped lazily on access. All
//! operations take the one interior lock for their full duration, which is
//! what makes increment and compare-and-swap atomic here.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{Result, SharedStore, StoreError};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

/// An in-process shared store.
///
/// Cheap to clone-by-`Arc`; the single mutex is held only for map access,
/// never across an await point.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads the live (non-expired) entry for `key`, pruning it if expired.
    fn live_value(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<String> {
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    fn parse_counter(key: &str, value: &str) -> Result<u64> {
        value.parse().map_err(|_| StoreError::CorruptValue {
            key: key.to_string(),
            reason: format!("expected integer counter, found {value:?}"),
        })
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn incr_and_get(&self, key: &str, ttl: Duration) -> Result<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("store lock poisoned");

        let next = match Self::live_value(&mut entries, key, now) {
            Some(value) => Self::parse_counter(key, &value)? + 1,
            None => 1,
        };

        let expires_at = match entries.get(key) {
            // Existing counter keeps its deadline.
            Some(entry) => entry.expires_at,
            None => Some(now + ttl),
        };

        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn decr(&self, key: &str) -> Result<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("store lock poisoned");

        let current = match Self::live_value(&mut entries, key, now) {
            Some(value) => Self::parse_counter(key, &value)?,
            None => 0,
        };
        let next = current.saturating_sub(1);

        if let Some(entry) = entries.get_mut(key) {
            entry.value = next.to_string();
        }
        Ok(next)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("store lock poisoned");
        Ok(Self::live_value(&mut entries, key, now))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("store lock poisoned");
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("store lock poisoned");

        let current = Self::live_value(&mut entries, key, now);
        if current.as_deref() != expected {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: new.to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn incr_creates_and_increments() {
        let store = MemoryStore::new();
        assert_eq!(
            store.incr_and_get("k", Duration::from_secs(60)).await.unwrap(),
            1
        );
        assert_eq!(
            store.incr_and_get("k", Duration::from_secs(60)).await.unwrap(),
            2
        );
        assert_eq!(
            store.incr_and_get("k", Duration::from_secs(60)).await.unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn decr_saturates_at_zero() {
        let store = MemoryStore::new();
        assert_eq!(store.decr("missing").await.unwrap(), 0);

        store.incr_and_get("k", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.decr("k").await.unwrap(), 0);
        assert_eq!(store.decr("k").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_counter_restarts_from_one() {
        let store = MemoryStore::new();
        store.incr_and_get("k", Duration::ZERO).await.unwrap();

        // TTL of zero means the entry is immediately expired.
        assert_eq!(
            store.incr_and_get("k", Duration::from_secs(60)).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn get_set_roundtrip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set("k", "value", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("value".to_string()));
    }

    #[tokio::test]
    async fn expired_value_reads_as_absent() {
        let store = MemoryStore::new();
        store.set("k", "value", Some(Duration::ZERO)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cas_on_absent_key() {
        let store = MemoryStore::new();

        // Wrong expectation: key is absent.
        assert!(
            !store
                .compare_and_swap("k", Some("old"), "new", None)
                .await
                .unwrap()
        );

        // Correct expectation: absent.
        assert!(
            store
                .compare_and_swap("k", None, "new", None)
                .await
                .unwrap()
        );
        assert_eq!(store.get("k").await.unwrap(), Some("new".to_string()));
    }

    #[tokio::test]
    async fn cas_only_swaps_on_match() {
        let store = MemoryStore::new();
        store.set("k", "a", None).await.unwrap();

        assert!(
            !store
                .compare_and_swap("k", Some("b"), "c", None)
                .await
                .unwrap()
        );
        assert_eq!(store.get("k").await.unwrap(), Some("a".to_string()));

        assert!(
            store
                .compare_and_swap("k", Some("a"), "c", None)
                .await
                .unwrap()
        );
        assert_eq!(store.get("k").await.unwrap(), Some("c".to_string()));
    }

    #[tokio::test]
    async fn corrupt_counter_is_an_error() {
        let store = MemoryStore::new();
        store.set("k", "not-a-number", None).await.unwrap();

        let result = store.incr_and_get("k", Duration::from_secs(60)).await;
        assert!(matches!(result, Err(StoreError::CorruptValue { .. })));
    }

    /// The atomicity guarantee the rate limiter depends on: concurrent
    /// increments never lose an update.
    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_increments_are_lossless() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();

        for _ in 0..100 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .incr_and_get("shared", Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }

        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }

        seen.sort_unstable();
        let expected: Vec<u64> = (1..=100).collect();
        // Every post-increment value is observed exactly once.
        assert_eq!(seen, expected);
    }

    /// Exactly one of many concurrent CAS attempts with the same expectation
    /// can win.
    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_cas_has_single_winner() {
        let store = Arc::new(MemoryStore::new());
        store.set("k", "start", None).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .compare_and_swap("k", Some("start"), &format!("winner-{i}"), None)
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
