//! Time-bounded cache of resolved hierarchy subtrees.
//!
//! Keys are qualified resource paths (`folders/123`, `organizations/9`), values the leaf project
//! ids beneath them. One cache is built at startup and shared by every pipeline run, so repeated
//! walks of the same subtree are amortized across runs until the entry ages out.
//!
//! Entries older than `max_age` are never returned; moka drops them on read. Concurrent misses on
//! the same key are coalesced: the first caller computes the value and the rest await its result.

use moka::future::Cache;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOutcome::Hit => "hit",
            CacheOutcome::Miss => "miss",
        }
    }
}

#[derive(Clone)]
pub struct HierarchyCache {
    entries: Cache<String, Arc<Vec<String>>>,
}

impl HierarchyCache {
    pub fn new(max_age: Duration, max_capacity: u64) -> Self {
        let entries = Cache::builder().max_capacity(max_capacity).time_to_live(max_age).build();
        Self { entries }
    }

    /// Returns the accounts stored under `key` if the entry is younger than `max_age`.
    pub async fn get(&self, key: &str) -> Option<Arc<Vec<String>>> {
        self.entries.get(key).await
    }

    /// Stores `accounts` under `key` with a fresh timestamp.
    pub async fn insert(&self, key: impl Into<String>, accounts: Vec<String>) {
        self.entries.insert(key.into(), Arc::new(accounts)).await;
    }

    /// Returns the cached accounts for `key`, or runs `resolve` and caches its result.
    ///
    /// Only one `resolve` runs per key at a time; other callers wait for it and share the value
    /// or the error. Errors are not cached.
    pub async fn get_or_resolve<F, E>(&self, key: &str, resolve: F) -> Result<(Arc<Vec<String>>, CacheOutcome), E>
    where
        F: Future<Output = Result<Vec<String>, E>>,
        E: Clone + Send + Sync + 'static,
    {
        let entry = self
            .entries
            .entry_by_ref(key)
            .or_try_insert_with(async move { resolve.await.map(Arc::new) })
            .await
            .map_err(|e| (*e).clone())?;

        let outcome = if entry.is_fresh() {
            CacheOutcome::Miss
        } else {
            CacheOutcome::Hit
        };
        debug!(key, outcome = outcome.as_str(), "hierarchy cache lookup");

        Ok((entry.into_value(), outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn accounts(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_get_returns_last_written_value() {
        let cache = HierarchyCache::new(Duration::from_secs(60), 100);

        cache.insert("folders/1", accounts(&["p1"])).await;
        cache.insert("folders/1", accounts(&["p1", "p2"])).await;

        let value = cache.get("folders/1").await.unwrap();
        assert_eq!(*value, accounts(&["p1", "p2"]));
        assert!(cache.get("folders/2").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent_and_stays_absent() {
        let cache = HierarchyCache::new(Duration::from_millis(50), 100);
        cache.insert("organizations/9", accounts(&["p1"])).await;
        assert!(cache.get("organizations/9").await.is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(cache.get("organizations/9").await.is_none());
        assert!(cache.get("organizations/9").await.is_none());
    }

    #[tokio::test]
    async fn test_get_or_resolve_reports_hit_and_miss() {
        let cache = HierarchyCache::new(Duration::from_secs(60), 100);

        let (value, outcome) = cache
            .get_or_resolve("folders/1", async { Ok::<_, String>(accounts(&["p1"])) })
            .await
            .unwrap();
        assert_eq!(outcome, CacheOutcome::Miss);
        assert_eq!(*value, accounts(&["p1"]));

        let (value, outcome) = cache
            .get_or_resolve("folders/1", async { Ok::<_, String>(accounts(&["never"])) })
            .await
            .unwrap();
        assert_eq!(outcome, CacheOutcome::Hit);
        assert_eq!(*value, accounts(&["p1"]));
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache = HierarchyCache::new(Duration::from_secs(60), 100);

        let err = cache
            .get_or_resolve("folders/1", async { Err::<Vec<String>, _>("boom".to_string()) })
            .await
            .unwrap_err();
        assert_eq!(err, "boom");
        assert!(cache.get("folders/1").await.is_none());

        let (_, outcome) = cache
            .get_or_resolve("folders/1", async { Ok::<_, String>(accounts(&["p1"])) })
            .await
            .unwrap();
        assert_eq!(outcome, CacheOutcome::Miss);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_resolve_once() {
        let cache = HierarchyCache::new(Duration::from_secs(60), 100);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_resolve("organizations/9", async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, String>(accounts(&["p1", "p2"]))
                    })
                    .await
                    .unwrap()
                    .0
            }));
        }

        for handle in handles {
            assert_eq!(*handle.await.unwrap(), accounts(&["p1", "p2"]));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
