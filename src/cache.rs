//! Short-lived read-through cache for hot lookups (IP rules).
//!
//! Callers go through [`cache_aside`]: read the cache, fall back to the loader,
//! store the result. Writers call [`TtlCache::invalidate`] for the keys they touch.

use moka::sync::Cache;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);
const DEFAULT_MAX_ENTRIES: u64 = 10_000;

/// Bounded cache whose entries live for a fixed TTL. A zero TTL disables it.
pub struct TtlCache<K, V> {
    inner: Option<Cache<K, V>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self::build(ttl, DEFAULT_MAX_ENTRIES)
    }

    /// Same TTL, different capacity.
    #[must_use]
    pub fn with_max_entries(self, max_entries: u64) -> Self {
        match self.inner.as_ref().and_then(|cache| cache.policy().time_to_live()) {
            Some(ttl) => Self::build(ttl, max_entries),
            None => self,
        }
    }

    fn build(ttl: Duration, max_entries: u64) -> Self {
        if ttl.is_zero() {
            return Self { inner: None };
        }
        Self {
            inner: Some(
                Cache::builder()
                    .max_capacity(max_entries)
                    .time_to_live(ttl)
                    .build(),
            ),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.as_ref()?.get(key)
    }

    pub fn insert(&self, key: K, value: V) {
        if let Some(cache) = &self.inner {
            cache.insert(key, value);
        }
    }

    pub fn invalidate(&self, key: &K) {
        if let Some(cache) = &self.inner {
            cache.invalidate(key);
        }
    }

    pub fn clear(&self) {
        if let Some(cache) = &self.inner {
            cache.invalidate_all();
        }
    }

    /// Live entries after pending evictions have been applied.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.inner.as_ref().map_or(0, |cache| {
            cache.run_pending_tasks();
            cache.entry_count()
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Return the cached value for `key`, loading and caching it on a miss.
///
/// Loader errors are returned as-is and nothing is cached.
///
/// # Errors
/// Propagates the loader's error.
pub async fn cache_aside<K, V, E, F, Fut>(cache: &TtlCache<K, V>, key: K, load: F) -> Result<V, E>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, E>>,
{
    if let Some(value) = cache.get(&key) {
        return Ok(value);
    }
    let value = load().await?;
    cache.insert(key, value.clone());
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn loads_once_until_invalidated() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60));
        let counter = AtomicUsize::new(0);
        let loads = &counter;
        let load = move || async move {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ()>(7)
        };

        assert_eq!(cache_aside(&cache, "k".to_string(), load).await, Ok(7));
        assert_eq!(cache_aside(&cache, "k".to_string(), load).await, Ok(7));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        cache.invalidate(&"k".to_string());
        assert_eq!(cache_aside(&cache, "k".to_string(), load).await, Ok(7));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_secs(60));
        let failed = cache_aside(&cache, "k", || async { Err::<u32, _>("down") }).await;
        assert_eq!(failed, Err("down"));
        assert!(cache.is_empty());
    }

    #[test]
    fn zero_ttl_disables_caching() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::ZERO).with_max_entries(5);
        cache.insert("k", 1);
        assert_eq!(cache.get(&"k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn entries_expire_after_the_ttl() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_millis(50));
        cache.insert("k", 1);
        assert_eq!(cache.get(&"k"), Some(1));
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(cache.get(&"k"), None);
    }

    #[test]
    fn capacity_is_bounded() {
        let cache: TtlCache<u32, u32> = TtlCache::new(Duration::from_secs(60)).with_max_entries(2);
        for key in 0..50 {
            cache.insert(key, key);
        }
        assert!(cache.len() <= 2);

        cache.clear();
        assert!((0..50).all(|key| cache.get(&key).is_none()));
    }
}
