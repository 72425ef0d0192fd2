//! Fixed-window request counters.
//!
//! Keys expire `window` seconds after their first increment, after which the
//! next increment starts again at 1. Redis is the shared backend; the
//! in-process map covers single-instance deployments and Redis outages.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

use crate::clock::{bounded_seconds, Clock};

/// Live keys above which an increment triggers an inline sweep.
pub const DEFAULT_MAX_KEYS: usize = 10_000;
/// Minimum gap between two inline sweeps of a crowded map.
const INLINE_SWEEP_INTERVAL_MS: i64 = 1_000;
pub const DEFAULT_REDIS_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(250);

const INCREMENT_SCRIPT: &str = r"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return current
";

#[derive(Debug, thiserror::Error)]
pub enum CounterError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("redis call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Count this hit and return the total for the current window.
    async fn increment(&self, key: &str, window_seconds: u64) -> Result<u64, CounterError>;

    async fn get_count(&self, key: &str) -> Result<u64, CounterError>;

    /// Seconds until the window for `key` closes; 0 when nothing is counted.
    async fn retry_after(&self, key: &str, window_seconds: u64) -> Result<u64, CounterError>;

    async fn reset(&self, key: &str) -> Result<(), CounterError>;
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    count: u64,
    expires_at: DateTime<Utc>,
}

pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, Entry>>,
    last_inline_sweep: Mutex<Option<DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
    max_keys: usize,
}

impl MemoryCounterStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            last_inline_sweep: Mutex::new(None),
            clock,
            max_keys: DEFAULT_MAX_KEYS,
        }
    }

    #[must_use]
    pub fn with_max_keys(mut self, max_keys: usize) -> Self {
        self.max_keys = max_keys;
        self
    }

    /// Drop expired keys, returning how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a crowded map may be swept now; records the sweep if so.
    fn claim_inline_sweep(&self, now: DateTime<Utc>) -> bool {
        let mut last = self
            .last_inline_sweep
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let due = last.map_or(true, |at| {
            now - at >= Duration::milliseconds(INLINE_SWEEP_INTERVAL_MS)
        });
        if due {
            *last = Some(now);
        }
        due
    }

    fn live(&self, key: &str) -> Option<Entry> {
        let now = self.clock.now();
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .copied()
            .filter(|entry| entry.expires_at > now)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, window_seconds: u64) -> Result<u64, CounterError> {
        let now = self.clock.now();
        let window = Duration::seconds(bounded_seconds(
            i64::try_from(window_seconds).unwrap_or(i64::MAX),
        ));
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if entries.len() > self.max_keys && self.claim_inline_sweep(now) {
            entries.retain(|_, entry| entry.expires_at > now);
        }

        let entry = entries.entry(key.to_string()).or_insert(Entry {
            count: 0,
            expires_at: now + window,
        });
        if entry.expires_at <= now {
            *entry = Entry {
                count: 0,
                expires_at: now + window,
            };
        }
        entry.count += 1;
        Ok(entry.count)
    }

    async fn get_count(&self, key: &str) -> Result<u64, CounterError> {
        Ok(self.live(key).map_or(0, |entry| entry.count))
    }

    async fn retry_after(&self, key: &str, _window_seconds: u64) -> Result<u64, CounterError> {
        let now = self.clock.now();
        Ok(self.live(key).map_or(0, |entry| {
            let millis = (entry.expires_at - now).num_milliseconds().max(0);
            u64::try_from(millis).unwrap_or(0).div_ceil(1000)
        }))
    }

    async fn reset(&self, key: &str) -> Result<(), CounterError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    script: Script,
    timeout: std::time::Duration,
}

impl RedisCounterStore {
    /// Connect and keep a self-healing connection manager.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the first connection fails.
    pub async fn connect(url: &str) -> Result<Self, CounterError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            script: Script::new(INCREMENT_SCRIPT),
            timeout: DEFAULT_REDIS_TIMEOUT,
        })
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, CounterError>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CounterError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, window_seconds: u64) -> Result<u64, CounterError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.script.key(key);
        invocation.arg(window_seconds.max(1));
        self.bounded(async move { invocation.invoke_async(&mut conn).await })
            .await
    }

    async fn get_count(&self, key: &str) -> Result<u64, CounterError> {
        let mut conn = self.conn.clone();
        let count: Option<u64> = self.bounded(async move { conn.get(key).await }).await?;
        Ok(count.unwrap_or(0))
    }

    async fn retry_after(&self, key: &str, window_seconds: u64) -> Result<u64, CounterError> {
        let mut conn = self.conn.clone();
        let ttl: i64 = self.bounded(async move { conn.ttl(key).await }).await?;
        // -2: key missing, -1: key without expiry.
        Ok(match ttl {
            -2 => 0,
            -1 => window_seconds,
            ttl => u64::try_from(ttl).unwrap_or(0),
        })
    }

    async fn reset(&self, key: &str) -> Result<(), CounterError> {
        let mut conn = self.conn.clone();
        let _: i64 = self.bounded(async move { conn.del(key).await }).await?;
        Ok(())
    }
}

/// Shared counters first (Redis in production), the in-process map whenever
/// they fail.
pub struct FallbackCounterStore {
    primary: Arc<dyn CounterStore>,
    fallback: Arc<MemoryCounterStore>,
}

impl FallbackCounterStore {
    #[must_use]
    pub fn new(primary: Arc<dyn CounterStore>, fallback: Arc<MemoryCounterStore>) -> Self {
        Self { primary, fallback }
    }
}

fn log_fallback(op: &str, key: &str, err: &CounterError) {
    warn!(op, key, "Shared counter unavailable, using in-process counters: {err}");
}

#[async_trait]
impl CounterStore for FallbackCounterStore {
    async fn increment(&self, key: &str, window_seconds: u64) -> Result<u64, CounterError> {
        match self.primary.increment(key, window_seconds).await {
            Ok(count) => Ok(count),
            Err(err) => {
                log_fallback("increment", key, &err);
                self.fallback.increment(key, window_seconds).await
            }
        }
    }

    async fn get_count(&self, key: &str) -> Result<u64, CounterError> {
        match self.primary.get_count(key).await {
            Ok(count) => Ok(count),
            Err(err) => {
                log_fallback("get_count", key, &err);
                self.fallback.get_count(key).await
            }
        }
    }

    async fn retry_after(&self, key: &str, window_seconds: u64) -> Result<u64, CounterError> {
        match self.primary.retry_after(key, window_seconds).await {
            Ok(seconds) => Ok(seconds),
            Err(err) => {
                log_fallback("retry_after", key, &err);
                self.fallback.retry_after(key, window_seconds).await
            }
        }
    }

    async fn reset(&self, key: &str) -> Result<(), CounterError> {
        // Clear both so a recovered Redis and the fallback agree.
        let local = self.fallback.reset(key).await;
        match self.primary.reset(key).await {
            Ok(()) => local,
            Err(err) => {
                debug!("Redis reset failed for {key}: {err}");
                local
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (MemoryCounterStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (MemoryCounterStore::new(clock.clone()), clock)
    }

    #[tokio::test]
    async fn counts_within_the_window_then_resets() {
        let (store, clock) = store();
        for expected in 1..=5 {
            assert_eq!(store.increment("rl:ip:a", 60).await.unwrap(), expected);
        }
        assert_eq!(store.get_count("rl:ip:a").await.unwrap(), 5);

        clock.advance(Duration::seconds(60));
        assert_eq!(store.get_count("rl:ip:a").await.unwrap(), 0);
        assert_eq!(store.increment("rl:ip:a", 60).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn retry_after_counts_down() {
        let (store, clock) = store();
        assert_eq!(store.retry_after("rl:ip:b", 60).await.unwrap(), 0);

        store.increment("rl:ip:b", 60).await.unwrap();
        clock.advance(Duration::milliseconds(20_500));
        assert_eq!(store.retry_after("rl:ip:b", 60).await.unwrap(), 40);
    }

    #[tokio::test]
    async fn reset_forgets_the_key() {
        let (store, _clock) = store();
        store.increment("rl:ip:c", 60).await.unwrap();
        store.increment("rl:ip:c", 60).await.unwrap();
        store.reset("rl:ip:c").await.unwrap();
        assert_eq!(store.increment("rl:ip:c", 60).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn crowded_maps_sweep_on_increment() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemoryCounterStore::new(clock.clone()).with_max_keys(3);
        for key in ["a", "b", "c", "d"] {
            store.increment(key, 10).await.unwrap();
        }
        assert_eq!(store.len(), 4);

        clock.advance(Duration::seconds(11));
        store.increment("e", 10).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn crowded_maps_sweep_at_most_once_a_second() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemoryCounterStore::new(clock.clone()).with_max_keys(1);
        store.increment("a", 1).await.unwrap();
        clock.advance(Duration::milliseconds(500));
        store.increment("b", 10).await.unwrap();
        // Crowded: sweeps, but nothing has expired yet.
        store.increment("c", 10).await.unwrap();
        assert_eq!(store.len(), 3);

        // "a" is gone but the last sweep is too recent.
        clock.advance(Duration::milliseconds(600));
        store.increment("d", 10).await.unwrap();
        assert_eq!(store.len(), 4);

        clock.advance(Duration::milliseconds(500));
        store.increment("e", 10).await.unwrap();
        assert_eq!(store.len(), 4);
        assert_eq!(store.get_count("a").await.unwrap(), 0);
    }

    struct UnreachableCounters;

    #[async_trait]
    impl CounterStore for UnreachableCounters {
        async fn increment(&self, _key: &str, _window_seconds: u64) -> Result<u64, CounterError> {
            Err(CounterError::Timeout(DEFAULT_REDIS_TIMEOUT))
        }

        async fn get_count(&self, _key: &str) -> Result<u64, CounterError> {
            Err(CounterError::Timeout(DEFAULT_REDIS_TIMEOUT))
        }

        async fn retry_after(&self, _key: &str, _window_seconds: u64) -> Result<u64, CounterError> {
            Err(CounterError::Timeout(DEFAULT_REDIS_TIMEOUT))
        }

        async fn reset(&self, _key: &str) -> Result<(), CounterError> {
            Err(CounterError::Timeout(DEFAULT_REDIS_TIMEOUT))
        }
    }

    #[tokio::test]
    async fn failing_primary_routes_to_the_local_map() {
        let (memory, clock) = store();
        let memory = Arc::new(memory);
        let store = FallbackCounterStore::new(Arc::new(UnreachableCounters), memory.clone());

        assert_eq!(store.increment("rl:ip:d", 60).await.unwrap(), 1);
        assert_eq!(store.increment("rl:ip:d", 60).await.unwrap(), 2);
        assert_eq!(memory.get_count("rl:ip:d").await.unwrap(), 2);
        assert_eq!(store.get_count("rl:ip:d").await.unwrap(), 2);

        clock.advance(Duration::seconds(15));
        assert_eq!(store.retry_after("rl:ip:d", 60).await.unwrap(), 45);

        store.reset("rl:ip:d").await.unwrap();
        assert!(memory.is_empty());
    }

    #[tokio::test]
    async fn periodic_sweep_removes_only_expired_keys() {
        let (store, clock) = store();
        store.increment("short", 5).await.unwrap();
        store.increment("long", 120).await.unwrap();
        clock.advance(Duration::seconds(6));
        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.get_count("long").await.unwrap(), 1);
    }
}
