//! Associative store with time-to-live expiry, pluggable eviction and release callbacks.
//!
//! The container keeps its singleton instances in a [`TieredCache`], and the
//! [`CachingInterceptor`](crate::CachingInterceptor) memoizes produced values
//! with one.
//!
//! Expiry is lazy: an overdue entry is removed when it is next touched by
//! [`TieredCache::get`] or [`TieredCache::has`], or by an explicit
//! [`TieredCache::purge_expired`] sweep.
//!
//! # Examples
//!
//! ```rust
//! use anode::{CacheOptions, EvictionPolicy, TieredCache};
//!
//! let cache = TieredCache::new(CacheOptions {
//!     capacity: Some(2),
//!     ttl: None,
//!     policy: EvictionPolicy::Fifo,
//! });
//! cache.set("a", 1);
//! cache.set("b", 2);
//! cache.set("c", 3);
//! assert!(!cache.has(&"a"));
//! assert_eq!(cache.get(&"c"), Some(3));
//! assert_eq!(cache.stats().evictions, 1);
//! ```

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{CacheError, StdError};

/// Strategy used to pick the victim when a full cache receives a new key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Evicts the entry with the oldest last access.
    #[default]
    Lru,
    /// Evicts the entry with the lowest access count.
    Lfu,
    /// Evicts the earliest inserted entry.
    Fifo,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheOptions {
    /// Maximum number of entries, unbounded when `None`.
    pub capacity: Option<usize>,
    /// Default time-to-live applied to entries set without their own.
    pub ttl: Option<Duration>,
    pub policy: EvictionPolicy,
}

/// Callback invoked exactly once when an entry leaves the cache.
pub enum Release<V> {
    Sync(Box<dyn FnOnce(V) -> Result<(), StdError> + Send>),
    Async(Box<dyn FnOnce(V) -> BoxFuture<'static, Result<(), StdError>> + Send>),
}

impl<V> Release<V> {
    pub fn sync<F>(f: F) -> Self
    where
        F: FnOnce(V) -> Result<(), StdError> + Send + 'static,
    {
        Self::Sync(Box::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: FnOnce(V) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), StdError>> + Send + 'static,
    {
        Self::Async(Box::new(move |value| Box::pin(f(value))))
    }

    fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }
}

pub struct SetOptions<V> {
    /// Overrides the cache-wide time-to-live for this entry.
    pub ttl: Option<Duration>,
    pub on_release: Option<Release<V>>,
}

impl<V> Default for SetOptions<V> {
    fn default() -> Self {
        Self {
            ttl: None,
            on_release: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

struct Entry<V> {
    value: V,
    expires_at: Option<Instant>,
    last_access: u64,
    access_count: u64,
    inserted: u64,
    release: Option<Release<V>>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|v| v <= now)
    }
}

struct CacheState<K, V> {
    entries: HashMap<K, Entry<V>>,
    // Logical clock ordering accesses and insertions.
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<K, V> CacheState<K, V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

type ReleaseErrorHandler<K> = Arc<dyn Fn(&K, CacheError) + Send + Sync>;

pub struct TieredCache<K, V> {
    options: CacheOptions,
    state: Mutex<CacheState<K, V>>,
    on_release_error: Option<ReleaseErrorHandler<K>>,
}

impl<K, V> TieredCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + 'static,
{
    pub fn new(options: CacheOptions) -> Self {
        Self {
            options,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                tick: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            on_release_error: None,
        }
    }

    /// Routes release failures of expiry and eviction to `handler`.
    ///
    /// Without a handler such failures are logged.
    pub fn with_release_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&K, CacheError) + Send + Sync + 'static,
    {
        self.on_release_error = Some(Arc::new(handler));
        self
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn set(&self, key: K, value: V) {
        self.set_with(key, value, SetOptions::default());
    }

    /// Stores `value` under `key`.
    ///
    /// A new key arriving at a full cache evicts one entry first. Replacing an
    /// existing key releases the previous entry.
    pub fn set_with(&self, key: K, value: V, options: SetOptions<V>) {
        let now = Instant::now();
        let mut removed = Vec::new();
        {
            let mut state = self.lock();
            if !state.entries.contains_key(&key)
                && let Some(capacity) = self.options.capacity
            {
                while !state.entries.is_empty() && state.entries.len() >= capacity {
                    match self.evict_one(&mut state) {
                        Some(v) => removed.push(v),
                        None => break,
                    }
                }
            }
            let tick = state.next_tick();
            let ttl = options.ttl.or(self.options.ttl);
            let entry = Entry {
                value,
                expires_at: ttl.map(|v| now + v),
                last_access: tick,
                access_count: 0,
                inserted: tick,
                release: options.on_release,
            };
            if let Some(previous) = state.entries.insert(key.clone(), entry) {
                removed.push((key, previous));
            }
        }
        for (key, entry) in removed {
            self.release_automatic(key, entry);
        }
    }

    /// Returns the value for `key`, counting a hit or a miss.
    ///
    /// An overdue entry is removed and counted as a miss.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let expired = {
            let mut state = self.lock();
            let tick = state.next_tick();
            match state.entries.get_mut(key) {
                Some(entry) if !entry.is_expired(now) => {
                    entry.last_access = tick;
                    entry.access_count += 1;
                    let value = entry.value.clone();
                    state.hits += 1;
                    return Some(value);
                }
                Some(_) => {
                    state.misses += 1;
                    state.entries.remove_entry(key)
                }
                None => {
                    state.misses += 1;
                    return None;
                }
            }
        };
        if let Some((key, entry)) = expired {
            tracing::trace!(key = ?key, "Cache entry expired");
            self.release_automatic(key, entry);
        }
        None
    }

    /// Checks presence of `key` without touching statistics.
    pub fn has(&self, key: &K) -> bool {
        let now = Instant::now();
        let expired = {
            let mut state = self.lock();
            match state.entries.get(key) {
                Some(entry) if !entry.is_expired(now) => return true,
                Some(_) => state.entries.remove_entry(key),
                None => return false,
            }
        };
        if let Some((key, entry)) = expired {
            self.release_automatic(key, entry);
        }
        false
    }

    /// Removes `key`, running its release callback.
    ///
    /// Release failures propagate to the caller. Entries with asynchronous
    /// release callbacks are left in place and must be removed with
    /// [`TieredCache::delete_async`].
    pub fn delete(&self, key: &K) -> Result<bool, CacheError> {
        let removed = {
            let mut state = self.lock();
            if let Some(entry) = state.entries.get(key)
                && entry.release.as_ref().is_some_and(Release::is_async)
            {
                return Err(CacheError::AsyncRelease {
                    key: format!("{key:?}"),
                });
            }
            state.entries.remove_entry(key)
        };
        match removed {
            Some((key, entry)) => {
                release_sync(&key, entry)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes `key`, awaiting its release callback.
    pub async fn delete_async(&self, key: &K) -> Result<bool, CacheError> {
        let removed = self.lock().entries.remove_entry(key);
        match removed {
            Some((key, entry)) => {
                release_async(&key, entry).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes every entry and resets statistics.
    ///
    /// Synchronous release callbacks run in place and the first failure is
    /// returned after all entries were released. Asynchronous callbacks are
    /// spawned on the current runtime.
    pub fn clear(&self) -> Result<(), CacheError> {
        let entries = self.drain();
        let mut first_error = None;
        for (key, entry) in entries {
            if entry.release.as_ref().is_some_and(Release::is_async) {
                self.release_automatic(key, entry);
                continue;
            }
            if let Err(err) = release_sync(&key, entry) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Removes every entry awaiting all release callbacks and resets statistics.
    pub async fn clear_async(&self) -> Result<(), CacheError> {
        let entries = self.drain();
        let mut first_error = None;
        for (key, entry) in entries {
            if let Err(err) = release_async(&key, entry).await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Removes all overdue entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<_> = {
            let mut state = self.lock();
            let keys: Vec<_> = state
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| state.entries.remove_entry(&key))
                .collect()
        };
        let count = expired.len();
        for (key, entry) in expired {
            self.release_automatic(key, entry);
        }
        count
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            size: state.entries.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<K> {
        self.lock().entries.keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<K, V>> {
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    fn drain(&self) -> Vec<(K, Entry<V>)> {
        let mut state = self.lock();
        state.hits = 0;
        state.misses = 0;
        state.evictions = 0;
        let mut entries: Vec<_> = state.entries.drain().collect();
        // Release in insertion order so teardown is deterministic.
        entries.sort_by_key(|(_, entry)| entry.inserted);
        entries
    }

    fn evict_one(&self, state: &mut CacheState<K, V>) -> Option<(K, Entry<V>)> {
        let victim = match self.options.policy {
            EvictionPolicy::Lru => state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone()),
            EvictionPolicy::Lfu => state
                .entries
                .iter()
                .min_by_key(|(_, entry)| (entry.access_count, entry.last_access))
                .map(|(key, _)| key.clone()),
            EvictionPolicy::Fifo => state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted)
                .map(|(key, _)| key.clone()),
        }?;
        state.evictions += 1;
        tracing::trace!(key = ?victim, policy = ?self.options.policy, "Evicting cache entry");
        state.entries.remove_entry(&victim)
    }

    fn release_automatic(&self, key: K, entry: Entry<V>) {
        let Some(release) = entry.release else {
            return;
        };
        match release {
            Release::Sync(f) => {
                if let Err(err) = f(entry.value) {
                    let err = CacheError::Release {
                        key: format!("{key:?}"),
                        source: err,
                    };
                    report_release_error(self.on_release_error.as_ref(), &key, err);
                }
            }
            Release::Async(f) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let handler = self.on_release_error.clone();
                    let future = f(entry.value);
                    handle.spawn(async move {
                        if let Err(err) = future.await {
                            let err = CacheError::Release {
                                key: format!("{key:?}"),
                                source: err,
                            };
                            report_release_error(handler.as_ref(), &key, err);
                        }
                    });
                }
                Err(_) => {
                    let err = CacheError::AsyncRelease {
                        key: format!("{key:?}"),
                    };
                    report_release_error(self.on_release_error.as_ref(), &key, err);
                }
            },
        }
    }
}

fn report_release_error<K: Debug>(
    handler: Option<&ReleaseErrorHandler<K>>,
    key: &K,
    err: CacheError,
) {
    match handler {
        Some(handler) => handler(key, err),
        None => tracing::error!(key = ?key, "Cannot release cache entry: {err}"),
    }
}

fn release_sync<K: Debug, V>(key: &K, entry: Entry<V>) -> Result<(), CacheError> {
    match entry.release {
        Some(Release::Sync(f)) => f(entry.value).map_err(|source| CacheError::Release {
            key: format!("{key:?}"),
            source,
        }),
        Some(Release::Async(_)) => Err(CacheError::AsyncRelease {
            key: format!("{key:?}"),
        }),
        None => Ok(()),
    }
}

async fn release_async<K: Debug, V>(key: &K, entry: Entry<V>) -> Result<(), CacheError> {
    let result = match entry.release {
        Some(Release::Sync(f)) => f(entry.value),
        Some(Release::Async(f)) => f(entry.value).await,
        None => Ok(()),
    };
    result.map_err(|source| CacheError::Release {
        key: format!("{key:?}"),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn bounded(capacity: usize, policy: EvictionPolicy) -> TieredCache<&'static str, i32> {
        TieredCache::new(CacheOptions {
            capacity: Some(capacity),
            ttl: None,
            policy,
        })
    }

    #[test]
    fn test_lru_evicts_oldest_access() {
        let cache = bounded(3, EvictionPolicy::Lru);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("c", 3);
        assert_eq!(cache.get(&"a"), Some(1));
        cache.set("d", 4);
        assert!(!cache.has(&"b"));
        assert!(cache.has(&"a"));
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_lfu_evicts_lowest_count() {
        let cache = bounded(3, EvictionPolicy::Lfu);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("c", 3);
        cache.get(&"a");
        cache.get(&"a");
        cache.get(&"b");
        cache.set("d", 4);
        assert!(!cache.has(&"c"));
        assert!(cache.has(&"a"));
        assert!(cache.has(&"b"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_fifo_ignores_access() {
        let cache = bounded(3, EvictionPolicy::Fifo);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("c", 3);
        cache.get(&"a");
        cache.set("d", 4);
        assert!(!cache.has(&"a"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let released = Arc::new(AtomicUsize::new(0));
        let cache = TieredCache::new(CacheOptions {
            capacity: None,
            ttl: Some(Duration::from_secs(60)),
            policy: EvictionPolicy::Lru,
        });
        let counter = released.clone();
        cache.set_with(
            "a",
            1,
            SetOptions {
                ttl: None,
                on_release: Some(Release::sync(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })),
            },
        );
        cache.set_with(
            "b",
            2,
            SetOptions {
                ttl: Some(Duration::from_secs(5)),
                on_release: None,
            },
        );
        cache.set_with(
            "c",
            3,
            SetOptions {
                ttl: Some(Duration::from_secs(600)),
                on_release: None,
            },
        );

        tokio::time::advance(Duration::from_secs(6)).await;
        // Overdue entries stay until they are touched.
        assert_eq!(cache.len(), 3);
        assert!(!cache.has(&"b"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().misses, 0);
        assert_eq!(cache.get(&"a"), Some(1));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(cache.get(&"a"), None);
        assert_eq!(cache.len(), 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(&"c"), Some(3));

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = TieredCache::new(CacheOptions {
            capacity: None,
            ttl: Some(Duration::from_millis(100)),
            policy: EvictionPolicy::Fifo,
        });
        cache.set("a", 1);
        tokio::time::advance(Duration::from_millis(50)).await;
        cache.set("b", 2);
        tokio::time::advance(Duration::from_millis(60)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.keys(), vec!["b"]);
        assert_eq!(cache.stats().misses, 0);
    }

    #[test]
    fn test_replace_does_not_evict() {
        let cache = bounded(2, EvictionPolicy::Fifo);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("a", 10);
        assert_eq!(cache.get(&"a"), Some(10));
        assert_eq!(cache.get(&"b"), Some(2));
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_release_runs_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let cache = bounded(1, EvictionPolicy::Lru);
        let counter = released.clone();
        cache.set_with(
            "a",
            1,
            SetOptions {
                ttl: None,
                on_release: Some(Release::sync(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })),
            },
        );
        cache.set("b", 2);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(!cache.delete(&"a").unwrap());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_errors_on_eviction_are_routed() {
        let reported = Arc::new(Mutex::new(Vec::new()));
        let sink = reported.clone();
        let cache = bounded(1, EvictionPolicy::Lru).with_release_error_handler(move |key, _| {
            sink.lock().unwrap().push(*key);
        });
        cache.set_with(
            "a",
            1,
            SetOptions {
                ttl: None,
                on_release: Some(Release::sync(|_| Err("boom".into()))),
            },
        );
        cache.set("b", 2);
        assert_eq!(*reported.lock().unwrap(), vec!["a"]);
    }

    #[test]
    fn test_release_errors_on_delete_propagate() {
        let cache = bounded(4, EvictionPolicy::Lru);
        cache.set_with(
            "a",
            1,
            SetOptions {
                ttl: None,
                on_release: Some(Release::sync(|_| Err("boom".into()))),
            },
        );
        assert!(matches!(
            cache.delete(&"a"),
            Err(CacheError::Release { .. })
        ));
        assert!(!cache.has(&"a"));
    }

    #[test]
    fn test_sync_delete_rejects_async_release() {
        let cache = bounded(4, EvictionPolicy::Lru);
        cache.set_with(
            "a",
            1,
            SetOptions {
                ttl: None,
                on_release: Some(Release::from_async(|_| async { Ok(()) })),
            },
        );
        assert!(matches!(
            cache.delete(&"a"),
            Err(CacheError::AsyncRelease { .. })
        ));
        assert!(cache.has(&"a"));
    }

    #[test]
    fn test_clear_resets_stats() {
        let cache = bounded(1, EvictionPolicy::Lru);
        cache.set("a", 1);
        cache.get(&"a");
        cache.get(&"x");
        cache.set("b", 2);
        cache.clear().unwrap();
        assert_eq!(cache.stats(), CacheStats::default());
    }
}
