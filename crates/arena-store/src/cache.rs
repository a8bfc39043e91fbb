//! Read-through cache for hot lookups, backed by [`moka`].
//!
//! A [`CacheLayer`] sits in front of a store read that is repeated far
//! more often than its key is written (resolving a session token to a
//! user, for instance). Only hits are cached; a lookup that finds nothing
//! is retried against the store next time. Callers that change the
//! underlying record must [`CacheLayer::invalidate`] it.
//!
//! A load that overlaps an invalidation never leaves its result behind:
//! [`CacheLayer::get_or_load`] compares the layer's invalidation
//! generation before the load and after its insert, and drops the entry if
//! any invalidation happened in between. The generation is shared by all
//! keys, so an unrelated invalidation only costs an extra miss.
//!
//! Invalidation is local to one layer and its clones. Another process, or
//! a layer built separately over the same store, only sees the change once
//! its own entry expires.

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tracing::debug;

use crate::error::StoreResult;

// ── stats ────────────────────────────────────────────────────────────

/// Hit and miss counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Fraction of lookups served from memory, `0.0` before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits() + self.misses();
        if total == 0 {
            0.0
        } else {
            self.hits() as f64 / total as f64
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits={} misses={} rate={:.1}%",
            self.hits(),
            self.misses(),
            self.hit_rate() * 100.0
        )
    }
}

// ── layer ────────────────────────────────────────────────────────────

/// Bounded, time-limited cache of `K -> V`.
///
/// ```ignore
/// let sessions: CacheLayer<String, User> = CacheLayer::builder("sessions")
///     .max_capacity(10_000)
///     .ttl(Duration::from_secs(60))
///     .build();
///
/// let user = sessions
///     .get_or_load(token.clone(), || async { load_user(&token).await })
///     .await?;
/// ```
pub struct CacheLayer<K, V> {
    name: &'static str,
    inner: Cache<K, V>,
    stats: Arc<CacheStats>,
    /// Bumped by every invalidation.
    generation: Arc<AtomicU64>,
}

impl<K, V> Clone for CacheLayer<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: self.inner.clone(),
            stats: Arc::clone(&self.stats),
            generation: Arc::clone(&self.generation),
        }
    }
}

impl<K, V> CacheLayer<K, V>
where
    K: Hash + Eq + Clone + fmt::Display + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn builder(name: &'static str) -> CacheLayerBuilder {
        CacheLayerBuilder {
            name,
            max_capacity: 10_000,
            ttl: Duration::from_secs(300),
        }
    }

    /// The cached value for `key`, if any.
    pub async fn get(&self, key: &K) -> Option<V> {
        let value = self.inner.get(key).await;
        if value.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        debug!(cache = self.name, %key, hit = value.is_some(), "cache lookup");
        value
    }

    pub async fn insert(&self, key: K, value: V) {
        self.inner.insert(key, value).await;
    }

    /// Drop `key` so the next lookup reads the store.
    ///
    /// Call it after the store write: loads still in flight are then
    /// prevented from caching what they read before the write.
    pub async fn invalidate(&self, key: &K) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.invalidate(key).await;
        debug!(cache = self.name, %key, "cache invalidate");
    }

    /// Serve `key` from memory, or run `load` and remember a `Some` result.
    pub async fn get_or_load<F, Fut>(&self, key: K, load: F) -> StoreResult<Option<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<Option<V>>>,
    {
        if let Some(value) = self.get(&key).await {
            return Ok(Some(value));
        }
        let before = self.generation.load(Ordering::SeqCst);
        let loaded = load().await?;
        if let Some(value) = &loaded
            && self.generation.load(Ordering::SeqCst) == before
        {
            self.insert(key.clone(), value.clone()).await;
            // An invalidation between the check and the insert may have run
            // before the entry existed; undo the insert in that case.
            if self.generation.load(Ordering::SeqCst) != before {
                self.inner.invalidate(&key).await;
                debug!(cache = self.name, %key, "discarded load raced by invalidate");
            }
        }
        Ok(loaded)
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

/// Builder for [`CacheLayer`].
pub struct CacheLayerBuilder {
    name: &'static str,
    max_capacity: u64,
    ttl: Duration,
}

impl CacheLayerBuilder {
    pub fn max_capacity(mut self, cap: u64) -> Self {
        self.max_capacity = cap;
        self
    }

    /// How long an entry may be served before it is re-read.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn build<K, V>(self) -> CacheLayer<K, V>
    where
        K: Hash + Eq + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        debug!(
            name = self.name,
            max_capacity = self.max_capacity,
            ttl_secs = self.ttl.as_secs(),
            "cache layer created"
        );
        CacheLayer {
            name: self.name,
            inner: Cache::builder()
                .max_capacity(self.max_capacity)
                .time_to_live(self.ttl)
                .build(),
            stats: Arc::new(CacheStats::default()),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn make_cache() -> CacheLayer<String, u64> {
        CacheLayer::<String, u64>::builder("test")
            .max_capacity(100)
            .ttl(Duration::from_secs(60))
            .build()
    }

    #[tokio::test]
    async fn loader_runs_once_for_a_hit() {
        let cache = make_cache();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_load("token".to_string(), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(7))
                })
                .await
                .unwrap();
            assert_eq!(value, Some(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits(), 2);
        assert_eq!(cache.stats().misses(), 1);
    }

    #[tokio::test]
    async fn absent_results_are_not_cached() {
        let cache = make_cache();
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let value = cache
                .get_or_load("ghost".to_string(), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(None)
                })
                .await
                .unwrap();
            assert_eq!(value, None);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_reload() {
        let cache = make_cache();
        cache.insert("k".to_string(), 1).await;
        cache.invalidate(&"k".to_string()).await;

        let value = cache
            .get_or_load("k".to_string(), || async { Ok(Some(2)) })
            .await
            .unwrap();
        assert_eq!(value, Some(2));
    }

    #[tokio::test]
    async fn load_overlapping_invalidate_is_not_cached() {
        let cache = make_cache();
        let key = "session".to_string();

        let value = cache
            .get_or_load(key.clone(), || async {
                // The record is rewritten and invalidated while this read
                // is still in flight.
                cache.invalidate(&key).await;
                Ok(Some(1))
            })
            .await
            .unwrap();
        assert_eq!(value, Some(1));
        assert!(cache.get(&key).await.is_none());

        let fresh = cache
            .get_or_load(key.clone(), || async { Ok(Some(2)) })
            .await
            .unwrap();
        assert_eq!(fresh, Some(2));
        assert_eq!(cache.get(&key).await, Some(2));
    }

    #[tokio::test]
    async fn clones_share_invalidation() {
        let cache = make_cache();
        let other = cache.clone();
        cache.insert("k".to_string(), 1).await;
        other.invalidate(&"k".to_string()).await;
        assert!(cache.get(&"k".to_string()).await.is_none());
    }

    #[tokio::test]
    async fn loader_errors_propagate() {
        let cache = make_cache();
        let result = cache
            .get_or_load("k".to_string(), || async {
                Err(crate::StoreError::Closed)
            })
            .await;
        assert!(matches!(result, Err(crate::StoreError::Closed)));
        assert!(cache.get(&"k".to_string()).await.is_none());
    }

    #[test]
    fn stats_display_and_empty_rate() {
        let stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 0.0);
        stats.hits.store(3, Ordering::Relaxed);
        stats.misses.store(1, Ordering::Relaxed);
        assert_eq!(stats.to_string(), "hits=3 misses=1 rate=75.0%");
    }
}
