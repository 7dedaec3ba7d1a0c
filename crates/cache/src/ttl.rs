//! In-process TTL cache backed by DashMap for lock-free concurrent access.
//! Entries expire lazily: a stale entry is dropped on the read that finds it.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

/// Cache whose entries are valid for a bounded age after insertion.
/// Clones share the same store and TTL.
pub struct TtlCache<K, V> {
    store: Arc<DashMap<K, CacheEntry<V>>>,
    ttl: Arc<RwLock<Duration>>,
}

impl<K, V> Clone for TtlCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            ttl: Arc::clone(&self.ttl),
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            store: Arc::new(DashMap::new()),
            ttl: Arc::new(RwLock::new(ttl)),
        }
    }

    pub fn ttl(&self) -> Duration {
        *self.ttl.read()
    }

    /// Change the TTL. Applies to existing entries on their next read.
    pub fn set_ttl(&self, ttl: Duration) {
        *self.ttl.write() = ttl;
    }

    /// Get a value, returns None if expired or missing.
    pub fn get(&self, key: &K) -> Option<V> {
        let ttl = self.ttl();
        let entry = self.store.get(key)?;
        if entry.inserted_at.elapsed() >= ttl {
            drop(entry);
            self.store
                .remove_if(key, |_, entry| entry.inserted_at.elapsed() >= ttl);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Insert or replace a value, restarting its age.
    pub fn insert(&self, key: K, value: V) {
        self.store.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Return the cached value for `key`, or run `compute` and cache its
    /// result. Errors are returned as-is and nothing is cached.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: K, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key) {
            metrics::counter!("funnel.cache.hit").increment(1);
            return Ok(value);
        }
        metrics::counter!("funnel.cache.miss").increment(1);

        let value = compute().await?;
        self.insert(key, value.clone());
        Ok(value)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let cleared = self.store.len();
        self.store.clear();
        debug!(cleared = cleared, "Cache cleared");
    }

    /// Remove expired entries. Reads already ignore them; this only
    /// reclaims memory for a host that schedules it.
    pub fn evict_expired(&self) -> usize {
        let ttl = self.ttl();
        let before = self.store.len();
        self.store
            .retain(|_, entry| entry.inserted_at.elapsed() < ttl);
        before.saturating_sub(self.store.len())
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_get_within_ttl() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("a".to_string(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"b".to_string()), None);
    }

    #[test]
    fn test_stale_entry_is_never_returned() {
        let cache = TtlCache::new(Duration::from_millis(10));
        cache.insert("a", 1);
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(cache.get(&"a"), None);
        // Lazy expiry removed it on read.
        assert!(cache.is_empty());
    }

    #[test]
    fn test_zero_ttl_disables_caching() {
        let cache = TtlCache::new(Duration::ZERO);
        cache.insert("a", 1);
        assert_eq!(cache.get(&"a"), None);
    }

    #[test]
    fn test_set_ttl_applies_to_existing_entries() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("a", 1);
        std::thread::sleep(Duration::from_millis(15));
        cache.set_ttl(Duration::from_millis(5));
        assert_eq!(cache.ttl(), Duration::from_millis(5));
        assert_eq!(cache.get(&"a"), None);
    }

    #[test]
    fn test_clear_and_clones_share_store() {
        let cache = TtlCache::new(Duration::from_secs(60));
        let shared = cache.clone();
        cache.insert("a", 1);
        assert_eq!(shared.get(&"a"), Some(1));
        shared.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evict_expired() {
        let cache = TtlCache::new(Duration::from_millis(10));
        cache.insert("old", 1);
        std::thread::sleep(Duration::from_millis(25));
        cache.set_ttl(Duration::from_millis(20));
        cache.insert("fresh", 2);
        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_get_or_try_insert_with_computes_once() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = cache
                .get_or_try_insert_with("k", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(7)
                })
                .await
                .unwrap();
            assert_eq!(value, 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_secs(60));

        let err = cache
            .get_or_try_insert_with("k", || async { Err::<u32, _>("boom") })
            .await;
        assert_eq!(err, Err("boom"));
        assert!(cache.is_empty());

        let ok = cache
            .get_or_try_insert_with("k", || async { Ok::<_, &str>(3) })
            .await;
        assert_eq!(ok, Ok(3));
    }
}
