//! Time-bounded cache for resolved identities

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// A cached value and the moment it was stored
#[derive(Debug, Clone)]
struct CachedEntry<V> {
    value: V,
    inserted_at: Instant,
}

/// Map whose entries expire a fixed time after insertion
///
/// Expired entries are dropped when looked up, and all of them whenever a
/// new entry is stored.
pub struct TtlCache<K, V> {
    /// Time-to-live of every entry
    ttl: Duration,
    /// Entries indexed by key
    entries: RwLock<HashMap<K, CachedEntry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    /// Create a cache with the given time-to-live
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Time-to-live of cached entries
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Get a live entry, expiring it if its time is up
    pub async fn get(&self, key: &K) -> Option<V> {
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                    return Some(entry.value.clone())
                }
                Some(_) => {}
                None => return None,
            }
        }

        let mut entries = self.entries.write().await;
        // Re-check: another task may have refreshed it in between.
        if let Some(entry) = entries.get(key) {
            if entry.inserted_at.elapsed() < self.ttl {
                return Some(entry.value.clone());
            }
            entries.remove(key);
            debug!(key = ?key, "Cache entry expired");
        }
        None
    }

    /// Store a value, replacing any previous entry
    pub async fn insert(&self, key: K, value: V) {
        let entry = CachedEntry {
            value,
            inserted_at: Instant::now(),
        };

        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.inserted_at.elapsed() < self.ttl);
        if entries.len() < before {
            debug!(pruned = before - entries.len(), "Pruned expired cache entries");
        }
        entries.insert(key, entry);
    }

    /// Number of stored entries, including expired ones not yet dropped
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the cache holds no entries
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_and_insert() {
        let cache = TtlCache::new(Duration::from_secs(60));

        assert!(cache.get(&"abc".to_string()).await.is_none());

        cache
            .insert("abc".to_string(), "alice@example.com".to_string())
            .await;

        assert_eq!(
            cache.get(&"abc".to_string()).await.as_deref(),
            Some("alice@example.com")
        );
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_entries_expire_lazily() {
        let cache = TtlCache::new(Duration::from_millis(20));
        cache.insert(1u32, "bob@example.com".to_string()).await;

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(cache.len().await, 1);
        assert!(cache.get(&1).await.is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_insert_prunes_expired_entries() {
        let cache = TtlCache::new(Duration::from_millis(20));
        cache.insert(1u32, "gone@example.com".to_string()).await;
        cache.insert(2u32, "gone@example.com".to_string()).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.insert(3u32, "carol@example.com".to_string()).await;

        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get(&3).await.as_deref(), Some("carol@example.com"));
    }
}
