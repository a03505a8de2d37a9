use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::core::config::CacheConfig;
use crate::core::errors::CacheStoreError;

/// Key-value store with per-entry expiry.
///
/// The pipeline tolerates absence, staleness and total unavailability: every error
/// returned here is logged by the caller and treated as a miss.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheStoreError>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheStoreError>;

    async fn delete(&self, key: &str) -> Result<(), CacheStoreError>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Instant,
}

/// In-process [`CacheStore`] with LRU eviction and lazy expiry.
#[derive(Clone)]
pub struct MemoryCacheStore {
    inner: Arc<Mutex<LruCache<String, StoredValue>>>,
}

impl MemoryCacheStore {
    /// Create a store holding at most `max_entries` keys (minimum 1).
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_entries)
    }

    /// Live entries, expired ones excluded
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .lock()
            .iter()
            .filter(|(_, v)| v.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.inner
            .lock()
            .peek(key)
            .map_or(false, |v| v.expires_at > now)
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheStoreError> {
        let mut cache = self.inner.lock();
        let expired = match cache.get(key) {
            Some(value) if value.expires_at > Instant::now() => {
                return Ok(Some(value.bytes.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            cache.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheStoreError> {
        let stored = StoredValue {
            bytes: value,
            expires_at: Instant::now() + ttl,
        };
        self.inner.lock().put(key.to_string(), stored);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheStoreError> {
        self.inner.lock().pop(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryCacheStore::new(16);
        store
            .set("ocr:abc", b"hello".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(store.get("ocr:abc").await.unwrap(), Some(b"hello".to_vec()));
        assert!(store.contains("ocr:abc"));

        store.delete("ocr:abc").await.unwrap();
        assert_eq!(store.get("ocr:abc").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let store = MemoryCacheStore::new(16);
        store
            .set("job:1:result", b"{}".to_vec(), Duration::from_secs(3600))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(3599)).await;
        assert!(store.get("job:1:result").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("job:1:result").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let store = MemoryCacheStore::new(2);
        let ttl = Duration::from_secs(60);
        store.set("a", vec![1], ttl).await.unwrap();
        store.set("b", vec![2], ttl).await.unwrap();
        // touch "a" so "b" is least recently used
        store.get("a").await.unwrap();
        store.set("c", vec![3], ttl).await.unwrap();

        assert!(store.contains("a"));
        assert!(!store.contains("b"));
        assert!(store.contains("c"));
    }

    #[tokio::test]
    async fn test_capacity_comes_from_config() {
        let config = CacheConfig {
            max_entries: 1,
            ..Default::default()
        };
        let store = MemoryCacheStore::from_config(&config);
        let ttl = Duration::from_secs(60);
        store.set("a", vec![1], ttl).await.unwrap();
        store.set("b", vec![2], ttl).await.unwrap();

        assert!(!store.contains("a"));
        assert_eq!(store.len(), 1);
    }
}
