use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::errors::PipelineError;
use crate::core::types::StageName;
use crate::services::cache::envelope::{self, StagePayload};
use crate::services::cache::store::CacheStore;
use crate::utils::hash_chain::{fingerprint, Part};
use crate::utils::Metrics;

/// Cache key for a stage: `<stage>:<fingerprint of input hash and parameters>`.
pub fn stage_key<'a, I>(stage: &str, parts: I) -> String
where
    I: IntoIterator<Item = Part<'a>>,
{
    format!("{}:{}", stage, fingerprint(parts))
}

/// Get-or-compute wrapper shared by every stage.
///
/// Store failures never reach the caller: a failed read is a miss and a failed write
/// is logged and dropped.
#[derive(Clone)]
pub struct StageCache {
    store: Arc<dyn CacheStore>,
    metrics: Metrics,
}

impl StageCache {
    pub fn new(store: Arc<dyn CacheStore>, metrics: Metrics) -> Self {
        Self { store, metrics }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    /// Return the cached value for `key`, or compute, store and return it.
    ///
    /// The flag is `true` when the value came from the store. With `use_cache` false
    /// the read is skipped but a computed value is still written.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        stage: StageName,
        key: &str,
        ttl: Duration,
        use_cache: bool,
        compute: F,
    ) -> Result<(T, bool), PipelineError>
    where
        T: StagePayload,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        if use_cache {
            if let Some(value) = self.lookup::<T>(key).await {
                debug!("Cache HIT {} ({})", stage, key);
                self.metrics.record_cache_hit(stage);
                return Ok((value, true));
            }
            debug!("Cache MISS {} ({})", stage, key);
        } else {
            debug!("Cache read skipped {} ({})", stage, key);
        }
        self.metrics.record_cache_miss(stage);

        let value = compute().await?;
        self.put(stage.as_str(), key, &value, ttl).await;
        Ok((value, false))
    }

    /// Direct read used after a guarded engine call failed.
    pub async fn fallback<T: StagePayload>(&self, stage: StageName, key: &str) -> Option<T> {
        let value = self.lookup::<T>(key).await?;
        self.metrics.record_cache_fallback(stage);
        warn!("Serving cached {} result after engine failure ({})", stage, key);
        Some(value)
    }

    /// Read and decode `key`; store errors and undecodable entries are misses.
    pub async fn lookup<T: StagePayload>(&self, key: &str) -> Option<T> {
        match self.store.get(key).await {
            Ok(Some(raw)) => {
                let value = envelope::decode::<T>(&raw);
                if value.is_none() {
                    debug!("Discarding undecodable cache entry {}", key);
                }
                value
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Cache read failed for {}: {}", key, e);
                self.metrics.record_cache_store_error();
                None
            }
        }
    }

    /// Best-effort write; failures are logged and swallowed.
    pub async fn put<T: StagePayload>(&self, label: &str, key: &str, value: &T, ttl: Duration) {
        let result = match envelope::encode(value, label) {
            Ok(bytes) => self.store.set(key, bytes, ttl).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Cache write failed for {}: {}", key, e);
            self.metrics.record_cache_store_error();
        }
    }
}
