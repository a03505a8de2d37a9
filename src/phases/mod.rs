// Pipeline stages
//
// Each stage takes the context by value, reads the fields it depends on, publishes its
// own output and hands the context back. Preprocess, Recognize, Translate and Export
// are content-addressed; the result stages wrap the whole chain when enabled.

pub mod export;
pub mod preprocess;
pub mod recognize;
pub mod result_cache;
pub mod translate;

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, Instant};

use crate::core::context::ProcessingContext;
use crate::core::errors::{BreakerError, PipelineError, PipelineResult};
use crate::core::types::{StageFlags, StageName};
use crate::middleware::CircuitBreaker;
use crate::services::cache::{StageCache, StagePayload};
use crate::utils::Metrics;

pub use export::ExportStage;
pub use preprocess::PreprocessStage;
pub use recognize::RecognizeStage;
pub use result_cache::{CachedResult, ResultLookupStage, ResultStoreStage};
pub use translate::TranslateStage;

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: ProcessingContext) -> PipelineResult<ProcessingContext>;
}

/// Call an engine through `breaker`, recording the outcome of calls that were admitted.
pub(crate) async fn guarded_call<T, F, Fut>(
    stage: StageName,
    breaker: &CircuitBreaker,
    metrics: &Metrics,
    call: F,
) -> PipelineResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let started = Instant::now();
    let result = breaker.fire(call).await;
    if !matches!(result, Err(BreakerError::Open { .. })) {
        metrics.record_engine_call(result.is_ok(), started.elapsed());
    }
    result.map_err(|e| PipelineError::from_breaker(stage, e))
}

/// Get-or-compute for a breaker-guarded stage.
///
/// When the compute fails on the engine side, the same key is read straight from the
/// store; a hit is returned flagged as a degraded fallback, a miss returns the
/// original error.
pub(crate) async fn cached_with_fallback<T, F, Fut>(
    cache: &StageCache,
    stage: StageName,
    key: &str,
    ttl: Duration,
    use_cache: bool,
    compute: F,
) -> PipelineResult<(T, StageFlags)>
where
    T: StagePayload,
    F: FnOnce() -> Fut,
    Fut: Future<Output = PipelineResult<T>>,
{
    match cache.get_or_compute(stage, key, ttl, use_cache, compute).await {
        Ok((value, from_cache)) => Ok((
            value,
            StageFlags {
                from_cache,
                cache_fallback_used: false,
            },
        )),
        Err(err @ (PipelineError::Engine { .. } | PipelineError::BreakerOpen { .. })) => {
            match cache.fallback::<T>(stage, key).await {
                Some(value) => Ok((
                    value,
                    StageFlags {
                        from_cache: false,
                        cache_fallback_used: true,
                    },
                )),
                None => Err(err),
            }
        }
        Err(err) => Err(err),
    }
}

fn missing_input(stage: StageName, what: &str) -> PipelineError {
    PipelineError::Invariant(format!("{} stage ran before {} was available", stage, what))
}
