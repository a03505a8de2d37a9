use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{cached_with_fallback, guarded_call, missing_input, Stage};
use crate::core::context::ProcessingContext;
use crate::core::errors::PipelineResult;
use crate::core::types::StageName;
use crate::middleware::CircuitBreaker;
use crate::services::cache::{stage_key, StageCache};
use crate::services::engines::OcrEngine;
use crate::utils::Metrics;

/// Normalized image -> text, keyed by the preprocessed hash and the language hint
pub struct RecognizeStage {
    engine: Arc<dyn OcrEngine>,
    breaker: CircuitBreaker,
    cache: StageCache,
    metrics: Metrics,
    ttl: Duration,
}

impl RecognizeStage {
    pub fn new(
        engine: Arc<dyn OcrEngine>,
        breaker: CircuitBreaker,
        cache: StageCache,
        metrics: Metrics,
        ttl: Duration,
    ) -> Self {
        Self {
            engine,
            breaker,
            cache,
            metrics,
            ttl,
        }
    }

    pub fn cache_key(ctx: &ProcessingContext) -> Option<String> {
        let hash = ctx.preprocessed_hash()?;
        Some(stage_key(
            StageName::Recognize.as_str(),
            [hash.into(), ctx.lang.as_str().into()],
        ))
    }
}

#[async_trait]
impl Stage for RecognizeStage {
    fn name(&self) -> &'static str {
        StageName::Recognize.as_str()
    }

    async fn run(&self, mut ctx: ProcessingContext) -> PipelineResult<ProcessingContext> {
        let stage = StageName::Recognize;
        let key = Self::cache_key(&ctx)
            .ok_or_else(|| missing_input(stage, "the preprocessed image"))?;
        let image = ctx
            .preprocessed()
            .ok_or_else(|| missing_input(stage, "the preprocessed image"))?;
        let lang = ctx.lang.as_str();

        let (text, flags) =
            cached_with_fallback(&self.cache, stage, &key, self.ttl, ctx.use_cache, || {
                guarded_call(stage, &self.breaker, &self.metrics, || async move {
                    self.engine.recognize(image, lang).await
                })
            })
            .await?;

        debug!(
            "Recognized {} chars (cached: {}, fallback: {})",
            text.chars().count(),
            flags.from_cache,
            flags.cache_fallback_used
        );
        ctx.set_text(text)?;
        *ctx.flags_mut(stage) = flags;
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::PipelineError;
    use crate::core::types::OutputFormat;
    use crate::phases::test_support::{breaker, memory_cache, FakeEngine};

    const TTL: Duration = Duration::from_secs(60);

    fn preprocessed_ctx(use_cache: bool) -> ProcessingContext {
        let mut ctx = ProcessingContext::new(b"raw".to_vec(), "eng+vie", OutputFormat::Txt, "Doc")
            .unwrap()
            .with_use_cache(use_cache);
        ctx.set_preprocessed(b"clean".to_vec()).unwrap();
        ctx
    }

    #[tokio::test]
    async fn test_second_run_hits_cache() {
        let engine = Arc::new(FakeEngine::default());
        let (cache, metrics) = memory_cache();
        let stage = RecognizeStage::new(engine.clone(), breaker("ocr"), cache, metrics, TTL);

        let first = stage.run(preprocessed_ctx(true)).await.unwrap();
        let second = stage.run(preprocessed_ctx(true)).await.unwrap();

        assert_eq!(first.text(), Some("5 bytes read as eng+vie"));
        assert_eq!(second.text(), first.text());
        assert!(!first.flags(StageName::Recognize).from_cache);
        assert!(second.flags(StageName::Recognize).from_cache);
        assert_eq!(engine.calls(), 1);
    }

    #[tokio::test]
    async fn test_engine_failure_falls_back_to_cached_text() {
        let engine = Arc::new(FakeEngine::default());
        let (cache, metrics) = memory_cache();
        let stage = RecognizeStage::new(engine.clone(), breaker("ocr"), cache, metrics, TTL);

        stage.run(preprocessed_ctx(true)).await.unwrap();
        engine.set_failing(true);

        let ctx = stage.run(preprocessed_ctx(false)).await.unwrap();
        let flags = ctx.flags(StageName::Recognize);
        assert!(flags.cache_fallback_used);
        assert!(!flags.from_cache);
        assert_eq!(ctx.text(), Some("5 bytes read as eng+vie"));
    }

    #[tokio::test]
    async fn test_engine_failure_without_cache_propagates() {
        let engine = Arc::new(FakeEngine::default());
        engine.set_failing(true);
        let (cache, metrics) = memory_cache();
        let stage = RecognizeStage::new(engine, breaker("ocr"), cache, metrics, TTL);

        let err = stage.run(preprocessed_ctx(true)).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Engine {
                stage: StageName::Recognize,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_requires_preprocessed_image() {
        let (cache, metrics) = memory_cache();
        let stage = RecognizeStage::new(
            Arc::new(FakeEngine::default()),
            breaker("ocr"),
            cache,
            metrics,
            TTL,
        );
        let ctx = ProcessingContext::new(b"raw".to_vec(), "eng", OutputFormat::Txt, "Doc").unwrap();
        assert!(matches!(
            stage.run(ctx).await,
            Err(PipelineError::Invariant(_))
        ));
    }
}
