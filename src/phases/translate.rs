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
use crate::services::engines::TranslationEngine;
use crate::utils::Metrics;

/// Text -> translated text, keyed by the text hash and the target language
///
/// Blank text or a missing target language passes the text through untouched without
/// touching the cache or the breaker.
pub struct TranslateStage {
    engine: Arc<dyn TranslationEngine>,
    breaker: CircuitBreaker,
    cache: StageCache,
    metrics: Metrics,
    ttl: Duration,
}

impl TranslateStage {
    pub fn new(
        engine: Arc<dyn TranslationEngine>,
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
        let hash = ctx.text_hash()?;
        let target = ctx.target_lang()?;
        Some(stage_key(
            StageName::Translate.as_str(),
            [hash.into(), target.into()],
        ))
    }
}

#[async_trait]
impl Stage for TranslateStage {
    fn name(&self) -> &'static str {
        StageName::Translate.as_str()
    }

    async fn run(&self, mut ctx: ProcessingContext) -> PipelineResult<ProcessingContext> {
        let stage = StageName::Translate;
        let text = ctx
            .text()
            .ok_or_else(|| missing_input(stage, "recognized text"))?
            .to_string();

        let (key, target) = match (Self::cache_key(&ctx), ctx.target_lang().map(str::to_string)) {
            (Some(key), Some(target)) if !text.trim().is_empty() => (key, target),
            _ => {
                debug!("Translation skipped (no target language or empty text)");
                ctx.set_translated(text)?;
                return Ok(ctx);
            }
        };
        let (text, target) = (text.as_str(), target.as_str());

        let (translated, flags) =
            cached_with_fallback(&self.cache, stage, &key, self.ttl, ctx.use_cache, || {
                guarded_call(stage, &self.breaker, &self.metrics, || async move {
                    self.engine.translate(text, target).await
                })
            })
            .await?;

        debug!(
            "Translated to {} (cached: {}, fallback: {})",
            target, flags.from_cache, flags.cache_fallback_used
        );
        ctx.set_translated(translated)?;
        *ctx.flags_mut(stage) = flags;
        Ok(ctx)
    }
}
