use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::Stage;
use crate::core::context::ProcessingContext;
use crate::core::errors::PipelineResult;
use crate::core::types::RenderedDocument;
use crate::services::cache::{stage_key, StageCache, StagePayload};
use crate::utils::Metrics;

const RESULT_STAGE: &str = "result";

/// Whole-run result, stored after Export and read before Preprocess
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResult {
    pub text: String,
    #[serde(default)]
    pub translated: Option<String>,
    pub output: RenderedDocument,
}

impl StagePayload for CachedResult {
    fn from_legacy(_raw: &[u8]) -> Option<Self> {
        None
    }
}

fn result_key(ctx: &ProcessingContext) -> String {
    stage_key(
        RESULT_STAGE,
        [
            ctx.raw_hash().into(),
            ctx.lang.as_str().into(),
            ctx.target_lang().unwrap_or_default().into(),
            ctx.output_format.as_str().into(),
            ctx.title.as_str().into(),
        ],
    )
}

/// Short-circuits the run when an identical request already has a stored result.
pub struct ResultLookupStage {
    cache: StageCache,
    metrics: Metrics,
}

impl ResultLookupStage {
    pub fn new(cache: StageCache, metrics: Metrics) -> Self {
        Self { cache, metrics }
    }
}

#[async_trait]
impl Stage for ResultLookupStage {
    fn name(&self) -> &'static str {
        "result_lookup"
    }

    async fn run(&self, mut ctx: ProcessingContext) -> PipelineResult<ProcessingContext> {
        if !ctx.use_cache {
            return Ok(ctx);
        }

        let key = result_key(&ctx);
        let Some(cached) = self.cache.lookup::<CachedResult>(&key).await else {
            debug!("Result cache MISS ({})", key);
            self.metrics.record_result_cache(false);
            return Ok(ctx);
        };

        debug!("Result cache HIT ({})", key);
        self.metrics.record_result_cache(true);
        ctx.set_text(cached.text)?;
        if let Some(translated) = cached.translated {
            ctx.set_translated(translated)?;
        }
        ctx.set_output(cached.output)?;
        ctx.result_from_cache = true;
        Ok(ctx)
    }
}

/// Stores the finished run for [`ResultLookupStage`].
pub struct ResultStoreStage {
    cache: StageCache,
    ttl: Duration,
}

impl ResultStoreStage {
    pub fn new(cache: StageCache, ttl: Duration) -> Self {
        Self { cache, ttl }
    }
}

#[async_trait]
impl Stage for ResultStoreStage {
    fn name(&self) -> &'static str {
        "result_store"
    }

    async fn run(&self, ctx: ProcessingContext) -> PipelineResult<ProcessingContext> {
        // degraded runs are not stored
        if ctx.result_from_cache || ctx.cache_fallback_used() {
            return Ok(ctx);
        }
        let result = ctx.text().zip(ctx.output()).map(|(text, output)| CachedResult {
            text: text.to_string(),
            translated: ctx.translated().map(str::to_string),
            output: output.clone(),
        });
        if let Some(result) = result {
            self.cache
                .put(RESULT_STAGE, &result_key(&ctx), &result, self.ttl)
                .await;
        }
        Ok(ctx)
    }
}
