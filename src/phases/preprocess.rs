use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::Stage;
use crate::core::context::ProcessingContext;
use crate::core::errors::{PipelineError, PipelineResult};
use crate::core::types::{Blob, StageName};
use crate::services::cache::{stage_key, StageCache};
use crate::services::engines::ImagePreprocessor;

/// Raw image -> normalized image, keyed by the raw image hash
pub struct PreprocessStage {
    preprocessor: Arc<dyn ImagePreprocessor>,
    cache: StageCache,
    ttl: Duration,
}

impl PreprocessStage {
    pub fn new(preprocessor: Arc<dyn ImagePreprocessor>, cache: StageCache, ttl: Duration) -> Self {
        Self {
            preprocessor,
            cache,
            ttl,
        }
    }

    pub fn cache_key(ctx: &ProcessingContext) -> String {
        stage_key(StageName::Preprocess.as_str(), [ctx.raw_hash().into()])
    }
}

#[async_trait]
impl Stage for PreprocessStage {
    fn name(&self) -> &'static str {
        StageName::Preprocess.as_str()
    }

    async fn run(&self, mut ctx: ProcessingContext) -> PipelineResult<ProcessingContext> {
        let key = Self::cache_key(&ctx);
        let (image, from_cache) = self
            .cache
            .get_or_compute(StageName::Preprocess, &key, self.ttl, ctx.use_cache, || async {
                self.preprocessor
                    .preprocess(ctx.raw_bytes())
                    .await
                    .map(Blob)
                    .map_err(|e| PipelineError::from_engine(StageName::Preprocess, e))
            })
            .await?;

        debug!("Preprocessed image: {} bytes (cached: {})", image.as_slice().len(), from_cache);
        ctx.set_preprocessed(image.into_inner())?;
        ctx.flags_mut(StageName::Preprocess).from_cache = from_cache;
        Ok(ctx)
    }
}
