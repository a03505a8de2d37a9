use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::{missing_input, Stage};
use crate::core::context::ProcessingContext;
use crate::core::errors::{PipelineError, PipelineResult};
use crate::core::types::{RenderedDocument, StageName};
use crate::services::cache::{stage_key, StageCache};
use crate::services::rendering::{normalize_document_text, Renderers};

/// Best available text -> rendered document in the requested format
///
/// Keyed by the hash of the translated (or recognized) text, the format and the title.
pub struct ExportStage {
    renderers: Renderers,
    cache: StageCache,
    ttl: Duration,
}

impl ExportStage {
    pub fn new(renderers: Renderers, cache: StageCache, ttl: Duration) -> Self {
        Self {
            renderers,
            cache,
            ttl,
        }
    }

    pub fn cache_key(ctx: &ProcessingContext) -> Option<String> {
        let hash = ctx.best_text_hash()?;
        Some(stage_key(
            StageName::Export.as_str(),
            [
                hash.into(),
                ctx.output_format.as_str().into(),
                ctx.title.as_str().into(),
            ],
        ))
    }
}

#[async_trait]
impl Stage for ExportStage {
    fn name(&self) -> &'static str {
        StageName::Export.as_str()
    }

    async fn run(&self, mut ctx: ProcessingContext) -> PipelineResult<ProcessingContext> {
        let stage = StageName::Export;
        let format = ctx.output_format;
        let renderer = self.renderers.for_format(format).ok_or_else(|| {
            PipelineError::Validation(format!("no renderer registered for {}", format))
        })?;
        let key = Self::cache_key(&ctx).ok_or_else(|| missing_input(stage, "text"))?;
        let text = normalize_document_text(ctx.best_text().unwrap_or_default());
        let title = ctx.title.as_str();

        let (document, from_cache): (RenderedDocument, bool) = self
            .cache
            .get_or_compute(stage, &key, self.ttl, ctx.use_cache, || async {
                renderer
                    .render(&text, title)
                    .await
                    .map_err(|e| PipelineError::from_engine(stage, e))
            })
            .await?;

        debug!(
            "Exported {} ({} bytes, cached: {})",
            document.filename,
            document.bytes.as_slice().len(),
            from_cache
        );
        ctx.set_output(document)?;
        ctx.flags_mut(stage).from_cache = from_cache;
        Ok(ctx)
    }
}
