// Pipeline: sequential stage runner plus the standard stage assembly

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

use crate::core::config::Config;
use crate::core::context::ProcessingContext;
use crate::core::errors::PipelineResult;
use crate::core::types::{OutputFormat, StageName};
use crate::middleware::BreakerRegistry;
use crate::phases::{
    ExportStage, PreprocessStage, RecognizeStage, ResultLookupStage, ResultStoreStage, Stage,
    TranslateStage,
};
use crate::services::cache::{CacheStore, StageCache};
use crate::services::engines::{ImagePreprocessor, OcrEngine, TranslationEngine};
use crate::services::rendering::Renderers;
use crate::utils::Metrics;

/// Runs stages strictly in order; the first error ends the run.
#[derive(Clone)]
pub struct PipelineRunner {
    metrics: Metrics,
}

impl PipelineRunner {
    pub fn new(metrics: Metrics) -> Self {
        Self { metrics }
    }

    #[instrument(skip_all, fields(stages = stages.len(), format = %ctx.output_format))]
    pub async fn run(
        &self,
        mut ctx: ProcessingContext,
        stages: &[Arc<dyn Stage>],
    ) -> PipelineResult<ProcessingContext> {
        let run_start = Instant::now();

        for stage in stages {
            let stage_start = Instant::now();
            ctx = stage.run(ctx).await?;
            let elapsed = stage_start.elapsed();
            self.metrics.record_duration(stage.name(), elapsed);
            debug!("Stage {} finished in {:?}", stage.name(), elapsed);

            if ctx.result_from_cache {
                debug!("Whole result served from cache after {}", stage.name());
                break;
            }
        }

        self.metrics.record_duration("pipeline", run_start.elapsed());
        Ok(ctx)
    }
}

/// External engines the standard pipeline drives
#[derive(Clone)]
pub struct Engines {
    pub preprocessor: Arc<dyn ImagePreprocessor>,
    pub ocr: Arc<dyn OcrEngine>,
    pub translator: Arc<dyn TranslationEngine>,
    pub renderers: Renderers,
}

/// Preprocess -> Recognize -> Translate -> Export, each behind its stage cache, with
/// OCR and translation behind circuit breakers.
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    runner: PipelineRunner,
    renderers: Renderers,
    breakers: BreakerRegistry,
    store: Arc<dyn CacheStore>,
}

impl Pipeline {
    pub fn new(
        engines: Engines,
        store: Arc<dyn CacheStore>,
        config: &Config,
        metrics: Metrics,
        breakers: BreakerRegistry,
    ) -> Self {
        let cache = StageCache::new(store.clone(), metrics.clone());
        let ttls = &config.cache;

        let ocr_breaker = breakers.register("ocr", config.breaker.clone());
        let translate_breaker = breakers.register("translate", config.breaker.clone());

        let mut stages: Vec<Arc<dyn Stage>> = Vec::with_capacity(6);
        if ttls.result_cache_enabled {
            stages.push(Arc::new(ResultLookupStage::new(cache.clone(), metrics.clone())));
        }
        stages.push(Arc::new(PreprocessStage::new(
            engines.preprocessor,
            cache.clone(),
            ttls.ttl_for(StageName::Preprocess),
        )));
        stages.push(Arc::new(RecognizeStage::new(
            engines.ocr,
            ocr_breaker,
            cache.clone(),
            metrics.clone(),
            ttls.ttl_for(StageName::Recognize),
        )));
        stages.push(Arc::new(TranslateStage::new(
            engines.translator,
            translate_breaker,
            cache.clone(),
            metrics.clone(),
            ttls.ttl_for(StageName::Translate),
        )));
        stages.push(Arc::new(ExportStage::new(
            engines.renderers.clone(),
            cache.clone(),
            ttls.ttl_for(StageName::Export),
        )));
        if ttls.result_cache_enabled {
            stages.push(Arc::new(ResultStoreStage::new(cache, ttls.export_ttl)));
        }

        info!(
            "Pipeline ready: {}",
            stages.iter().map(|s| s.name()).collect::<Vec<_>>().join(" -> ")
        );

        Self {
            stages,
            runner: PipelineRunner::new(metrics),
            renderers: engines.renderers,
            breakers,
            store,
        }
    }

    pub async fn process(&self, ctx: ProcessingContext) -> PipelineResult<ProcessingContext> {
        self.runner.run(ctx, &self.stages).await
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn supports(&self, format: OutputFormat) -> bool {
        self.renderers.supports(format)
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }
}
