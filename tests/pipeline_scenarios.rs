// End-to-end behavior of the cached pipeline and the job orchestrator with fake engines

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ocr_workflow::core::types::RenderedDocument;
use ocr_workflow::phases::{ExportStage, PreprocessStage, RecognizeStage, TranslateStage};
use ocr_workflow::{
    Blob, BreakerRegistry, CircuitState, Config, DocumentRenderer, Engines, ImagePreprocessor,
    JobId, JobOrchestrator, JobPayload, JobState, JobStatus, MemoryCacheStore, MemoryJobQueue,
    Metrics, OcrEngine, OutputFormat, Pipeline, PipelineError, ProcessingContext, Renderers,
    StageName, TranslationEngine,
};

const ENGINE_LATENCY: Duration = Duration::from_millis(25);

#[derive(Default)]
struct Counter(AtomicUsize);

impl Counter {
    fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FakePreprocessor {
    calls: Counter,
}

#[async_trait]
impl ImagePreprocessor for FakePreprocessor {
    async fn preprocess(&self, image: &[u8]) -> anyhow::Result<Vec<u8>> {
        self.calls.bump();
        Ok(image.iter().rev().copied().collect())
    }
}

#[derive(Default)]
struct FakeOcr {
    calls: Counter,
}

#[async_trait]
impl OcrEngine for FakeOcr {
    async fn recognize(&self, image: &[u8], _lang: &str) -> anyhow::Result<String> {
        self.calls.bump();
        tokio::time::sleep(ENGINE_LATENCY).await;
        Ok(format!("text of {}", String::from_utf8_lossy(image)))
    }
}

#[derive(Default)]
struct SwitchableTranslator {
    calls: Counter,
    failing: AtomicBool,
}

#[async_trait]
impl TranslationEngine for SwitchableTranslator {
    async fn translate(&self, text: &str, target_lang: &str) -> anyhow::Result<String> {
        self.calls.bump();
        tokio::time::sleep(ENGINE_LATENCY).await;
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("translation provider returned 503");
        }
        Ok(format!("{}: {}", target_lang, text))
    }
}

#[derive(Default)]
struct FakePdf {
    calls: Counter,
}

#[async_trait]
impl DocumentRenderer for FakePdf {
    async fn render(&self, text: &str, title: &str) -> anyhow::Result<RenderedDocument> {
        self.calls.bump();
        Ok(RenderedDocument {
            bytes: Blob(format!("%PDF {}\n{}", title, text).into_bytes()),
            mime: OutputFormat::Pdf.mime().to_string(),
            filename: OutputFormat::Pdf.filename(title),
        })
    }
}

struct Harness {
    store: MemoryCacheStore,
    metrics: Metrics,
    pipeline: Arc<Pipeline>,
    orchestrator: JobOrchestrator,
    preprocessor: Arc<FakePreprocessor>,
    ocr: Arc<FakeOcr>,
    translator: Arc<SwitchableTranslator>,
    pdf: Arc<FakePdf>,
}

impl Harness {
    fn new() -> Self {
        let mut config = Config::default();
        config.workers.concurrency = 2;
        config.workers.max_attempts = 1;

        let metrics = Metrics::new();
        let store = MemoryCacheStore::from_config(&config.cache);
        let preprocessor = Arc::new(FakePreprocessor::default());
        let ocr = Arc::new(FakeOcr::default());
        let translator = Arc::new(SwitchableTranslator::default());
        let pdf = Arc::new(FakePdf::default());

        let engines = Engines {
            preprocessor: preprocessor.clone(),
            ocr: ocr.clone(),
            translator: translator.clone(),
            renderers: Renderers::new().with_pdf(pdf.clone()),
        };
        let pipeline = Arc::new(Pipeline::new(
            engines,
            Arc::new(store.clone()),
            &config,
            metrics.clone(),
            BreakerRegistry::new(Some(metrics.clone())),
        ));
        let queue = Arc::new(MemoryJobQueue::from_config(&config.workers));
        let orchestrator = JobOrchestrator::new(pipeline.clone(), queue, config, metrics.clone());

        Self {
            store,
            metrics,
            pipeline,
            orchestrator,
            preprocessor,
            ocr,
            translator,
            pdf,
        }
    }

    async fn run(
        &self,
        image: &[u8],
        target: &str,
        format: OutputFormat,
    ) -> Result<ProcessingContext, PipelineError> {
        let ctx = ProcessingContext::new(image.to_vec(), "eng+vie", format, "Doc")?
            .with_target_lang(Some(target));
        self.pipeline.process(ctx).await
    }

    fn engine_calls(&self) -> [usize; 4] {
        [
            self.preprocessor.calls.get(),
            self.ocr.calls.get(),
            self.translator.calls.get(),
            self.pdf.calls.get(),
        ]
    }

    async fn wait_for(&self, id: JobId, state: JobState) -> JobStatus {
        for _ in 0..300 {
            let status = self.orchestrator.get_state(id).await;
            if status.state == state {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {}", id, state);
    }
}

fn hits(ctx: &ProcessingContext) -> [bool; 4] {
    StageName::ALL.map(|stage| ctx.flags(stage).from_cache)
}

fn job(image: &[u8], target: &str) -> JobPayload {
    JobPayload::new(image.to_vec())
        .with_target_lang(target)
        .with_format(OutputFormat::Pdf)
        .with_title("Doc")
}

#[tokio::test]
async fn scenario_a_cold_cache_misses_every_stage() {
    let h = Harness::new();

    let ctx = h.run(b"image-x", "vi", OutputFormat::Pdf).await.unwrap();

    assert_eq!(hits(&ctx), [false; 4]);
    assert!(!ctx.cache_fallback_used());
    assert_eq!(h.store.len(), 4);
    assert_eq!(h.engine_calls(), [1, 1, 1, 1]);

    let output = ctx.output().unwrap();
    assert_eq!(output.filename, "Doc.pdf");
    assert_eq!(output.mime, "application/pdf");
    assert_eq!(ctx.translated(), Some("vi: text of x-egami"));
}

#[tokio::test]
async fn scenario_b_repeat_hits_every_stage_and_is_faster() {
    let h = Harness::new();

    let cold_start = Instant::now();
    let cold = h.run(b"image-x", "vi", OutputFormat::Pdf).await.unwrap();
    let cold_time = cold_start.elapsed();

    let warm_start = Instant::now();
    let warm = h.run(b"image-x", "vi", OutputFormat::Pdf).await.unwrap();
    let warm_time = warm_start.elapsed();

    assert_eq!(hits(&warm), [true; 4]);
    assert_eq!(h.engine_calls(), [1, 1, 1, 1]);
    assert_eq!(warm.output(), cold.output());
    assert!(cold_time >= ENGINE_LATENCY * 2);
    assert!(warm_time < cold_time);

    let stats = h.metrics.cache_stats();
    assert_eq!((stats.hits, stats.misses), (4, 4));
}

#[tokio::test]
async fn scenario_c_new_target_reuses_preprocess_and_recognize() {
    let h = Harness::new();
    h.run(b"image-x", "vi", OutputFormat::Pdf).await.unwrap();

    let ctx = h.run(b"image-x", "en", OutputFormat::Pdf).await.unwrap();

    assert_eq!(hits(&ctx), [true, true, false, false]);
    assert_eq!(h.engine_calls(), [1, 1, 2, 2]);
    assert_eq!(ctx.translated(), Some("en: text of x-egami"));
}

#[tokio::test]
async fn new_format_only_misses_export() {
    let h = Harness::new();
    h.run(b"image-x", "vi", OutputFormat::Pdf).await.unwrap();

    let ctx = h.run(b"image-x", "vi", OutputFormat::Txt).await.unwrap();

    assert_eq!(hits(&ctx), [true, true, true, false]);
    let output = ctx.output().unwrap();
    assert_eq!(output.filename, "Doc.txt");
    assert_eq!(output.bytes.as_slice(), b"vi: text of x-egami");
}

#[test]
fn stage_keys_are_pure_functions_of_their_inputs() {
    let build = |target: &str| {
        let mut ctx = ProcessingContext::new(b"image-x".to_vec(), "eng", OutputFormat::Pdf, "Doc")
            .unwrap()
            .with_target_lang(Some(target));
        ctx.set_preprocessed(b"clean".to_vec()).unwrap();
        ctx.set_text("hello".to_string()).unwrap();
        ctx.set_translated("xin chào".to_string()).unwrap();
        ctx
    };

    let (a, b) = (build("vi"), build("vi"));
    assert_eq!(PreprocessStage::cache_key(&a), PreprocessStage::cache_key(&b));
    assert_eq!(RecognizeStage::cache_key(&a), RecognizeStage::cache_key(&b));
    assert_eq!(TranslateStage::cache_key(&a), TranslateStage::cache_key(&b));
    assert_eq!(ExportStage::cache_key(&a), ExportStage::cache_key(&b));

    let other = build("en");
    assert_ne!(TranslateStage::cache_key(&a), TranslateStage::cache_key(&other));
    assert_eq!(RecognizeStage::cache_key(&a), RecognizeStage::cache_key(&other));
}

#[tokio::test]
async fn concurrent_identical_runs_leave_a_consistent_cache() {
    let h = Harness::new();

    let (first, second) = tokio::join!(
        h.run(b"image-y", "vi", OutputFormat::Pdf),
        h.run(b"image-y", "vi", OutputFormat::Pdf),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(first.output(), second.output());

    // a third reader sees the same values from the store
    let third = h.run(b"image-y", "vi", OutputFormat::Pdf).await.unwrap();
    assert_eq!(hits(&third), [true; 4]);
    assert_eq!(third.output(), first.output());
    assert_eq!(h.store.len(), 4);
}

#[tokio::test]
async fn scenario_d_open_translation_breaker_serves_cached_translation() {
    let h = Harness::new();
    let pool = h.orchestrator.start();

    let warm = h.orchestrator.enqueue(job(b"image-x", "vi"), None).await.unwrap();
    let warm = h.wait_for(warm, JobState::Completed).await;
    assert!(!warm.result.as_ref().unwrap().cache_fallback_used);

    h.translator.failing.store(true, Ordering::SeqCst);

    // refresh run: reads skipped, translation fails, cached translation served
    let refresh = h
        .orchestrator
        .enqueue(job(b"image-x", "vi").with_use_cache(false), None)
        .await
        .unwrap();
    let refresh = h.wait_for(refresh, JobState::Completed).await;
    let result = refresh.result.unwrap();
    assert!(result.cache_fallback_used);
    assert_eq!(result.output, warm.result.unwrap().output);

    let report = h.pipeline.breakers().get("translate").unwrap();
    assert_eq!(report.state, CircuitState::Open);
    assert_eq!(h.metrics.snapshot().circuit_breaker_trips, 1);

    // while open, a second refresh never reaches the engine
    let calls_before = h.translator.calls.get();
    let again = h
        .orchestrator
        .enqueue(job(b"image-x", "vi").with_use_cache(false), None)
        .await
        .unwrap();
    let again = h.wait_for(again, JobState::Completed).await;
    assert!(again.result.unwrap().cache_fallback_used);
    assert_eq!(h.translator.calls.get(), calls_before);

    // text that was never translated has nothing to fall back on
    let unseen = h.orchestrator.enqueue(job(b"image-z", "vi"), None).await.unwrap();
    let unseen = h.wait_for(unseen, JobState::Failed).await;
    assert!(unseen.error.unwrap().contains("translate"));
    assert!(unseen.result.is_none());

    let health = h.orchestrator.health().await;
    assert_eq!(health.status, "degraded");

    pool.shutdown().await;
}

#[tokio::test]
async fn unseen_text_with_failing_translator_propagates_the_error() {
    let h = Harness::new();
    h.translator.failing.store(true, Ordering::SeqCst);

    let err = h.run(b"image-q", "vi", OutputFormat::Pdf).await.unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Engine {
            stage: StageName::Translate,
            ..
        }
    ));
    assert!(err.to_string().contains("503"));
    // nothing written for the failed stage or after it
    assert_eq!(h.store.len(), 2);
}

#[tokio::test]
async fn scenario_e_cancelled_waiting_job_never_runs() {
    let h = Harness::new();

    let id = h.orchestrator.enqueue(job(b"image-x", "vi"), Some("carol".into())).await.unwrap();
    assert_eq!(h.orchestrator.get_state(id).await.state, JobState::Waiting);
    assert_eq!(h.orchestrator.cancel(id).await.unwrap(), JobState::Waiting);

    let pool = h.orchestrator.start();
    let other = h.orchestrator.enqueue(job(b"image-w", "vi"), None).await.unwrap();
    h.wait_for(other, JobState::Completed).await;
    pool.shutdown().await;

    let status = h.orchestrator.get_state(id).await;
    assert_eq!(status.state, JobState::Cancelled);
    assert!(status.result.is_none());
    // only the second job reached the pipeline
    assert_eq!(h.preprocessor.calls.get(), 1);
    assert!(h.orchestrator.cancel(id).await.is_err());
}

#[tokio::test]
async fn job_result_envelope_is_persisted_under_job_key() {
    let h = Harness::new();
    let pool = h.orchestrator.start();

    let id = h.orchestrator.enqueue(job(b"image-x", "vi"), None).await.unwrap();
    let status = h.wait_for(id, JobState::Completed).await;
    pool.shutdown().await;

    assert_eq!(status.progress, 100);
    assert!(h.store.contains(&id.result_key()));
    let result = status.result.unwrap();
    assert_eq!(result.filename, "Doc.pdf");
    assert!(result.output.as_slice().starts_with(b"%PDF Doc"));
    assert!(result.processing_time_ms >= (ENGINE_LATENCY * 2).as_millis() as u64);
}
