// Library exports for the OCR and translation workflow
//
// Content-addressed stage pipeline, circuit-broken engine calls and a queue-backed
// job orchestrator.

pub mod core;
pub mod middleware;
pub mod orchestration;
pub mod phases;
pub mod services;
pub mod utils;

// Re-export commonly used types and functions
pub use core::{
    config::Config,
    context::ProcessingContext,
    errors::{
        BreakerError, CacheStoreError, ConfigError, InvalidInput, JobError, PipelineError,
    },
    types::{Blob, OutputFormat, RenderedDocument, StageFlags, StageName},
};

pub use middleware::{BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitState};

pub use orchestration::{
    Engines, HealthReport, JobId, JobOrchestrator, JobPayload, JobQueue, JobResultEnvelope,
    JobState, JobStatus, MemoryJobQueue, Pipeline, WorkerPool,
};

pub use services::{
    CacheStore, DocumentRenderer, ImageNormalizer, ImagePreprocessor, MemoryCacheStore,
    OcrEngine, Renderers, TranslationEngine,
};

pub use utils::{fingerprint, init_from_config, init_tracing, Metrics};
