// Job orchestrator: validated enqueue, status queries and the worker pool

use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::core::config::Config;
use crate::core::context::ProcessingContext;
use crate::core::errors::{CacheStoreError, JobError, PipelineError, PipelineResult};
use crate::middleware::{BreakerReport, CircuitState, StartLimiter};
use crate::orchestration::job::{JobId, JobPayload, JobResultEnvelope, JobState, JobStatus};
use crate::orchestration::pipeline::Pipeline;
use crate::orchestration::queue::{Delivery, FailOutcome, JobQueue, QueueCounts};
use crate::utils::metrics::{CacheStats, MetricsSnapshot};
use crate::utils::Metrics;

/// Progress reported once the payload is decoded
pub const PROGRESS_DECODED: u8 = 10;
/// Progress reported once the pipeline has produced output
pub const PROGRESS_PROCESSED: u8 = 80;
pub const PROGRESS_DONE: u8 = 100;

/// Operational snapshot for a health endpoint
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// `ok`, or `degraded` while any breaker is not closed
    pub status: &'static str,
    pub cache: CacheStats,
    pub breakers: Vec<BreakerReport>,
    pub queue: QueueCounts,
    pub metrics: MetricsSnapshot,
}

enum Finished {
    Completed,
    Cancelled,
}

/// Runs jobs from a [`JobQueue`] through a [`Pipeline`] on a fixed pool of workers.
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    pipeline: Arc<Pipeline>,
    queue: Arc<dyn JobQueue>,
    config: Config,
    metrics: Metrics,
    limiter: StartLimiter,
}

impl JobOrchestrator {
    pub fn new(
        pipeline: Arc<Pipeline>,
        queue: Arc<dyn JobQueue>,
        config: Config,
        metrics: Metrics,
    ) -> Self {
        let limiter = StartLimiter::new(
            config.workers.limiter_max_starts,
            config.workers.limiter_window,
        );
        Self {
            inner: Arc::new(OrchestratorInner {
                pipeline,
                queue,
                config,
                metrics,
                limiter,
            }),
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.inner.pipeline
    }

    /// Validate `payload` and queue it.
    pub async fn enqueue(&self, payload: JobPayload, owner: Option<String>) -> Result<JobId, JobError> {
        payload.validate()?;
        if !self.inner.pipeline.supports(payload.output_format) {
            return Err(JobError::Validation(format!(
                "output format {} is not available",
                payload.output_format
            )));
        }

        let id = self.inner.queue.enqueue(payload, owner).await?;
        self.inner.metrics.record_job_enqueued();
        info!("Job {} enqueued", id);
        Ok(id)
    }

    /// Current state, progress and (for completed jobs) the persisted result.
    pub async fn get_state(&self, id: JobId) -> JobStatus {
        let Some(record) = self.inner.queue.get(id).await else {
            return JobStatus::not_found(id);
        };

        let result = if record.state == JobState::Completed {
            self.inner.load_result(id).await
        } else {
            None
        };

        JobStatus {
            id,
            state: record.state,
            progress: record.progress,
            result,
            error: record.error,
            owner: record.owner,
            attempts: record.attempts,
        }
    }

    /// Cancel a waiting or active job.
    ///
    /// A waiting job is never handed to a worker. An active job keeps running its
    /// current engine call; its outcome is discarded.
    pub async fn cancel(&self, id: JobId) -> Result<JobState, JobError> {
        let previous = self.inner.queue.cancel(id).await?;
        self.inner.metrics.record_job_cancelled();
        info!("Job {} cancelled (was {})", id, previous);
        Ok(previous)
    }

    /// Re-queue a failed job with progress reset and any stored result cleared.
    pub async fn retry(&self, id: JobId) -> Result<(), JobError> {
        let record = self
            .inner
            .queue
            .get(id)
            .await
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        if record.state != JobState::Failed {
            return Err(JobError::InvalidTransition {
                id: id.to_string(),
                from: record.state.as_str(),
                to: JobState::Waiting.as_str(),
            });
        }

        self.inner.discard_result(id).await;
        self.inner.queue.retry(id).await?;
        info!("Job {} re-queued", id);
        Ok(())
    }

    pub async fn health(&self) -> HealthReport {
        let breakers = self.inner.pipeline.breakers().report();
        let degraded = breakers.iter().any(|b| b.state != CircuitState::Closed);
        HealthReport {
            status: if degraded { "degraded" } else { "ok" },
            cache: self.inner.metrics.cache_stats(),
            breakers,
            queue: self.inner.queue.counts().await,
            metrics: self.inner.metrics.snapshot(),
        }
    }

    /// Spawn `workers.concurrency` workers pulling from the queue.
    pub fn start(&self) -> WorkerPool {
        let shutdown = CancellationToken::new();
        let size = self.inner.config.workers.concurrency.max(1);
        let handles = (0..size)
            .map(|worker_id| {
                let inner = Arc::clone(&self.inner);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { inner.worker_loop(worker_id, shutdown).await })
            })
            .collect();

        info!("Started {} workers", size);
        WorkerPool { shutdown, handles }
    }
}

impl OrchestratorInner {
    async fn worker_loop(&self, worker_id: usize, shutdown: CancellationToken) {
        debug!("Worker {} started", worker_id);
        while let Some(delivery) = self.queue.next(&shutdown).await {
            self.limiter.acquire().await;
            self.process(delivery).await;
        }
        debug!("Worker {} stopped", worker_id);
    }

    #[instrument(skip_all, fields(job_id = %delivery.id, attempt = delivery.attempt))]
    async fn process(&self, delivery: Delivery) {
        let id = delivery.id;
        if self.is_cancelled(id).await {
            info!("Job {} cancelled before start", id);
            return;
        }

        match self.execute(id, delivery.payload).await {
            Ok(Finished::Completed) => {
                self.metrics.record_job_completed();
            }
            Ok(Finished::Cancelled) => {
                info!("Job {} cancelled while running, result discarded", id);
            }
            Err(err) => self.handle_failure(id, err).await,
        }
    }

    async fn execute(&self, id: JobId, payload: JobPayload) -> PipelineResult<Finished> {
        let started = Instant::now();
        let ctx = self.build_context(payload)?;
        self.progress(id, PROGRESS_DECODED).await;

        let mut ctx = self.pipeline.process(ctx).await?;
        self.progress(id, PROGRESS_PROCESSED).await;

        if self.is_cancelled(id).await {
            return Ok(Finished::Cancelled);
        }

        let output = ctx.take_output().ok_or_else(|| {
            PipelineError::Invariant("pipeline finished without output".to_string())
        })?;
        let envelope = JobResultEnvelope {
            filename: output.filename,
            mime: output.mime,
            output: output.bytes,
            cache_fallback_used: ctx.cache_fallback_used(),
            processing_time_ms: started.elapsed().as_millis() as u64,
        };
        let bytes = serde_json::to_vec(&envelope).map_err(CacheStoreError::from)?;
        self.pipeline
            .store()
            .set(&id.result_key(), bytes, self.config.cache.job_result_ttl)
            .await?;
        self.progress(id, PROGRESS_DONE).await;

        match self.queue.complete(id).await {
            Ok(()) => {
                info!(
                    "Job {} completed in {} ms (fallback: {})",
                    id, envelope.processing_time_ms, envelope.cache_fallback_used
                );
                Ok(Finished::Completed)
            }
            Err(e) => {
                // cancelled while the result was being written
                debug!("Job {} not marked completed: {}", id, e);
                self.discard_result(id).await;
                Ok(Finished::Cancelled)
            }
        }
    }

    fn build_context(&self, payload: JobPayload) -> PipelineResult<ProcessingContext> {
        let defaults = &self.config.defaults;
        let lang = non_blank(payload.lang).unwrap_or_else(|| defaults.ocr_lang.clone());
        let title = non_blank(payload.title).unwrap_or_else(|| defaults.title.clone());

        Ok(
            ProcessingContext::new(payload.image.into_inner(), lang, payload.output_format, title)?
                .with_target_lang(payload.target_lang.as_deref())
                .with_use_cache(payload.use_cache),
        )
    }

    async fn handle_failure(&self, id: JobId, err: PipelineError) {
        match self.queue.fail(id, err.to_string(), err.is_retryable()).await {
            Ok(FailOutcome::Redelivered { attempt, delay }) => {
                self.metrics.record_job_redelivered();
                warn!("Job {} failed, attempt {} in {:?}: {}", id, attempt, delay, err);
            }
            Ok(FailOutcome::Failed) => {
                self.metrics.record_job_failed();
                error!("Job {} failed: {}", id, err);
            }
            Err(e) => debug!("Job {} failure not recorded: {}", id, e),
        }
    }

    async fn progress(&self, id: JobId, progress: u8) {
        if let Err(e) = self.queue.update_progress(id, progress).await {
            debug!("Progress {} for job {} dropped: {}", progress, id, e);
        }
    }

    async fn is_cancelled(&self, id: JobId) -> bool {
        matches!(
            self.queue.get(id).await.map(|r| r.state),
            Some(JobState::Cancelled)
        )
    }

    async fn discard_result(&self, id: JobId) {
        if let Err(e) = self.pipeline.store().delete(&id.result_key()).await {
            warn!("Could not clear stored result of job {}: {}", id, e);
        }
    }

    async fn load_result(&self, id: JobId) -> Option<JobResultEnvelope> {
        match self.pipeline.store().get(&id.result_key()).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes)
                .map_err(|e| warn!("Stored result of job {} is unreadable: {}", id, e))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                warn!("Could not load result of job {}: {}", id, e);
                None
            }
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Handle to the running workers
pub struct WorkerPool {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stop pulling new jobs and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for result in join_all(self.handles).await {
            if let Err(e) = result {
                warn!("Worker ended abnormally: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}
