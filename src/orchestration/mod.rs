pub mod job;
pub mod job_orchestrator;
pub mod pipeline;
pub mod queue;

pub use job::{JobId, JobPayload, JobRecord, JobResultEnvelope, JobState, JobStatus};
pub use job_orchestrator::{HealthReport, JobOrchestrator, WorkerPool};
pub use pipeline::{Engines, Pipeline, PipelineRunner};
pub use queue::{Delivery, FailOutcome, JobQueue, MemoryJobQueue, QueueCounts};
