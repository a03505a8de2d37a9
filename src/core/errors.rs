// Error taxonomy for the pipeline, the cache layer, the breakers and the job queue
//
// Cache-store errors are never fatal: stage wrappers log them and continue as a miss.

use std::time::Duration;
use thiserror::Error;

use crate::core::types::StageName;

/// Cache store failures (always logged and swallowed by the stage wrappers)
#[derive(Debug, Error)]
pub enum CacheStoreError {
    #[error("Cache store unavailable: {0}")]
    Unavailable(String),

    #[error("Cache entry encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Input an engine rejects outright, such as bytes that are not an image.
///
/// Engines return it inside their `anyhow::Error`; the pipeline turns it into a
/// non-retryable [`PipelineError::Validation`].
#[derive(Debug, Error)]
#[error("{0}")]
pub struct InvalidInput(pub String);

/// Outcome of a guarded call that did not produce a value
#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("Circuit breaker '{name}' is open")]
    Open { name: String },

    #[error("Call through '{name}' timed out after {after:?}")]
    Timeout { name: String, after: Duration },

    #[error("Call through '{name}' failed: {source}")]
    Failed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Pipeline run failures
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("{stage} engine failed: {message}")]
    Engine { stage: StageName, message: String },

    #[error("{stage} unavailable: circuit breaker '{breaker}' is open")]
    BreakerOpen { stage: StageName, breaker: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Processing context invariant violated: {0}")]
    Invariant(String),

    #[error("Job result could not be persisted: {0}")]
    Persist(#[from] CacheStoreError),
}

impl PipelineError {
    /// Convert a guarded-call error for `stage`, keeping open-state fast fails distinct.
    pub fn from_breaker(stage: StageName, err: BreakerError) -> Self {
        match err {
            BreakerError::Open { name } => PipelineError::BreakerOpen {
                stage,
                breaker: name,
            },
            BreakerError::Failed { source, .. } if source.is::<InvalidInput>() => {
                PipelineError::rejected_input(stage, &source)
            }
            other => PipelineError::Engine {
                stage,
                message: other.to_string(),
            },
        }
    }

    pub fn engine(stage: StageName, err: impl std::fmt::Display) -> Self {
        PipelineError::Engine {
            stage,
            message: err.to_string(),
        }
    }

    /// Convert an unguarded engine error; rejected input becomes a validation error.
    pub fn from_engine(stage: StageName, err: anyhow::Error) -> Self {
        if err.is::<InvalidInput>() {
            PipelineError::rejected_input(stage, &err)
        } else {
            PipelineError::engine(stage, err)
        }
    }

    fn rejected_input(stage: StageName, err: &anyhow::Error) -> Self {
        PipelineError::Validation(format!("{} rejected input: {}", stage, err))
    }

    /// Whether the queue may re-deliver a job that failed with this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::Validation(_)
                | PipelineError::NotFound(_)
                | PipelineError::Invariant(_)
        )
    }
}

/// Job orchestration errors
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Invalid job transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("Invalid job payload: {0}")]
    Validation(String),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Error threshold must be in (0, 100], got {0}")]
    InvalidErrorThreshold(f64),

    #[error("Invalid breaker config: {0}")]
    InvalidBreakerConfig(String),

    #[error("Invalid cache config: {0}")]
    InvalidCacheConfig(String),

    #[error("Invalid worker config: {0}")]
    InvalidWorkerConfig(String),

    #[error("Environment variable {name} could not be parsed: {value}")]
    EnvVarError { name: String, value: String },
}

pub type PipelineResult<T> = Result<T, PipelineError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
