use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::core::errors::JobError;
use crate::core::types::{Blob, OutputFormat};

/// Job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Cache store key of the persisted result envelope
    pub fn result_key(&self) -> String {
        format!("job:{}:result", self.0)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(JobId)
            .map_err(|_| JobError::NotFound(s.to_string()))
    }
}

/// Job lifecycle
///
/// waiting -> active -> completed | failed; waiting | active -> cancelled;
/// failed -> waiting on explicit retry. `NotFound` only appears in status replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    Cancelled,
    NotFound,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
            JobState::NotFound => "not_found",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Waiting, Active)
                | (Active, Completed)
                | (Active, Failed)
                // automatic re-delivery after a transient failure
                | (Active, Waiting)
                | (Waiting, Cancelled)
                | (Active, Cancelled)
                | (Failed, Waiting)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

/// Inputs of one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub image: Blob,
    #[serde(default)]
    pub target_lang: Option<String>,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub title: Option<String>,
    /// OCR language hint
    #[serde(default)]
    pub lang: Option<String>,
    /// When false, stage caches are refreshed instead of read
    #[serde(default = "default_true")]
    pub use_cache: bool,
}

impl JobPayload {
    pub fn new(image: impl Into<Vec<u8>>) -> Self {
        Self {
            image: Blob(image.into()),
            target_lang: None,
            output_format: OutputFormat::default(),
            title: None,
            lang: None,
            use_cache: true,
        }
    }

    pub fn with_target_lang(mut self, lang: impl Into<String>) -> Self {
        self.target_lang = Some(lang.into());
        self
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = Some(lang.into());
        self
    }

    pub fn with_use_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn validate(&self) -> Result<(), JobError> {
        if self.image.as_slice().is_empty() {
            return Err(JobError::Validation("image is empty".to_string()));
        }
        if let Some(title) = &self.title {
            if title.contains(['/', '\\']) {
                return Err(JobError::Validation(format!(
                    "title may not contain path separators: {}",
                    title
                )));
            }
        }
        Ok(())
    }
}

/// Persisted output of a completed job, stored under [`JobId::result_key`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResultEnvelope {
    pub filename: String,
    pub mime: String,
    pub output: Blob,
    pub cache_fallback_used: bool,
    pub processing_time_ms: u64,
}

/// Queue-side view of one job
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub state: JobState,
    pub progress: u8,
    pub attempts: u32,
    pub error: Option<String>,
    pub owner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Status reply for `get_state`
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: JobId,
    pub state: JobState,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResultEnvelope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub attempts: u32,
}

impl JobStatus {
    pub fn not_found(id: JobId) -> Self {
        Self {
            id,
            state: JobState::NotFound,
            progress: 0,
            result: None,
            error: None,
            owner: None,
            attempts: 0,
        }
    }
}
