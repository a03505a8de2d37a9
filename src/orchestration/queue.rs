use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::config::WorkerConfig;
use crate::core::errors::JobError;
use crate::orchestration::job::{JobId, JobPayload, JobRecord, JobState};

/// A job handed to a worker
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: JobId,
    pub payload: JobPayload,
    /// 1-based delivery count
    pub attempt: u32,
}

/// What the queue did with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to waiting; delivered again after `delay`
    Redelivered { attempt: u32, delay: Duration },
    /// Attempts exhausted or the error is permanent
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Durable job queue contract
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, payload: JobPayload, owner: Option<String>) -> Result<JobId, JobError>;

    /// Wait for the next waiting job and mark it active; `None` once `shutdown` fires.
    async fn next(&self, shutdown: &CancellationToken) -> Option<Delivery>;

    async fn update_progress(&self, id: JobId, progress: u8) -> Result<(), JobError>;

    async fn complete(&self, id: JobId) -> Result<(), JobError>;

    /// Record a failed attempt; `retryable` failures are re-delivered while attempts remain.
    async fn fail(&self, id: JobId, error: String, retryable: bool) -> Result<FailOutcome, JobError>;

    /// Cancel a waiting or active job, returning the state it was in.
    async fn cancel(&self, id: JobId) -> Result<JobState, JobError>;

    /// Put a failed job back to waiting with its progress reset.
    async fn retry(&self, id: JobId) -> Result<(), JobError>;

    async fn get(&self, id: JobId) -> Option<JobRecord>;

    async fn counts(&self) -> QueueCounts;
}

struct Entry {
    record: JobRecord,
    payload: JobPayload,
    /// Set while the job sits in a terminal state
    finished_at: Option<Instant>,
}

impl Entry {
    fn transition(&mut self, to: JobState) -> Result<JobState, JobError> {
        let from = self.record.state;
        if !from.can_transition_to(to) {
            return Err(JobError::InvalidTransition {
                id: self.record.id.to_string(),
                from: from.as_str(),
                to: to.as_str(),
            });
        }
        self.record.state = to;
        self.record.updated_at = Utc::now();
        self.finished_at = to.is_terminal().then(Instant::now);
        Ok(from)
    }
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<JobId, Entry>,
    ready: VecDeque<JobId>,
    delayed: Vec<(Instant, JobId)>,
}

impl QueueState {
    fn entry(&mut self, id: JobId) -> Result<&mut Entry, JobError> {
        self.jobs
            .get_mut(&id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    fn promote_due(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, id) = self.delayed.swap_remove(i);
                self.ready.push_back(id);
            } else {
                i += 1;
            }
        }
    }

    /// Drop terminal jobs that finished more than `retention` ago.
    fn purge_finished(&mut self, now: Instant, retention: Duration) {
        let before = self.jobs.len();
        self.jobs.retain(|_, entry| match entry.finished_at {
            Some(at) => now.saturating_duration_since(at) < retention,
            None => true,
        });
        let purged = before - self.jobs.len();
        if purged > 0 {
            debug!("Purged {} finished jobs", purged);
        }
    }

    fn claim_ready(&mut self) -> Option<Delivery> {
        while let Some(id) = self.ready.pop_front() {
            let Some(entry) = self.jobs.get_mut(&id) else {
                continue;
            };
            // cancelled while queued
            if entry.transition(JobState::Active).is_err() {
                continue;
            }
            entry.record.attempts += 1;
            return Some(Delivery {
                id,
                payload: entry.payload.clone(),
                attempt: entry.record.attempts,
            });
        }
        None
    }
}

/// In-process queue with bounded automatic re-delivery.
///
/// Completed, failed and cancelled jobs stay queryable for `retention`
/// after they finish and are then forgotten.
pub struct MemoryJobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    max_attempts: u32,
    retry_delay: Duration,
    retention: Duration,
}

impl MemoryJobQueue {
    pub fn new(max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            max_attempts: max_attempts.max(1),
            retry_delay,
            retention: WorkerConfig::default().job_retention,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Self {
        Self::new(config.max_attempts, config.retry_delay).with_retention(config.job_retention)
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    fn lock(&self) -> parking_lot::MutexGuard<'_, QueueState> {
        let mut state = self.state.lock();
        state.purge_finished(Instant::now(), self.retention);
        state
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, payload: JobPayload, owner: Option<String>) -> Result<JobId, JobError> {
        let id = JobId::new();
        let now = Utc::now();
        {
            let mut state = self.lock();
            state.jobs.insert(
                id,
                Entry {
                    record: JobRecord {
                        id,
                        state: JobState::Waiting,
                        progress: 0,
                        attempts: 0,
                        error: None,
                        owner,
                        created_at: now,
                        updated_at: now,
                    },
                    payload,
                    finished_at: None,
                },
            );
            state.ready.push_back(id);
        }
        self.notify.notify_one();
        Ok(id)
    }

    async fn next(&self, shutdown: &CancellationToken) -> Option<Delivery> {
        loop {
            let notified = self.notify.notified();
            let deadline = {
                let mut state = self.lock();
                state.promote_due(Instant::now());
                if let Some(delivery) = state.claim_ready() {
                    return Some(delivery);
                }
                state.delayed.iter().map(|(at, _)| *at).min()
            };

            let redelivery = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = notified => {}
                _ = redelivery => {}
            }
        }
    }

    async fn update_progress(&self, id: JobId, progress: u8) -> Result<(), JobError> {
        let mut state = self.lock();
        let entry = state.entry(id)?;
        if entry.record.state != JobState::Active {
            return Err(JobError::InvalidTransition {
                id: id.to_string(),
                from: entry.record.state.as_str(),
                to: "progress",
            });
        }
        entry.record.progress = progress.min(100);
        entry.record.updated_at = Utc::now();
        Ok(())
    }

    async fn complete(&self, id: JobId) -> Result<(), JobError> {
        let mut state = self.lock();
        let entry = state.entry(id)?;
        entry.transition(JobState::Completed)?;
        entry.record.progress = 100;
        entry.record.error = None;
        Ok(())
    }

    async fn fail(&self, id: JobId, error: String, retryable: bool) -> Result<FailOutcome, JobError> {
        let outcome = {
            let mut state = self.lock();
            let entry = state.entry(id)?;
            if entry.record.state != JobState::Active {
                return Err(JobError::InvalidTransition {
                    id: id.to_string(),
                    from: entry.record.state.as_str(),
                    to: JobState::Failed.as_str(),
                });
            }
            entry.record.error = Some(error);

            if retryable && entry.record.attempts < self.max_attempts {
                entry.transition(JobState::Waiting)?;
                entry.record.progress = 0;
                let attempt = entry.record.attempts + 1;
                state.delayed.push((Instant::now() + self.retry_delay, id));
                FailOutcome::Redelivered {
                    attempt,
                    delay: self.retry_delay,
                }
            } else {
                entry.transition(JobState::Failed)?;
                FailOutcome::Failed
            }
        };

        if let FailOutcome::Redelivered { .. } = outcome {
            // a sleeping worker has to pick up the new deadline
            self.notify.notify_one();
        }
        Ok(outcome)
    }

    async fn cancel(&self, id: JobId) -> Result<JobState, JobError> {
        let mut state = self.lock();
        let from = state.entry(id)?.transition(JobState::Cancelled)?;
        debug!("Job {} cancelled while {}", id, from);
        Ok(from)
    }

    async fn retry(&self, id: JobId) -> Result<(), JobError> {
        {
            let mut state = self.lock();
            let entry = state.entry(id)?;
            entry.transition(JobState::Waiting)?;
            entry.record.progress = 0;
            entry.record.attempts = 0;
            entry.record.error = None;
            state.ready.push_back(id);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn get(&self, id: JobId) -> Option<JobRecord> {
        self.lock().jobs.get(&id).map(|e| e.record.clone())
    }

    async fn counts(&self) -> QueueCounts {
        let state = self.lock();
        let mut counts = QueueCounts::default();
        for entry in state.jobs.values() {
            match entry.record.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Cancelled => counts.cancelled += 1,
                JobState::NotFound => {}
            }
        }
        counts
    }
}
