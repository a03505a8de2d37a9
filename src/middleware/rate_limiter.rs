use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Sliding-window limiter on job starts, shared by every worker.
///
/// At most `max_starts` jobs begin per `window`, however many workers are idle.
pub struct StartLimiter {
    max_starts: usize,
    window: Duration,
    starts: Mutex<VecDeque<Instant>>,
}

impl StartLimiter {
    pub fn new(max_starts: usize, window: Duration) -> Self {
        Self {
            max_starts: max_starts.max(1),
            window,
            starts: Mutex::new(VecDeque::with_capacity(max_starts.max(1))),
        }
    }

    /// Wait until a start slot is free, then claim it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut starts = self.starts.lock();
                let now = Instant::now();
                while let Some(&oldest) = starts.front() {
                    if oldest + self.window <= now {
                        starts.pop_front();
                    } else {
                        break;
                    }
                }

                if starts.len() < self.max_starts {
                    starts.push_back(now);
                    return;
                }

                match starts.front() {
                    Some(&oldest) => (oldest + self.window).saturating_duration_since(now),
                    None => Duration::ZERO,
                }
            };

            debug!("Job start limited, waiting {:?}", wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Starts recorded inside the current window
    pub fn in_window(&self) -> usize {
        let now = Instant::now();
        self.starts
            .lock()
            .iter()
            .filter(|&&t| t + self.window > now)
            .count()
    }
}
