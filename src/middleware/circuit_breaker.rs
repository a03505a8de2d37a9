use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::core::errors::BreakerError;
use crate::utils::Metrics;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through and feed the rolling error rate
    Closed,
    /// Calls fail fast without reaching the engine
    Open,
    /// A single trial call is allowed through to test recovery
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Per-call timeout; exceeding it counts as a failure
    pub timeout: Duration,
    /// Open once the rolling error rate reaches this percentage
    pub error_threshold_percentage: f64,
    /// How long to stay open before allowing a half-open trial
    pub reset_timeout: Duration,
    /// Length of the rolling statistics window
    pub rolling_window: Duration,
    /// Number of buckets the window is divided into
    pub rolling_buckets: u32,
    /// Minimum calls in the window before the error rate is evaluated
    pub volume_threshold: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            error_threshold_percentage: 50.0,
            reset_timeout: Duration::from_secs(30),
            rolling_window: Duration::from_secs(10),
            rolling_buckets: 10,
            volume_threshold: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    index: u64,
    successes: u64,
    failures: u64,
}

/// Success/failure counts over a sliding window of fixed-width buckets.
#[derive(Debug)]
struct RollingCounts {
    origin: Instant,
    bucket_span: Duration,
    bucket_count: u64,
    buckets: VecDeque<Bucket>,
}

impl RollingCounts {
    fn new(window: Duration, buckets: u32) -> Self {
        let buckets = buckets.max(1);
        Self {
            origin: Instant::now(),
            bucket_span: (window / buckets).max(Duration::from_millis(1)),
            bucket_count: buckets as u64,
            buckets: VecDeque::with_capacity(buckets as usize),
        }
    }

    fn index_at(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin).as_nanos();
        (elapsed / self.bucket_span.as_nanos()) as u64
    }

    fn prune(&mut self, now: Instant) {
        let current = self.index_at(now);
        while let Some(front) = self.buckets.front() {
            if front.index + self.bucket_count <= current {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn record(&mut self, now: Instant, success: bool) {
        self.prune(now);
        let index = self.index_at(now);
        if self.buckets.back().map_or(true, |b| b.index != index) {
            self.buckets.push_back(Bucket {
                index,
                successes: 0,
                failures: 0,
            });
        }
        if let Some(bucket) = self.buckets.back_mut() {
            if success {
                bucket.successes += 1;
            } else {
                bucket.failures += 1;
            }
        }
    }

    fn totals(&mut self, now: Instant) -> (u64, u64) {
        self.prune(now);
        self.buckets
            .iter()
            .fold((0, 0), |(s, f), b| (s + b.successes, f + b.failures))
    }

    fn clear(&mut self) {
        self.buckets.clear();
    }
}

/// Counters for one breaker
#[derive(Debug, Clone, Default, Serialize)]
pub struct BreakerStats {
    pub fires: u64,
    pub successes: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub rejects: u64,
    /// Successes inside the current rolling window
    pub window_successes: u64,
    /// Failures inside the current rolling window
    pub window_failures: u64,
}

struct BreakerInner {
    state: CircuitState,
    window: RollingCounts,
    opened_at: Option<Instant>,
    last_transition: DateTime<Utc>,
    trial_in_flight: bool,
    stats: BreakerStats,
}

/// Circuit breaker guarding one external call site
///
/// Closed: calls pass through; each outcome lands in a rolling window and the breaker
/// opens once the window's error rate reaches `error_threshold_percentage`.
/// Open: calls fail with [`BreakerError::Open`] until `reset_timeout` has elapsed.
/// Half-open: exactly one trial call goes through; success closes the breaker and
/// clears the window, failure reopens it and restarts the timeout.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
    registry: Option<BreakerRegistry>,
}

impl CircuitBreaker {
    /// Create a breaker that is not reported to any registry
    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name.as_str()),
            inner: Arc::new(Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: RollingCounts::new(config.rolling_window, config.rolling_buckets),
                opened_at: None,
                last_transition: Utc::now(),
                trial_in_flight: false,
                stats: BreakerStats::default(),
            })),
            config,
            registry: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `call` through the breaker.
    ///
    /// Returns `Open` without invoking `call` while the breaker is open (or while a
    /// half-open trial is already in flight).
    pub async fn fire<T, F, Fut>(&self, call: F) -> Result<T, BreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut guard = self.admit()?;

        match tokio::time::timeout(self.config.timeout, call()).await {
            Ok(Ok(value)) => {
                guard.settle(Outcome::Success);
                Ok(value)
            }
            Ok(Err(source)) => {
                guard.settle(Outcome::Failure);
                Err(BreakerError::Failed {
                    name: self.name.to_string(),
                    source,
                })
            }
            Err(_) => {
                guard.settle(Outcome::Timeout);
                warn!("Circuit breaker timeout for {}", self.name);
                Err(BreakerError::Timeout {
                    name: self.name.to_string(),
                    after: self.config.timeout,
                })
            }
        }
    }

    fn admit(&self) -> Result<CallGuard<'_>, BreakerError> {
        let mut transition = None;
        let admitted = {
            let mut inner = self.inner.lock();
            inner.stats.fires += 1;
            let admitted = match inner.state {
                CircuitState::Closed => Some(false),
                CircuitState::Open => {
                    let elapsed = inner
                        .opened_at
                        .map(|t| t.elapsed() >= self.config.reset_timeout)
                        .unwrap_or(true);
                    if elapsed {
                        transition = Some(self.transition(&mut inner, CircuitState::HalfOpen));
                        inner.trial_in_flight = true;
                        Some(true)
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => {
                    if inner.trial_in_flight {
                        None
                    } else {
                        inner.trial_in_flight = true;
                        Some(true)
                    }
                }
            };
            if admitted.is_none() {
                inner.stats.rejects += 1;
            }
            admitted
        };

        if let Some(t) = transition {
            self.publish(t);
        }
        self.sync_registry();

        match admitted {
            Some(trial) => Ok(CallGuard {
                breaker: self,
                trial,
                settled: false,
            }),
            None => {
                warn!("Circuit breaker rejected execution for {}", self.name);
                Err(BreakerError::Open {
                    name: self.name.to_string(),
                })
            }
        }
    }

    fn settle(&self, trial: bool, outcome: Outcome) {
        let now = Instant::now();
        let mut transition = None;
        {
            let mut inner = self.inner.lock();
            let success = matches!(outcome, Outcome::Success);
            inner.window.record(now, success);
            match outcome {
                Outcome::Success => inner.stats.successes += 1,
                Outcome::Failure => inner.stats.failures += 1,
                Outcome::Timeout => {
                    inner.stats.failures += 1;
                    inner.stats.timeouts += 1;
                }
            }

            if trial {
                inner.trial_in_flight = false;
                if inner.state == CircuitState::HalfOpen {
                    if success {
                        inner.window.clear();
                        transition = Some(self.transition(&mut inner, CircuitState::Closed));
                    } else {
                        inner.opened_at = Some(now);
                        transition = Some(self.transition(&mut inner, CircuitState::Open));
                    }
                }
            } else if !success && inner.state == CircuitState::Closed {
                let (successes, failures) = inner.window.totals(now);
                let total = successes + failures;
                if total > 0 && total >= self.config.volume_threshold {
                    let error_rate = failures as f64 * 100.0 / total as f64;
                    if error_rate >= self.config.error_threshold_percentage {
                        inner.opened_at = Some(now);
                        transition = Some(self.transition(&mut inner, CircuitState::Open));
                    }
                }
            }
        }

        if let Some(t) = transition {
            self.publish(t);
        }
        self.sync_registry();
    }

    /// Release a half-open trial slot whose call was dropped before completing.
    fn abandon_trial(&self) {
        self.inner.lock().trial_in_flight = false;
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) -> BreakerEvent {
        let from = inner.state;
        inner.state = to;
        inner.last_transition = Utc::now();
        BreakerEvent {
            name: self.name.to_string(),
            from,
            to,
            at: inner.last_transition,
        }
    }

    fn publish(&self, event: BreakerEvent) {
        match event.to {
            CircuitState::Open => warn!("Circuit breaker OPEN for {}", self.name),
            CircuitState::HalfOpen => info!("Circuit breaker HALF-OPEN for {}", self.name),
            CircuitState::Closed => info!("Circuit breaker CLOSED for {}", self.name),
        }
        if let Some(registry) = &self.registry {
            registry.record_transition(event);
        }
    }

    fn sync_registry(&self) {
        if let Some(registry) = &self.registry {
            registry.update(self.report());
        }
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Time of the most recent state change
    pub fn last_transition(&self) -> DateTime<Utc> {
        self.inner.lock().last_transition
    }

    /// Get statistics
    pub fn stats(&self) -> BreakerStats {
        let mut inner = self.inner.lock();
        let (window_successes, window_failures) = inner.window.totals(Instant::now());
        BreakerStats {
            window_successes,
            window_failures,
            ..inner.stats.clone()
        }
    }

    pub fn report(&self) -> BreakerReport {
        BreakerReport {
            name: self.name.to_string(),
            state: self.state(),
            last_transition: self.last_transition(),
            options: BreakerOptions::from(&self.config),
            stats: self.stats(),
        }
    }

    /// Force the breaker back to closed with an empty window
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.window.clear();
            inner.opened_at = None;
            inner.trial_in_flight = false;
            if inner.state != CircuitState::Closed {
                Some(self.transition(&mut inner, CircuitState::Closed))
            } else {
                None
            }
        };
        if let Some(t) = transition {
            self.publish(t);
        }
        self.sync_registry();
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    Failure,
    Timeout,
}

struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CallGuard<'_> {
    fn settle(&mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.settle(self.trial, outcome);
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.abandon_trial();
        }
    }
}

/// A breaker state change
#[derive(Debug, Clone, Serialize)]
pub struct BreakerEvent {
    pub name: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerOptions {
    pub timeout_ms: u64,
    pub error_threshold_percentage: f64,
    pub reset_timeout_ms: u64,
    pub rolling_window_ms: u64,
    pub volume_threshold: u64,
}

impl From<&CircuitBreakerConfig> for BreakerOptions {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            timeout_ms: config.timeout.as_millis() as u64,
            error_threshold_percentage: config.error_threshold_percentage,
            reset_timeout_ms: config.reset_timeout.as_millis() as u64,
            rolling_window_ms: config.rolling_window.as_millis() as u64,
            volume_threshold: config.volume_threshold,
        }
    }
}

/// Registry row for one breaker
#[derive(Debug, Clone, Serialize)]
pub struct BreakerReport {
    pub name: String,
    pub state: CircuitState,
    pub last_transition: DateTime<Utc>,
    pub options: BreakerOptions,
    pub stats: BreakerStats,
}

/// Diagnostic registry of every breaker created through it.
///
/// Reports are refreshed after each call; the breakers themselves hold the
/// authoritative state.
#[derive(Clone)]
pub struct BreakerRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    reports: DashMap<String, BreakerReport>,
    events: broadcast::Sender<BreakerEvent>,
    metrics: Option<Metrics>,
}

impl BreakerRegistry {
    pub fn new(metrics: Option<Metrics>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RegistryInner {
                reports: DashMap::new(),
                events,
                metrics,
            }),
        }
    }

    /// Create a breaker for `name` and start reporting it
    pub fn register(&self, name: impl Into<String>, config: CircuitBreakerConfig) -> CircuitBreaker {
        let mut breaker = CircuitBreaker::with_config(name, config);
        breaker.registry = Some(self.clone());
        self.update(breaker.report());
        breaker
    }

    /// Stream of state transitions for an observability collaborator
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.inner.events.subscribe()
    }

    /// Snapshot of all registered breakers, sorted by name
    pub fn report(&self) -> Vec<BreakerReport> {
        let mut out: Vec<BreakerReport> = self
            .inner
            .reports
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn get(&self, name: &str) -> Option<BreakerReport> {
        self.inner.reports.get(name).map(|r| r.value().clone())
    }

    fn update(&self, report: BreakerReport) {
        self.inner.reports.insert(report.name.clone(), report);
    }

    fn record_transition(&self, event: BreakerEvent) {
        if event.to == CircuitState::Open {
            if let Some(ref m) = self.inner.metrics {
                m.record_circuit_breaker_trip();
            }
        }
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            timeout: Duration::from_millis(50),
            error_threshold_percentage: 50.0,
            reset_timeout: Duration::from_millis(100),
            rolling_window: Duration::from_secs(10),
            rolling_buckets: 10,
            volume_threshold: 2,
        }
    }

    async fn fail(breaker: &CircuitBreaker, calls: &AtomicUsize) -> Result<(), BreakerError> {
        breaker
            .fire(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow::anyhow!("engine down"))
            })
            .await
    }

    async fn succeed(breaker: &CircuitBreaker, calls: &AtomicUsize) -> Result<u32, BreakerError> {
        breaker
            .fire(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .await
    }

    #[tokio::test]
    async fn test_opens_after_error_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::with_config("ocr", fast_config());
        let calls = AtomicUsize::new(0);

        assert_eq!(succeed(&breaker, &calls).await.unwrap(), 7);
        // 1 failure of 2 calls = 50%
        assert!(matches!(
            fail(&breaker, &calls).await,
            Err(BreakerError::Failed { .. })
        ));
        assert_eq!(breaker.state(), CircuitState::Open);

        let before = calls.load(Ordering::SeqCst);
        assert!(matches!(
            succeed(&breaker, &calls).await,
            Err(BreakerError::Open { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), before);
        assert_eq!(breaker.stats().rejects, 1);
    }

    #[tokio::test]
    async fn test_volume_threshold_defers_evaluation() {
        let breaker = CircuitBreaker::with_config("ocr", fast_config());
        let calls = AtomicUsize::new(0);

        let _ = fail(&breaker, &calls).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
        let _ = fail(&breaker, &calls).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_half_open_success_closes() {
        let breaker = CircuitBreaker::with_config("translate", fast_config());
        let calls = AtomicUsize::new(0);

        let _ = fail(&breaker, &calls).await;
        let _ = fail(&breaker, &calls).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(succeed(&breaker, &calls).await.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().window_failures, 0);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::with_config("translate", fast_config());
        let calls = AtomicUsize::new(0);

        let _ = fail(&breaker, &calls).await;
        let _ = fail(&breaker, &calls).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let _ = fail(&breaker, &calls).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // timeout restarted: still rejecting
        assert!(matches!(
            succeed(&breaker, &calls).await,
            Err(BreakerError::Open { .. })
        ));
    }

    #[tokio::test]
    async fn test_half_open_allows_a_single_trial() {
        let breaker = CircuitBreaker::with_config("translate", fast_config());
        let calls = AtomicUsize::new(0);

        let _ = fail(&breaker, &calls).await;
        let _ = fail(&breaker, &calls).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let slow_trial = breaker.fire(|| async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok::<_, anyhow::Error>(1)
        });
        let competing = async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            succeed(&breaker, &calls).await
        };

        let (trial, other) = tokio::join!(slow_trial, competing);
        assert_eq!(trial.unwrap(), 1);
        assert!(matches!(other, Err(BreakerError::Open { .. })));
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let mut config = fast_config();
        config.volume_threshold = 0;
        let breaker = CircuitBreaker::with_config("ocr", config);

        let result = breaker
            .fire(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<_, anyhow::Error>(())
            })
            .await;

        assert!(matches!(result, Err(BreakerError::Timeout { .. })));
        assert_eq!(breaker.stats().timeouts, 1);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_registry_reports_and_emits_transitions() {
        let metrics = Metrics::new();
        let registry = BreakerRegistry::new(Some(metrics.clone()));
        let mut events = registry.subscribe();
        let breaker = registry.register("translate", fast_config());
        let calls = AtomicUsize::new(0);

        assert_eq!(registry.get("translate").unwrap().state, CircuitState::Closed);

        let _ = fail(&breaker, &calls).await;
        let _ = fail(&breaker, &calls).await;

        let event = events.recv().await.unwrap();
        assert_eq!(event.from, CircuitState::Closed);
        assert_eq!(event.to, CircuitState::Open);

        let report = registry.report();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].state, CircuitState::Open);
        assert_eq!(report[0].stats.failures, 2);
        assert_eq!(metrics.snapshot().circuit_breaker_trips, 1);
    }

    #[test]
    fn test_rolling_window_expires_old_buckets() {
        let mut counts = RollingCounts::new(Duration::from_millis(100), 10);
        let start = counts.origin;
        counts.record(start, false);
        counts.record(start + Duration::from_millis(50), true);
        assert_eq!(counts.totals(start + Duration::from_millis(60)), (1, 1));
        assert_eq!(counts.totals(start + Duration::from_millis(105)), (1, 0));
        assert_eq!(counts.totals(start + Duration::from_millis(300)), (0, 0));
    }

    #[tokio::test]
    async fn test_reset_closes() {
        let breaker = CircuitBreaker::with_config("ocr", fast_config());
        let calls = AtomicUsize::new(0);
        let _ = fail(&breaker, &calls).await;
        let _ = fail(&breaker, &calls).await;
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(succeed(&breaker, &calls).await.is_ok());
    }
}
