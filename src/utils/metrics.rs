use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::types::StageName;

/// Latency samples kept per series
const MAX_SAMPLES: usize = 1024;

/// Metrics registry for the pipeline and the job orchestrator.
///
/// Constructed once and handed to every component that records; cloning shares the
/// same counters. Separate instances are fully independent, which keeps tests and
/// multiple pipelines in one process apart.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct StageCounters {
    hits: AtomicUsize,
    misses: AtomicUsize,
    fallbacks: AtomicUsize,
}

struct MetricsInner {
    // Engine calls
    engine_calls_total: AtomicUsize,
    engine_calls_success: AtomicUsize,
    engine_calls_failed: AtomicUsize,
    engine_latency_ms: RwLock<VecDeque<u64>>,

    // Stage cache
    stages: [StageCounters; 4],
    result_cache_hits: AtomicUsize,
    result_cache_misses: AtomicUsize,
    cache_store_errors: AtomicUsize,

    // Timings, keyed by stage name or "pipeline"
    durations_ms: DashMap<&'static str, VecDeque<u64>>,

    // Jobs
    jobs_enqueued: AtomicUsize,
    jobs_completed: AtomicUsize,
    jobs_failed: AtomicUsize,
    jobs_cancelled: AtomicUsize,
    jobs_redelivered: AtomicUsize,

    circuit_breaker_trips: AtomicUsize,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                engine_calls_total: AtomicUsize::new(0),
                engine_calls_success: AtomicUsize::new(0),
                engine_calls_failed: AtomicUsize::new(0),
                engine_latency_ms: RwLock::new(VecDeque::new()),
                stages: Default::default(),
                result_cache_hits: AtomicUsize::new(0),
                result_cache_misses: AtomicUsize::new(0),
                cache_store_errors: AtomicUsize::new(0),
                durations_ms: DashMap::new(),
                jobs_enqueued: AtomicUsize::new(0),
                jobs_completed: AtomicUsize::new(0),
                jobs_failed: AtomicUsize::new(0),
                jobs_cancelled: AtomicUsize::new(0),
                jobs_redelivered: AtomicUsize::new(0),
                circuit_breaker_trips: AtomicUsize::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    // Engine metrics
    pub fn record_engine_call(&self, success: bool, duration: Duration) {
        self.inner.engine_calls_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.inner.engine_calls_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.engine_calls_failed.fetch_add(1, Ordering::Relaxed);
        }
        push_sample(&mut self.inner.engine_latency_ms.write(), duration);
    }

    // Stage cache metrics
    pub fn record_cache_hit(&self, stage: StageName) {
        self.inner.stages[stage.index()].hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self, stage: StageName) {
        self.inner.stages[stage.index()].misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_fallback(&self, stage: StageName) {
        self.inner.stages[stage.index()]
            .fallbacks
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_result_cache(&self, hit: bool) {
        if hit {
            self.inner.result_cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.result_cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_cache_store_error(&self) {
        self.inner.cache_store_errors.fetch_add(1, Ordering::Relaxed);
    }

    // Timing hooks
    pub fn record_duration(&self, name: &'static str, duration: Duration) {
        push_sample(&mut self.inner.durations_ms.entry(name).or_default(), duration);
    }

    // Job metrics
    pub fn record_job_enqueued(&self) {
        self.inner.jobs_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_completed(&self) {
        self.inner.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_failed(&self) {
        self.inner.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_cancelled(&self) {
        self.inner.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_redelivered(&self) {
        self.inner.jobs_redelivered.fetch_add(1, Ordering::Relaxed);
    }

    // Circuit breaker metrics
    pub fn record_circuit_breaker_trip(&self) {
        self.inner.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    /// Aggregate hit/miss counters over all four stages
    pub fn cache_stats(&self) -> CacheStats {
        let (hits, misses) = self.inner.stages.iter().fold((0, 0), |(h, m), s| {
            (
                h + s.hits.load(Ordering::Relaxed),
                m + s.misses.load(Ordering::Relaxed),
            )
        });
        CacheStats::new(hits, misses)
    }

    /// Zero the stage and result cache counters; engine and job counters are kept.
    pub fn reset_cache_stats(&self) {
        for stage in &self.inner.stages {
            stage.hits.store(0, Ordering::Relaxed);
            stage.misses.store(0, Ordering::Relaxed);
            stage.fallbacks.store(0, Ordering::Relaxed);
        }
        self.inner.result_cache_hits.store(0, Ordering::Relaxed);
        self.inner.result_cache_misses.store(0, Ordering::Relaxed);
        self.inner.cache_store_errors.store(0, Ordering::Relaxed);
    }

    // Get snapshot for reporting
    pub fn snapshot(&self) -> MetricsSnapshot {
        let engine_latency: Vec<u64> = self.inner.engine_latency_ms.read().iter().copied().collect();

        let mut stages = BTreeMap::new();
        for stage in StageName::ALL {
            let counters = &self.inner.stages[stage.index()];
            let samples = self.samples(stage.as_str());
            stages.insert(
                stage.as_str().to_string(),
                StageSnapshot {
                    hits: counters.hits.load(Ordering::Relaxed),
                    misses: counters.misses.load(Ordering::Relaxed),
                    fallbacks: counters.fallbacks.load(Ordering::Relaxed),
                    avg_ms: avg(&samples),
                    p95_ms: percentile(&samples, 0.95),
                },
            );
        }

        let pipeline = self.samples("pipeline");

        MetricsSnapshot {
            engine_calls_total: self.inner.engine_calls_total.load(Ordering::Relaxed),
            engine_calls_success: self.inner.engine_calls_success.load(Ordering::Relaxed),
            engine_calls_failed: self.inner.engine_calls_failed.load(Ordering::Relaxed),
            engine_latency_avg_ms: avg(&engine_latency),
            engine_latency_p50_ms: percentile(&engine_latency, 0.5),
            engine_latency_p95_ms: percentile(&engine_latency, 0.95),
            engine_latency_p99_ms: percentile(&engine_latency, 0.99),
            cache: self.cache_stats(),
            stages,
            result_cache_hits: self.inner.result_cache_hits.load(Ordering::Relaxed),
            result_cache_misses: self.inner.result_cache_misses.load(Ordering::Relaxed),
            cache_store_errors: self.inner.cache_store_errors.load(Ordering::Relaxed),
            pipeline_avg_ms: avg(&pipeline),
            jobs_enqueued: self.inner.jobs_enqueued.load(Ordering::Relaxed),
            jobs_completed: self.inner.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.inner.jobs_failed.load(Ordering::Relaxed),
            jobs_cancelled: self.inner.jobs_cancelled.load(Ordering::Relaxed),
            jobs_redelivered: self.inner.jobs_redelivered.load(Ordering::Relaxed),
            circuit_breaker_trips: self.inner.circuit_breaker_trips.load(Ordering::Relaxed),
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    fn samples(&self, name: &str) -> Vec<u64> {
        self.inner
            .durations_ms
            .get(name)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();

        counter(&mut out, "engine_calls_total", "Total number of engine calls made", snapshot.engine_calls_total);
        counter(&mut out, "engine_calls_success", "Number of successful engine calls", snapshot.engine_calls_success);
        counter(&mut out, "engine_calls_failed", "Number of failed engine calls", snapshot.engine_calls_failed);
        gauge(&mut out, "engine_latency_avg_ms", "Average engine latency in milliseconds", snapshot.engine_latency_avg_ms);
        gauge(&mut out, "cache_hit_rate", "Stage cache hit rate (0.0 to 1.0)", snapshot.cache.hit_rate);

        let _ = writeln!(out, "# HELP stage_cache_total Stage cache lookups by outcome");
        let _ = writeln!(out, "# TYPE stage_cache_total counter");
        for (stage, s) in &snapshot.stages {
            let _ = writeln!(out, "stage_cache_total {{stage=\"{}\",outcome=\"hit\"}} {}", stage, s.hits);
            let _ = writeln!(out, "stage_cache_total {{stage=\"{}\",outcome=\"miss\"}} {}", stage, s.misses);
            let _ = writeln!(out, "stage_cache_total {{stage=\"{}\",outcome=\"fallback\"}} {}", stage, s.fallbacks);
        }
        out.push('\n');

        let _ = writeln!(out, "# HELP stage_avg_duration_ms Average stage duration in milliseconds");
        let _ = writeln!(out, "# TYPE stage_avg_duration_ms gauge");
        for (stage, s) in &snapshot.stages {
            let _ = writeln!(out, "stage_avg_duration_ms {{stage=\"{}\"}} {}", stage, s.avg_ms);
        }
        out.push('\n');

        counter(&mut out, "cache_store_errors_total", "Cache store failures treated as misses", snapshot.cache_store_errors);
        counter(&mut out, "jobs_completed_total", "Jobs completed", snapshot.jobs_completed);
        counter(&mut out, "jobs_failed_total", "Jobs failed after all attempts", snapshot.jobs_failed);
        counter(&mut out, "jobs_cancelled_total", "Jobs cancelled", snapshot.jobs_cancelled);
        counter(&mut out, "circuit_breaker_trips_total", "Total circuit breaker trips", snapshot.circuit_breaker_trips);
        counter(&mut out, "uptime_seconds", "Application uptime in seconds", snapshot.uptime_seconds);
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Hit/miss summary across the stage caches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub total: usize,
    pub hit_rate: f64,
}

impl CacheStats {
    fn new(hits: usize, misses: usize) -> Self {
        let total = hits + misses;
        Self {
            hits,
            misses,
            total,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub hits: usize,
    pub misses: usize,
    pub fallbacks: usize,
    pub avg_ms: u64,
    pub p95_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub engine_calls_total: usize,
    pub engine_calls_success: usize,
    pub engine_calls_failed: usize,
    pub engine_latency_avg_ms: u64,
    pub engine_latency_p50_ms: u64,
    pub engine_latency_p95_ms: u64,
    pub engine_latency_p99_ms: u64,
    pub cache: CacheStats,
    pub stages: BTreeMap<String, StageSnapshot>,
    pub result_cache_hits: usize,
    pub result_cache_misses: usize,
    pub cache_store_errors: usize,
    pub pipeline_avg_ms: u64,
    pub jobs_enqueued: usize,
    pub jobs_completed: usize,
    pub jobs_failed: usize,
    pub jobs_cancelled: usize,
    pub jobs_redelivered: usize,
    pub circuit_breaker_trips: usize,
    pub uptime_seconds: u64,
}

fn push_sample(samples: &mut VecDeque<u64>, duration: Duration) {
    if samples.len() == MAX_SAMPLES {
        samples.pop_front();
    }
    samples.push_back(duration.as_millis() as u64);
}

fn counter(out: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP {} {}\n# TYPE {} counter\n{} {{}} {}\n", name, help, name, name, value);
}

fn gauge(out: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP {} {}\n# TYPE {} gauge\n{} {{}} {}\n", name, help, name, name, value);
}

fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();

        metrics.record_engine_call(true, Duration::from_millis(100));
        metrics.record_engine_call(false, Duration::from_millis(50));
        metrics.record_cache_hit(StageName::Recognize);
        metrics.record_cache_miss(StageName::Translate);
        metrics.record_cache_fallback(StageName::Translate);
        metrics.record_duration("translate", Duration::from_millis(40));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.engine_calls_total, 2);
        assert_eq!(snapshot.engine_calls_success, 1);
        assert_eq!(snapshot.engine_calls_failed, 1);
        assert_eq!(snapshot.cache.hits, 1);
        assert_eq!(snapshot.cache.misses, 1);
        assert_eq!(snapshot.cache.hit_rate, 0.5);
        assert_eq!(snapshot.stages["translate"].fallbacks, 1);
        assert_eq!(snapshot.stages["translate"].avg_ms, 40);
    }

    #[test]
    fn test_reset_cache_stats() {
        let metrics = Metrics::new();
        metrics.record_cache_hit(StageName::Recognize);
        metrics.record_cache_miss(StageName::Export);
        metrics.record_cache_fallback(StageName::Translate);
        metrics.record_result_cache(true);
        metrics.record_cache_store_error();
        metrics.record_job_completed();

        metrics.reset_cache_stats();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.cache, CacheStats::new(0, 0));
        assert!(snapshot.stages.values().all(|s| s.fallbacks == 0));
        assert_eq!(snapshot.result_cache_hits, 0);
        assert_eq!(snapshot.cache_store_errors, 0);
        assert_eq!(snapshot.jobs_completed, 1);
    }

    #[test]
    fn test_independent_registries() {
        let a = Metrics::new();
        let b = Metrics::new();
        a.record_job_completed();
        assert_eq!(a.snapshot().jobs_completed, 1);
        assert_eq!(b.snapshot().jobs_completed, 0);
    }

    #[test]
    fn test_samples_are_bounded() {
        let metrics = Metrics::new();
        for _ in 0..(MAX_SAMPLES + 10) {
            metrics.record_duration("pipeline", Duration::from_millis(1));
        }
        assert_eq!(metrics.samples("pipeline").len(), MAX_SAMPLES);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.record_engine_call(true, Duration::from_millis(100));
        metrics.record_cache_hit(StageName::Export);

        let prometheus = metrics.to_prometheus();
        assert!(prometheus.contains("engine_calls_total {} 1"));
        assert!(prometheus.contains("stage_cache_total {stage=\"export\",outcome=\"hit\"} 1"));
    }
}
