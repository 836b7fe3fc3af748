use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::types::Stage;

const STAGES: [Stage; 2] = [Stage::Detection, Stage::Translation];

/// Latency samples kept per series; averages and percentiles cover these
pub const LATENCY_WINDOW: usize = 1024;

/// Most recent latency samples, oldest first
#[derive(Default)]
struct LatencyWindow(VecDeque<u64>);

impl LatencyWindow {
    fn record(&mut self, duration: Duration) {
        if self.0.len() == LATENCY_WINDOW {
            self.0.pop_front();
        }
        self.0.push_back(duration.as_millis() as u64);
    }

    fn avg(&self) -> u64 {
        if self.0.is_empty() {
            return 0;
        }
        self.0.iter().sum::<u64>() / self.0.len() as u64
    }

    fn percentile(&self, p: f64) -> u64 {
        if self.0.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = self.0.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 - 1.0) * p) as usize;
        sorted[idx]
    }
}

/// Pipeline metrics shared by the orchestrator, demultiplexers and workers.
///
/// Cheap to clone; every clone records into the same counters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct StageCounters {
    dispatched: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    timeouts: AtomicUsize,
    orphaned_results: AtomicUsize,
    dead_lettered: AtomicUsize,
    cache_hits: AtomicUsize,
    cache_misses: AtomicUsize,
    latency_ms: RwLock<LatencyWindow>,
}

struct MetricsInner {
    // Request Metrics
    requests_total: AtomicUsize,
    requests_succeeded: AtomicUsize,
    requests_failed: AtomicUsize,
    request_latency_ms: RwLock<LatencyWindow>,

    // Indexed by Stage::index
    stages: [StageCounters; 2],

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                requests_total: AtomicUsize::new(0),
                requests_succeeded: AtomicUsize::new(0),
                requests_failed: AtomicUsize::new(0),
                request_latency_ms: RwLock::new(LatencyWindow::default()),
                stages: Default::default(),
                start_time: Instant::now(),
            }),
        }
    }

    fn stage(&self, stage: Stage) -> &StageCounters {
        &self.inner.stages[stage.index()]
    }

    // Request Metrics
    pub fn record_request_started(&self) {
        self.inner.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_finished(&self, success: bool, duration: Duration) {
        if success {
            self.inner.requests_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.request_latency_ms.write().record(duration);
    }

    // Stage Metrics
    pub fn record_dispatch(&self, stage: Stage) {
        self.stage(stage).dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stage_completed(&self, stage: Stage, duration: Duration) {
        let counters = self.stage(stage);
        counters.completed.fetch_add(1, Ordering::Relaxed);
        counters.latency_ms.write().record(duration);
    }

    pub fn record_stage_failed(&self, stage: Stage) {
        self.stage(stage).failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self, stage: Stage) {
        self.stage(stage).timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_orphaned_result(&self, stage: Stage) {
        self.stage(stage)
            .orphaned_results
            .fetch_add(1, Ordering::Relaxed);
    }

    // Worker Metrics
    pub fn record_dead_letter(&self, stage: Stage) {
        self.stage(stage).dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self, stage: Stage) {
        self.stage(stage).cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self, stage: Stage) {
        self.stage(stage).cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let request_latency = self.inner.request_latency_ms.read();
        let request_latency_avg_ms = request_latency.avg();
        let request_latency_p95_ms = request_latency.percentile(0.95);
        drop(request_latency);

        let stages = STAGES
            .iter()
            .map(|&stage| {
                let counters = self.stage(stage);
                let latency = counters.latency_ms.read();
                let cache_hits = counters.cache_hits.load(Ordering::Relaxed);
                let cache_misses = counters.cache_misses.load(Ordering::Relaxed);
                let cache_total = cache_hits + cache_misses;
                StageSnapshot {
                    stage: stage.as_str().to_string(),
                    dispatched: counters.dispatched.load(Ordering::Relaxed),
                    completed: counters.completed.load(Ordering::Relaxed),
                    failed: counters.failed.load(Ordering::Relaxed),
                    timeouts: counters.timeouts.load(Ordering::Relaxed),
                    orphaned_results: counters.orphaned_results.load(Ordering::Relaxed),
                    dead_lettered: counters.dead_lettered.load(Ordering::Relaxed),
                    cache_hits,
                    cache_misses,
                    cache_hit_rate: if cache_total > 0 {
                        cache_hits as f64 / cache_total as f64
                    } else {
                        0.0
                    },
                    latency_avg_ms: latency.avg(),
                    latency_p50_ms: latency.percentile(0.5),
                    latency_p95_ms: latency.percentile(0.95),
                }
            })
            .collect();

        MetricsSnapshot {
            requests_total: self.inner.requests_total.load(Ordering::Relaxed),
            requests_succeeded: self.inner.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: self.inner.requests_failed.load(Ordering::Relaxed),
            request_latency_avg_ms,
            request_latency_p95_ms,
            stages,
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = format!(
            r#"# HELP requests_total Total number of pipeline requests
# TYPE requests_total counter
requests_total {{}} {}

# HELP requests_succeeded_total Requests that produced an artifact
# TYPE requests_succeeded_total counter
requests_succeeded_total {{}} {}

# HELP requests_failed_total Requests that ended in an error
# TYPE requests_failed_total counter
requests_failed_total {{}} {}

# HELP request_latency_avg_ms Average end-to-end request latency in milliseconds
# TYPE request_latency_avg_ms gauge
request_latency_avg_ms {{}} {}

# HELP uptime_seconds Application uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {{}} {}
"#,
            snapshot.requests_total,
            snapshot.requests_succeeded,
            snapshot.requests_failed,
            snapshot.request_latency_avg_ms,
            snapshot.uptime_seconds,
        );

        let series: [(&str, fn(&StageSnapshot) -> String); 6] = [
            ("stage_timeouts_total", |s| s.timeouts.to_string()),
            ("stage_orphaned_results_total", |s| s.orphaned_results.to_string()),
            ("stage_dead_lettered_total", |s| s.dead_lettered.to_string()),
            ("stage_cache_hits_total", |s| s.cache_hits.to_string()),
            ("stage_cache_misses_total", |s| s.cache_misses.to_string()),
            ("stage_latency_avg_ms", |s| s.latency_avg_ms.to_string()),
        ];
        for (name, value) in series {
            out.push_str(&format!("\n# TYPE {} gauge\n", name));
            for stage in &snapshot.stages {
                out.push_str(&format!("{}{{stage=\"{}\"}} {}\n", name, stage.stage, value(stage)));
            }
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSnapshot {
    pub stage: String,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub timeouts: usize,
    pub orphaned_results: usize,
    pub dead_lettered: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub cache_hit_rate: f64,
    pub latency_avg_ms: u64,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests_total: usize,
    pub requests_succeeded: usize,
    pub requests_failed: usize,
    pub request_latency_avg_ms: u64,
    pub request_latency_p95_ms: u64,
    pub stages: Vec<StageSnapshot>,
    pub uptime_seconds: u64,
}

impl MetricsSnapshot {
    pub fn stage(&self, stage: Stage) -> Option<&StageSnapshot> {
        self.stages.iter().find(|s| s.stage == stage.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics::new();

        metrics.record_request_started();
        metrics.record_request_started();
        metrics.record_request_finished(true, Duration::from_millis(120));
        metrics.record_request_finished(false, Duration::from_millis(40));
        metrics.record_timeout(Stage::Translation);
        metrics.record_orphaned_result(Stage::Translation);
        metrics.record_cache_hit(Stage::Detection);
        metrics.record_cache_miss(Stage::Detection);
        metrics.record_dead_letter(Stage::Detection);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_total, 2);
        assert_eq!(snapshot.requests_succeeded, 1);
        assert_eq!(snapshot.requests_failed, 1);
        assert_eq!(snapshot.request_latency_avg_ms, 80);

        let detection = snapshot.stage(Stage::Detection).unwrap();
        assert_eq!(detection.cache_hit_rate, 0.5);
        assert_eq!(detection.dead_lettered, 1);
        assert_eq!(detection.timeouts, 0);

        let translation = snapshot.stage(Stage::Translation).unwrap();
        assert_eq!(translation.timeouts, 1);
        assert_eq!(translation.orphaned_results, 1);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.record_request_started();
        metrics.record_timeout(Stage::Detection);

        let prometheus = metrics.to_prometheus();
        assert!(prometheus.contains("requests_total {} 1"));
        assert!(prometheus.contains("stage_timeouts_total{stage=\"detection\"} 1"));
        assert!(prometheus.contains("stage_timeouts_total{stage=\"translation\"} 0"));
    }

    #[test]
    fn test_latency_window_keeps_recent_samples() {
        let metrics = Metrics::new();
        for _ in 0..LATENCY_WINDOW {
            metrics.record_stage_completed(Stage::Detection, Duration::from_millis(1000));
        }
        for _ in 0..LATENCY_WINDOW {
            metrics.record_stage_completed(Stage::Detection, Duration::from_millis(10));
        }

        let stage = &metrics.inner.stages[Stage::Detection.index()];
        assert_eq!(stage.latency_ms.read().0.len(), LATENCY_WINDOW);

        let snapshot = metrics.snapshot();
        let detection = snapshot.stage(Stage::Detection).unwrap();
        assert_eq!(detection.completed, 2 * LATENCY_WINDOW);
        assert_eq!(detection.latency_avg_ms, 10);
        assert_eq!(detection.latency_p95_ms, 10);
    }
}
