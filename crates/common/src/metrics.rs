//! Metrics collection for LLMPerf
//!
//! This module provides Prometheus metrics for the scheduling loop and the engine.
//! Updating a metric is a single atomic operation so they can sit on the hot path.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for LLMPerf
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub scheduler: SchedulerMetrics,
    pub engine: EngineMetrics,
}

/// Scheduler-related metrics
#[derive(Debug, Clone)]
pub struct SchedulerMetrics {
    /// Total number of submitted requests
    pub requests_total: IntCounter,

    /// Requests that reached FINISH
    pub requests_finished: IntCounter,

    /// Requests that reached ERROR
    pub requests_failed: IntCounter,

    /// Tokens generated total
    pub tokens_generated_total: IntCounter,

    /// Packets currently in the live set
    pub active_packets: IntGauge,

    /// Packets submitted but not yet admitted
    pub pending_packets: IntGauge,

    /// Rows per executed batch
    pub batch_size: Histogram,

    /// Submission to first token
    pub time_to_first_token: Histogram,
}

/// Engine-specific metrics
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    /// Executor forward pass duration
    pub forward_duration: Histogram,

    /// Time spent distributing inputs to the rank group
    pub broadcast_duration: Histogram,

    /// Prefill steps executed
    pub prefill_steps: IntCounter,

    /// Decode steps executed
    pub decode_steps: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("valid counter definition")
}

fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::new(name, help).expect("valid gauge definition")
}

fn histogram(name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .expect("valid histogram definition")
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let scheduler = SchedulerMetrics {
            requests_total: counter(
                "scheduler_requests_total",
                "Total number of submitted generation requests",
            ),
            requests_finished: counter(
                "scheduler_requests_finished_total",
                "Requests that completed generation",
            ),
            requests_failed: counter(
                "scheduler_requests_failed_total",
                "Requests that ended in error",
            ),
            tokens_generated_total: counter(
                "scheduler_tokens_generated_total",
                "Total number of tokens generated",
            ),
            active_packets: gauge(
                "scheduler_active_packets",
                "Packets currently admitted into the live set",
            ),
            pending_packets: gauge(
                "scheduler_pending_packets",
                "Packets waiting for admission",
            ),
            batch_size: histogram(
                "scheduler_batch_size",
                "Batch size distribution",
                vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0],
            ),
            time_to_first_token: histogram(
                "scheduler_time_to_first_token_seconds",
                "Time from submission to the first generated token",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            ),
        };

        let engine = EngineMetrics {
            forward_duration: histogram(
                "engine_forward_duration_seconds",
                "Executor forward pass duration in seconds",
                vec![0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5],
            ),
            broadcast_duration: histogram(
                "engine_broadcast_duration_seconds",
                "Time to distribute batch inputs across ranks",
                vec![0.00001, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05],
            ),
            prefill_steps: counter("engine_prefill_steps_total", "Prefill steps executed"),
            decode_steps: counter("engine_decode_steps_total", "Decode steps executed"),
        };

        // Register all metrics
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(scheduler.requests_total.clone()),
            Box::new(scheduler.requests_finished.clone()),
            Box::new(scheduler.requests_failed.clone()),
            Box::new(scheduler.tokens_generated_total.clone()),
            Box::new(scheduler.active_packets.clone()),
            Box::new(scheduler.pending_packets.clone()),
            Box::new(scheduler.batch_size.clone()),
            Box::new(scheduler.time_to_first_token.clone()),
            Box::new(engine.forward_duration.clone()),
            Box::new(engine.broadcast_duration.clone()),
            Box::new(engine.prefill_steps.clone()),
            Box::new(engine.decode_steps.clone()),
        ];
        for collector in collectors {
            registry.register(collector).expect("metric registered once");
        }

        MetricsRegistry {
            registry,
            scheduler,
            engine,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper trait for measuring latency
pub trait LatencyTimer {
    /// Observe the duration of a closure
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R;
}

impl LatencyTimer for Histogram {
    fn time<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let start = std::time::Instant::now();
        let result = f();
        self.observe(start.elapsed().as_secs_f64());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new();

        // Record some metrics
        metrics.scheduler.requests_total.inc();
        metrics.scheduler.active_packets.set(3);
        metrics.engine.prefill_steps.inc();

        // Gather metrics
        let output = metrics.gather();
        assert!(output.contains("scheduler_requests_total 1"));
        assert!(output.contains("scheduler_active_packets 3"));
        assert!(output.contains("engine_prefill_steps_total 1"));
    }

    #[test]
    fn test_latency_timer_records_observation() {
        let metrics = MetricsRegistry::new();

        let value = metrics.engine.forward_duration.time(|| 7);

        assert_eq!(value, 7);
        assert_eq!(metrics.engine.forward_duration.get_sample_count(), 1);
    }
}
