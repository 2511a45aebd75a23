//! Metrics collection for llmq
//!
//! Prometheus metrics for the job queue, the model lifecycle and the
//! generation streams.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for llmq
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub jobs: JobMetrics,
    pub models: ModelMetrics,
    pub streams: StreamMetrics,
}

/// Job queue metrics
#[derive(Debug, Clone)]
pub struct JobMetrics {
    /// Jobs accepted by submit
    pub submitted_total: IntCounter,

    /// Requests rejected by validation
    pub rejected_total: IntCounter,

    pub completed_total: IntCounter,
    pub failed_total: IntCounter,
    pub cancelled_total: IntCounter,

    /// Jobs redelivered after their claim lease expired
    pub redelivered_total: IntCounter,

    /// Current number of queued jobs
    pub queue_depth: IntGauge,

    /// Time from submit to claim
    pub queue_wait: Histogram,

    /// Time from claim to finalization
    pub job_duration: Histogram,
}

/// Model lifecycle metrics
#[derive(Debug, Clone)]
pub struct ModelMetrics {
    /// Completed model switches
    pub switches_total: IntCounter,

    /// Switches that failed after all retries
    pub switch_failures_total: IntCounter,

    /// Switches refused by the capacity check
    pub capacity_rejections_total: IntCounter,

    /// Callers that joined an in-flight switch instead of starting one
    pub coalesced_total: IntCounter,

    /// Duration of a model switch
    pub switch_duration: Histogram,

    /// 1 while a model is active
    pub resident: IntGauge,
}

/// Generation stream metrics
#[derive(Debug, Clone)]
pub struct StreamMetrics {
    /// Tokens forwarded to subscribers
    pub tokens_total: IntCounter,

    /// Streams aborted by the inactivity timer
    pub timeouts_total: IntCounter,

    /// Currently open backend streams
    pub active_streams: IntGauge,

    /// Currently attached subscribers
    pub subscribers: IntGauge,

    /// Time from stream open to first token
    pub time_to_first_token: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid counter definition");
    registry
        .register(Box::new(counter.clone()))
        .expect("unique metric name");
    counter
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("valid gauge definition");
    registry
        .register(Box::new(gauge.clone()))
        .expect("unique metric name");
    gauge
}

fn histogram(registry: &Registry, name: &str, help: &str, buckets: Vec<f64>) -> Histogram {
    let histogram = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets))
        .expect("valid histogram definition");
    registry
        .register(Box::new(histogram.clone()))
        .expect("unique metric name");
    histogram
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        let jobs = JobMetrics {
            submitted_total: counter(&registry, "llmq_jobs_submitted_total", "Jobs accepted by submit"),
            rejected_total: counter(&registry, "llmq_jobs_rejected_total", "Requests rejected by validation"),
            completed_total: counter(&registry, "llmq_jobs_completed_total", "Jobs that completed"),
            failed_total: counter(&registry, "llmq_jobs_failed_total", "Jobs that failed"),
            cancelled_total: counter(&registry, "llmq_jobs_cancelled_total", "Jobs that were cancelled"),
            redelivered_total: counter(
                &registry,
                "llmq_jobs_redelivered_total",
                "Jobs redelivered after their claim lease expired",
            ),
            queue_depth: gauge(&registry, "llmq_queue_depth", "Current number of queued jobs"),
            queue_wait: histogram(
                &registry,
                "llmq_queue_wait_seconds",
                "Time from submit to claim",
                vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0],
            ),
            job_duration: histogram(
                &registry,
                "llmq_job_duration_seconds",
                "Time from claim to finalization",
                vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0],
            ),
        };

        let models = ModelMetrics {
            switches_total: counter(&registry, "llmq_model_switches_total", "Completed model switches"),
            switch_failures_total: counter(
                &registry,
                "llmq_model_switch_failures_total",
                "Model switches that failed after all retries",
            ),
            capacity_rejections_total: counter(
                &registry,
                "llmq_model_capacity_rejections_total",
                "Model switches refused by the capacity check",
            ),
            coalesced_total: counter(
                &registry,
                "llmq_model_switch_coalesced_total",
                "Callers that joined an in-flight model switch",
            ),
            switch_duration: histogram(
                &registry,
                "llmq_model_switch_duration_seconds",
                "Duration of a model switch",
                vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0],
            ),
            resident: gauge(&registry, "llmq_model_resident", "1 while a model is active"),
        };

        let streams = StreamMetrics {
            tokens_total: counter(&registry, "llmq_stream_tokens_total", "Tokens forwarded to subscribers"),
            timeouts_total: counter(
                &registry,
                "llmq_stream_timeouts_total",
                "Streams aborted by the inactivity timer",
            ),
            active_streams: gauge(&registry, "llmq_active_streams", "Currently open backend streams"),
            subscribers: gauge(&registry, "llmq_subscribers", "Currently attached subscribers"),
            time_to_first_token: histogram(
                &registry,
                "llmq_time_to_first_token_seconds",
                "Time from stream open to first token",
                vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 120.0],
            ),
        };

        MetricsRegistry {
            registry,
            jobs,
            models,
            streams,
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
