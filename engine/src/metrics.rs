//! Prometheus metrics for VIRTA
//!
//! Per route and per stage (processor or sink), the engine keeps counters
//! {messages_in, messages_out, drops, errors, external_timeouts} and
//! histograms {processing_time_ms, queue_depth}. The transport to a
//! dashboard is external; [`Metrics::gather`] renders the standard text
//! format for whatever serves it.

use std::sync::OnceLock;

use parking_lot::Mutex;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use virta_core::{ErrorKind, Result, RouteError};

/// Global metrics instance
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Serializes registration so concurrent `init` calls can't race the
/// Prometheus registry
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// All VIRTA metrics
pub struct Metrics {
    /// Messages entering a stage (by route, stage)
    pub messages_in: CounterVec,

    /// Messages leaving a stage (by route, stage)
    pub messages_out: CounterVec,

    /// Messages dropped without error: filter false, queue full (by route,
    /// stage, reason)
    pub drops: CounterVec,

    /// Errors raised while processing or delivering (by route, stage, kind)
    pub errors: CounterVec,

    /// External subprocesses killed on deadline (by route, stage)
    pub external_timeouts: CounterVec,

    /// Stage processing latency in milliseconds (by route, stage)
    pub processing_time_ms: HistogramVec,

    /// Source-queue depth sampled at each dequeue (by route)
    pub queue_depth: HistogramVec,
}

impl Metrics {
    /// Initialize metrics (idempotent; call once at startup)
    pub fn init() -> Result<&'static Metrics> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }
        let _guard = INIT_LOCK.lock();
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            messages_in: register_counter_vec!(
                "virta_messages_in_total",
                "Messages entering a stage",
                &["route", "stage"]
            )
            .map_err(|e| RouteError::Config(format!("metrics: messages_in: {e}")))?,

            messages_out: register_counter_vec!(
                "virta_messages_out_total",
                "Messages leaving a stage",
                &["route", "stage"]
            )
            .map_err(|e| RouteError::Config(format!("metrics: messages_out: {e}")))?,

            drops: register_counter_vec!(
                "virta_drops_total",
                "Messages dropped without error",
                &["route", "stage", "reason"]
            )
            .map_err(|e| RouteError::Config(format!("metrics: drops: {e}")))?,

            errors: register_counter_vec!(
                "virta_errors_total",
                "Errors raised while processing or delivering",
                &["route", "stage", "kind"]
            )
            .map_err(|e| RouteError::Config(format!("metrics: errors: {e}")))?,

            external_timeouts: register_counter_vec!(
                "virta_external_timeouts_total",
                "External subprocesses terminated on deadline",
                &["route", "stage"]
            )
            .map_err(|e| RouteError::Config(format!("metrics: external_timeouts: {e}")))?,

            processing_time_ms: register_histogram_vec!(
                "virta_processing_time_ms",
                "Stage processing latency in milliseconds",
                &["route", "stage"],
                // 100us to 60s
                vec![0.1, 0.5, 1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 60000.0]
            )
            .map_err(|e| RouteError::Config(format!("metrics: processing_time_ms: {e}")))?,

            queue_depth: register_histogram_vec!(
                "virta_queue_depth",
                "Source-queue depth sampled at each dequeue",
                &["route"],
                vec![0.0, 1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0]
            )
            .map_err(|e| RouteError::Config(format!("metrics: queue_depth: {e}")))?,
        };

        Ok(METRICS.get_or_init(|| metrics))
    }

    /// Get the metrics instance if initialized
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }

    /// Record a message entering a stage
    pub fn record_in(&self, route: &str, stage: &str) {
        self.messages_in.with_label_values(&[route, stage]).inc();
    }

    /// Record a message leaving a stage, with its processing time
    pub fn record_out(&self, route: &str, stage: &str, elapsed: std::time::Duration) {
        self.messages_out.with_label_values(&[route, stage]).inc();
        self.processing_time_ms
            .with_label_values(&[route, stage])
            .observe(elapsed.as_secs_f64() * 1000.0);
    }

    /// Record a clean drop (filter false, aggregate buffering, queue full)
    pub fn record_drop(&self, route: &str, stage: &str, reason: &str) {
        self.drops.with_label_values(&[route, stage, reason]).inc();
    }

    /// Record an error; external timeouts also bump their own counter
    pub fn record_error(&self, route: &str, stage: &str, kind: ErrorKind) {
        self.errors
            .with_label_values(&[route, stage, kind.as_str()])
            .inc();
        if kind == ErrorKind::ExternalTimeout {
            self.external_timeouts
                .with_label_values(&[route, stage])
                .inc();
        }
    }

    /// Sample the source-queue depth for a route
    pub fn observe_queue_depth(&self, route: &str, depth: usize) {
        self.queue_depth
            .with_label_values(&[route])
            .observe(depth as f64);
    }

    /// Render all metrics in the Prometheus text format
    pub fn gather() -> Result<String> {
        let families = prometheus::gather();
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buf)
            .map_err(|e| RouteError::Config(format!("metrics encode: {e}")))?;
        String::from_utf8(buf).map_err(|e| RouteError::Config(format!("metrics encode: {e}")))
    }
}
