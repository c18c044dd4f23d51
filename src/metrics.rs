//! Prometheus metrics registry (§6).
//!
//! A single [`Metrics`] handle is constructed once at process start and
//! passed by reference into every component that needs it, per Design
//! Note "Global singletons" — there is no implicit first-use global
//! registry. `prometheus`'s vec types are internally `Arc`-backed, so
//! cloning `Metrics` is cheap and safe to share across workflows; the
//! counters/gauges/histograms themselves are lock-free.

use std::time::Duration;

use prometheus::{
    exponential_buckets, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};

#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,
    bytes_transferred_total: IntCounterVec,
    files_transferred_total: IntCounterVec,
    operations_total: IntCounterVec,
    progress_percent: IntGaugeVec,
    speed_bytes_per_second: IntGaugeVec,
    queue_depth: IntGauge,
    concurrent_count: IntGauge,
    duration_seconds: HistogramVec,
    queue_wait_seconds: prometheus::Histogram,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let labels = &["namespace", "pvc", "destination_namespace"];

        let bytes_transferred_total = IntCounterVec::new(
            Opts::new(
                "dr_syncer_pvc_sync_bytes_transferred_total",
                "Total bytes transferred per PVC sync",
            ),
            labels,
        )?;
        let files_transferred_total = IntCounterVec::new(
            Opts::new(
                "dr_syncer_pvc_sync_files_transferred_total",
                "Total files transferred per PVC sync",
            ),
            labels,
        )?;
        let operations_total = IntCounterVec::new(
            Opts::new(
                "dr_syncer_pvc_sync_operations_total",
                "Total sync operations by outcome",
            ),
            &["namespace", "pvc", "destination_namespace", "status"],
        )?;
        let progress_percent = IntGaugeVec::new(
            Opts::new(
                "dr_syncer_pvc_sync_progress_percent",
                "Current sync progress percentage",
            ),
            labels,
        )?;
        let speed_bytes_per_second = IntGaugeVec::new(
            Opts::new(
                "dr_syncer_pvc_sync_speed_bytes_per_second",
                "Observed transfer speed",
            ),
            labels,
        )?;
        let queue_depth = IntGauge::new(
            "dr_syncer_pvc_sync_queue_depth",
            "Workflows waiting for a concurrency slot",
        )?;
        let concurrent_count = IntGauge::new(
            "dr_syncer_pvc_sync_concurrent_count",
            "Workflows currently holding a concurrency slot",
        )?;
        let duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "dr_syncer_pvc_sync_duration_seconds",
                "Sync workflow duration",
            )
            .buckets(exponential_buckets(1.0, 2.0, 16)?),
            &["namespace", "pvc", "destination_namespace", "status"],
        )?;
        let queue_wait_seconds = prometheus::Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "dr_syncer_pvc_sync_queue_wait_seconds",
                "Time spent waiting for a concurrency slot",
            )
            .buckets(exponential_buckets(0.1, 2.0, 13)?),
        )?;

        registry.register(Box::new(bytes_transferred_total.clone()))?;
        registry.register(Box::new(files_transferred_total.clone()))?;
        registry.register(Box::new(operations_total.clone()))?;
        registry.register(Box::new(progress_percent.clone()))?;
        registry.register(Box::new(speed_bytes_per_second.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(concurrent_count.clone()))?;
        registry.register(Box::new(duration_seconds.clone()))?;
        registry.register(Box::new(queue_wait_seconds.clone()))?;

        Ok(Self {
            registry,
            bytes_transferred_total,
            files_transferred_total,
            operations_total,
            progress_percent,
            speed_bytes_per_second,
            queue_depth,
            concurrent_count,
            duration_seconds,
            queue_wait_seconds,
        })
    }

    /// Builds a registry that is never `register`ed globally; used by
    /// unit tests that only need working counters, not a shared process
    /// registry.
    #[cfg(test)]
    pub fn new_for_test() -> Self {
        Self::new().expect("metric registration should never conflict in a fresh registry")
    }

    pub fn record_bytes_transferred(&self, namespace: &str, pvc: &str, dest_ns: &str, bytes: u64) {
        self.bytes_transferred_total
            .with_label_values(&[namespace, pvc, dest_ns])
            .inc_by(bytes);
    }

    pub fn record_files_transferred(&self, namespace: &str, pvc: &str, dest_ns: &str, files: u64) {
        self.files_transferred_total
            .with_label_values(&[namespace, pvc, dest_ns])
            .inc_by(files);
    }

    pub fn record_operation(&self, namespace: &str, pvc: &str, dest_ns: &str, status: &str) {
        self.operations_total
            .with_label_values(&[namespace, pvc, dest_ns, status])
            .inc();
    }

    pub fn set_progress(&self, namespace: &str, pvc: &str, dest_ns: &str, percent: i64) {
        self.progress_percent
            .with_label_values(&[namespace, pvc, dest_ns])
            .set(percent);
    }

    pub fn set_speed(&self, namespace: &str, pvc: &str, dest_ns: &str, bytes_per_second: i64) {
        self.speed_bytes_per_second
            .with_label_values(&[namespace, pvc, dest_ns])
            .set(bytes_per_second);
    }

    pub fn set_queue_depth(&self, waiting: i64) {
        self.queue_depth.set(waiting);
    }

    pub fn set_concurrent_count(&self, active: i64) {
        self.concurrent_count.set(active);
    }

    pub fn observe_duration(
        &self,
        namespace: &str,
        pvc: &str,
        dest_ns: &str,
        status: &str,
        elapsed: Duration,
    ) {
        self.duration_seconds
            .with_label_values(&[namespace, pvc, dest_ns, status])
            .observe(elapsed.as_secs_f64());
    }

    pub fn observe_queue_wait(&self, elapsed: Duration) {
        self.queue_wait_seconds.observe(elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_gauges_accept_labelled_updates() {
        let metrics = Metrics::new_for_test();
        metrics.record_bytes_transferred("src", "pvc-a", "dst", 1_234_890);
        metrics.record_files_transferred("src", "pvc-a", "dst", 3);
        metrics.record_operation("src", "pvc-a", "dst", "success");
        metrics.set_progress("src", "pvc-a", "dst", 100);
        metrics.set_queue_depth(2);
        metrics.set_concurrent_count(1);
        metrics.observe_duration("src", "pvc-a", "dst", "success", Duration::from_secs(12));
        metrics.observe_queue_wait(Duration::from_millis(250));

        let families = metrics.registry.gather();
        assert!(!families.is_empty());
    }
}
