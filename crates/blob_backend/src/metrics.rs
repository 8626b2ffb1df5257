//! Metrics for blob backend operations.

use std::time::Instant;

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter},
};

/// Metrics for range reads and multipart uploads.
#[derive(Clone)]
pub struct BlobMetrics {
    /// Histogram for operation latencies.
    pub operations: Histogram<f64>,

    /// Counter for operation errors.
    pub errors: Counter<u64>,

    /// Physical backend requests issued for logical reads.
    pub physical_requests: Counter<u64>,

    /// Bytes fetched only to fill gaps between requested ranges.
    pub over_fetched_bytes: Counter<u64>,

    /// Native multi-range reads that fell back to per-range requests.
    pub multi_range_fallbacks: Counter<u64>,

    /// Multipart uploads reaching a terminal state, labelled by state.
    pub uploads_finished: Counter<u64>,
}

impl BlobMetrics {
    /// Create new metrics from a meter.
    pub fn new(meter: &Meter) -> Self {
        let operations = meter
            .f64_histogram("blob_backend_operation_duration_seconds")
            .with_description("Duration of blob backend operations in seconds")
            .build();

        let errors = meter
            .u64_counter("blob_backend_errors_total")
            .with_description("Total number of blob backend errors")
            .build();

        let physical_requests = meter
            .u64_counter("blob_backend_physical_requests_total")
            .with_description("Backend requests issued for range reads")
            .build();

        let over_fetched_bytes = meter
            .u64_counter("blob_backend_over_fetched_bytes_total")
            .with_description("Bytes fetched to cover gaps between requested ranges")
            .build();

        let multi_range_fallbacks = meter
            .u64_counter("blob_backend_multi_range_fallbacks_total")
            .with_description("Multi-range reads retried as per-range requests")
            .build();

        let uploads_finished = meter
            .u64_counter("blob_backend_multipart_uploads_finished_total")
            .with_description("Multipart uploads reaching a terminal state")
            .build();

        Self {
            operations,
            errors,
            physical_requests,
            over_fetched_bytes,
            multi_range_fallbacks,
            uploads_finished,
        }
    }

    pub(crate) fn timer(&self, op: &'static str) -> Timer {
        Timer::start_with_labels(&self.operations, &[KeyValue::new("op", op)])
    }

    pub(crate) fn error(&self, op: &'static str) {
        self.errors.add(1, &[KeyValue::new("op", op)]);
    }
}

/// Timer for measuring operation duration.
pub struct Timer {
    start: Instant,
    histogram: Histogram<f64>,
    labels: Vec<KeyValue>,
}

impl Timer {
    /// Start a new timer with labels.
    pub fn start_with_labels(histogram: &Histogram<f64>, labels: &[KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            histogram: histogram.clone(),
            labels: labels.to_vec(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.histogram.record(duration, &self.labels);
    }
}
