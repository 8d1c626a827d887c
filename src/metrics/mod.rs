//! Metrics module
//!
//! Prometheus metrics for uploads and data-plane requests.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec, Counter,
    CounterVec, Encoder, Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // Upload metrics
    pub static ref UPLOADS_TOTAL: CounterVec = register_counter_vec!(
        "vod_uploadr_uploads_total",
        "Total number of uploads",
        &["space", "status"]
    ).unwrap();

    pub static ref UPLOAD_BYTES_TOTAL: Counter = register_counter!(
        "vod_uploadr_upload_bytes_total",
        "Total bytes uploaded"
    ).unwrap();

    pub static ref UPLOAD_DURATION: HistogramVec = register_histogram_vec!(
        "vod_uploadr_upload_duration_seconds",
        "Upload duration in seconds",
        &["space", "method"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 60.0, 300.0]
    ).unwrap();

    // Multipart metrics
    pub static ref MULTIPART_UPLOADS: CounterVec = register_counter_vec!(
        "vod_uploadr_multipart_uploads_total",
        "Total multipart uploads",
        &["space", "status"]
    ).unwrap();

    pub static ref MULTIPART_PARTS: Histogram = register_histogram!(
        "vod_uploadr_multipart_parts",
        "Number of parts per multipart upload",
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 10000.0]
    ).unwrap();

    // Data-plane and control-plane request metrics
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "vod_uploadr_requests_total",
        "Requests by action and outcome",
        &["action", "status"]
    ).unwrap();

    pub static ref REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "vod_uploadr_request_duration_seconds",
        "Request latency in seconds",
        &["action"],
        vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]
    ).unwrap();

    // Error metrics
    pub static ref ERRORS_TOTAL: CounterVec = register_counter_vec!(
        "vod_uploadr_errors_total",
        "Total errors",
        &["type"]
    ).unwrap();
}

/// Record a successful upload
pub fn record_upload_success(space: &str, bytes: u64) {
    UPLOADS_TOTAL.with_label_values(&[space, "success"]).inc();
    UPLOAD_BYTES_TOTAL.inc_by(bytes as f64);
}

/// Record a failed upload
pub fn record_upload_failure(space: &str) {
    UPLOADS_TOTAL.with_label_values(&[space, "failure"]).inc();
}

/// Record upload duration
pub fn record_upload_duration(space: &str, method: &str, duration_secs: f64) {
    UPLOAD_DURATION
        .with_label_values(&[space, method])
        .observe(duration_secs);
}

/// Record one request against the control or data plane
pub fn record_request(action: &str, success: bool, duration_secs: f64) {
    let status = if success { "success" } else { "failure" };
    REQUESTS_TOTAL.with_label_values(&[action, status]).inc();
    REQUEST_DURATION
        .with_label_values(&[action])
        .observe(duration_secs);
}

/// Record an error
pub fn record_error(error_type: &str) {
    ERRORS_TOTAL.with_label_values(&[error_type]).inc();
}

/// Record a successful multipart upload
pub fn record_multipart_upload_success(space: &str, parts_count: usize) {
    MULTIPART_UPLOADS
        .with_label_values(&[space, "success"])
        .inc();
    MULTIPART_PARTS.observe(parts_count as f64);
}

/// Record a failed multipart upload
pub fn record_multipart_upload_failure(space: &str) {
    MULTIPART_UPLOADS
        .with_label_values(&[space, "failure"])
        .inc();
}

/// Render the default registry in the Prometheus text format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_upload_success() {
        let before = UPLOAD_BYTES_TOTAL.get();
        record_upload_success("metrics-upload-space", 1024);

        assert_eq!(
            UPLOADS_TOTAL
                .with_label_values(&["metrics-upload-space", "success"])
                .get(),
            1.0
        );
        assert!(UPLOAD_BYTES_TOTAL.get() - before >= 1024.0);

        let text = gather_text();
        assert!(text.contains(
            r#"vod_uploadr_uploads_total{space="metrics-upload-space",status="success"} 1"#
        ));
        assert!(text.contains("vod_uploadr_upload_bytes_total"));
    }

    #[test]
    fn test_record_request() {
        record_request("metrics-test-action", true, 0.02);
        record_request("metrics-test-action", false, 0.5);
        record_request("metrics-test-action", false, 0.7);

        let text = gather_text();
        assert!(text.contains(
            r#"vod_uploadr_requests_total{action="metrics-test-action",status="success"} 1"#
        ));
        assert!(text.contains(
            r#"vod_uploadr_requests_total{action="metrics-test-action",status="failure"} 2"#
        ));
        assert!(text.contains(
            r#"vod_uploadr_request_duration_seconds_count{action="metrics-test-action"} 3"#
        ));
    }

    #[test]
    fn test_record_multipart_upload_outcomes() {
        record_multipart_upload_success("metrics-multipart-space", 5);
        record_multipart_upload_failure("metrics-multipart-space");

        let text = gather_text();
        assert!(text.contains(
            r#"vod_uploadr_multipart_uploads_total{space="metrics-multipart-space",status="success"} 1"#
        ));
        assert!(text.contains(
            r#"vod_uploadr_multipart_uploads_total{space="metrics-multipart-space",status="failure"} 1"#
        ));
        assert!(text.contains("vod_uploadr_multipart_parts_count"));
    }

    #[test]
    fn test_gather_text_contains_errors() {
        record_error("metrics-test-error");
        let text = gather_text();
        assert!(text.contains(r#"vod_uploadr_errors_total{type="metrics-test-error"} 1"#));
    }
}
