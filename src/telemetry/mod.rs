//! Upload telemetry
//!
//! One [`UploadReport`] is emitted per network call (and one per facade
//! call) to a [`Reporter`]. Reporting is fire-and-forget: a reporter never
//! fails the upload it describes.

use crate::metrics;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Which call a report describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportAction {
    ApplyUploadInfo,
    InitChunk,
    ChunkUpload,
    MergeChunk,
    DirectUpload,
    VpcDirectUpload,
    VpcChunkUpload,
    VpcMergeChunk,
    CommitUploadInfo,
    FinishUpload,
}

impl ReportAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportAction::ApplyUploadInfo => "apply-upload-info",
            ReportAction::InitChunk => "init-chunk",
            ReportAction::ChunkUpload => "chunk-upload",
            ReportAction::MergeChunk => "merge-chunk",
            ReportAction::DirectUpload => "direct-upload",
            ReportAction::VpcDirectUpload => "vpc-direct-upload",
            ReportAction::VpcChunkUpload => "vpc-chunk-upload",
            ReportAction::VpcMergeChunk => "vpc-merge-chunk",
            ReportAction::CommitUploadInfo => "commit-upload-info",
            ReportAction::FinishUpload => "finish-upload",
        }
    }
}

impl fmt::Display for ReportAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One telemetry record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub action: ReportAction,
    pub space_name: String,
    pub host: String,
    pub latency: Duration,
    /// HTTP status, when a response was received
    pub status: Option<u16>,
    pub retry_count: u32,
    pub request_id: Option<String>,
    pub error: Option<String>,
}

impl UploadReport {
    pub fn new(action: ReportAction, space_name: &str, host: &str) -> Self {
        Self {
            action,
            space_name: space_name.to_string(),
            host: host.to_string(),
            latency: Duration::ZERO,
            status: None,
            retry_count: 0,
            request_id: None,
            error: None,
        }
    }

    pub fn latency_micros(&self) -> u128 {
        self.latency.as_micros()
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Sink for telemetry records.
pub trait Reporter: Send + Sync {
    fn report(&self, report: UploadReport);
}

/// Shared reporter handle.
pub type SharedReporter = Arc<dyn Reporter>;

/// Logs each record and feeds the request metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsReporter;

impl Reporter for MetricsReporter {
    fn report(&self, report: UploadReport) {
        metrics::record_request(
            report.action.as_str(),
            report.is_success(),
            report.latency.as_secs_f64(),
        );

        match &report.error {
            None => tracing::debug!(
                action = %report.action,
                space = %report.space_name,
                host = %report.host,
                latency_us = report.latency_micros() as u64,
                status = ?report.status,
                retry = report.retry_count,
                request_id = ?report.request_id,
                "Upload call finished"
            ),
            Some(error) => {
                metrics::record_error(report.action.as_str());
                tracing::warn!(
                    action = %report.action,
                    space = %report.space_name,
                    host = %report.host,
                    latency_us = report.latency_micros() as u64,
                    status = ?report.status,
                    retry = report.retry_count,
                    request_id = ?report.request_id,
                    error = %error,
                    "Upload call failed"
                )
            }
        }
    }
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn report(&self, _report: UploadReport) {}
}

/// Keeps every record in memory; handy in tests.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    reports: std::sync::Mutex<Vec<UploadReport>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<UploadReport> {
        self.reports
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, action: ReportAction) -> usize {
        self.reports().iter().filter(|r| r.action == action).count()
    }
}

impl Reporter for MemoryReporter {
    fn report(&self, report: UploadReport) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_tags() {
        assert_eq!(ReportAction::ChunkUpload.as_str(), "chunk-upload");
        assert_eq!(ReportAction::VpcMergeChunk.to_string(), "vpc-merge-chunk");
        assert_eq!(ReportAction::FinishUpload.as_str(), "finish-upload");
    }

    #[test]
    fn test_memory_reporter_collects() {
        let reporter = MemoryReporter::new();
        let mut report = UploadReport::new(ReportAction::InitChunk, "space", "host");
        report.latency = Duration::from_micros(1500);
        reporter.report(report.clone());
        reporter.report(UploadReport::new(ReportAction::ChunkUpload, "space", "host"));

        assert_eq!(reporter.reports().len(), 2);
        assert_eq!(reporter.count(ReportAction::InitChunk), 1);
        assert_eq!(reporter.reports()[0].latency_micros(), 1500);
    }

    #[test]
    fn test_metrics_reporter_does_not_panic() {
        let mut report = UploadReport::new(ReportAction::DirectUpload, "space", "host");
        report.error = Some("boom".into());
        MetricsReporter.report(report);
    }
}
