//! Upload gateway client
//!
//! Drives the gateway data plane:
//!
//! | Operation | Request | Telemetry action |
//! |-----------|---------|------------------|
//! | Whole object | `PUT {scheme}://{host}/{oid}` | `direct-upload` |
//! | Init multipart | `PUT .../{oid}?uploads` | `init-chunk` |
//! | Upload part | `PUT .../{oid}?partNumber={n}&uploadID={id}` | `chunk-upload` |
//! | Merge parts | `PUT .../{oid}?uploadID={id}` | `merge-chunk` |
//!
//! Every request carries `Authorization`; multipart requests also carry
//! `X-Storage-Mode: gateway`. Archive and IA objects carry
//! `X-Upload-Storage-Class`.

pub mod envelope;

pub use envelope::{merge_body, GatewayResponse};

use crate::checksum::{crc32_hex, UNVERIFIED_CRC32};
use crate::telemetry::{NoopReporter, ReportAction, SharedReporter, UploadReport};
use crate::upload::{Payload, PartResult, StorageClass, TransferError, UploadError, UploadTarget};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::io::ReaderStream;

pub const HEADER_CRC32: &str = "Content-CRC32";
pub const HEADER_STORAGE_MODE: &str = "X-Storage-Mode";
pub const HEADER_STORAGE_CLASS: &str = "X-Upload-Storage-Class";
/// Response header holding the gateway's request id
pub const HEADER_LOG_ID: &str = "X-Tt-Logid";

const STORAGE_MODE_GATEWAY: &str = "gateway";

/// Gateway client configuration
#[derive(Debug, Clone)]
pub struct StorageClientConfig {
    /// `https` in production; tests point at plain `http` servers
    pub scheme: String,
    /// Whole-request timeout; `None` keeps the transport default
    pub timeout: Option<Duration>,
}

impl Default for StorageClientConfig {
    fn default() -> Self {
        Self {
            scheme: "https".to_string(),
            timeout: None,
        }
    }
}

/// Gateway data-plane client
#[derive(Clone)]
pub struct StorageClient {
    http: reqwest::Client,
    scheme: String,
    reporter: SharedReporter,
}

impl std::fmt::Debug for StorageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageClient")
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

impl StorageClient {
    /// Create a new gateway client
    pub fn new(config: StorageClientConfig) -> Result<Self, UploadError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|e| UploadError::InvalidInput(format!("http client: {}", e)))?;

        Ok(Self {
            http,
            scheme: config.scheme,
            reporter: Arc::new(NoopReporter),
        })
    }

    /// Send telemetry to `reporter`
    pub fn with_reporter(mut self, reporter: SharedReporter) -> Self {
        self.reporter = reporter;
        self
    }

    fn object_url(&self, target: &UploadTarget) -> String {
        format!("{}://{}/{}", self.scheme, target.host(), target.object_id)
    }

    fn base_request(
        &self,
        target: &UploadTarget,
        url: &str,
        gateway_mode: bool,
    ) -> reqwest::RequestBuilder {
        let mut request = self
            .http
            .put(url)
            .header(reqwest::header::AUTHORIZATION, &target.auth_token);
        if gateway_mode {
            request = request.header(HEADER_STORAGE_MODE, STORAGE_MODE_GATEWAY);
        }
        if let Some(class) = target.storage_class.header_value() {
            request = request.header(HEADER_STORAGE_CLASS, class);
        }
        request
    }

    /// Upload a whole object in one request
    #[tracing::instrument(
        name = "gateway.put_object",
        skip(self, target, payload),
        fields(host = %target.host(), object_id = %target.object_id),
        err
    )]
    pub async fn put_object(
        &self,
        target: &UploadTarget,
        payload: Payload,
        attempt: u32,
    ) -> Result<(), UploadError> {
        let url = self.object_url(target);
        let (checksum, body) = request_body(payload);
        let request = self
            .base_request(target, &url, false)
            .header(HEADER_CRC32, checksum)
            .body(body);

        self.execute(ReportAction::DirectUpload, target, attempt, request)
            .await?;
        Ok(())
    }

    /// Start a multipart upload and return its upload id
    #[tracing::instrument(
        name = "gateway.init_multipart",
        skip(self, target),
        fields(host = %target.host(), object_id = %target.object_id, upload_id),
        err
    )]
    pub async fn init_multipart(
        &self,
        target: &UploadTarget,
        attempt: u32,
    ) -> Result<String, UploadError> {
        let url = format!("{}?uploads", self.object_url(target));
        let request = self.base_request(target, &url, true);

        let envelope = self
            .execute(ReportAction::InitChunk, target, attempt, request)
            .await?;
        let upload_id = envelope.payload.upload_id;
        if upload_id.is_empty() {
            return Err(UploadError::MalformedResponse(
                "init multipart returned no upload id".into(),
            ));
        }

        tracing::Span::current().record("upload_id", upload_id.as_str());
        tracing::debug!(upload_id = %upload_id, "Created multipart upload");
        Ok(upload_id)
    }

    /// Upload one part
    ///
    /// Buffered parts are sent with their CRC-32, which is echoed into the
    /// returned result for the merge body. Streamed parts are sent unverified.
    #[tracing::instrument(
        name = "gateway.upload_part",
        skip(self, target, payload),
        fields(host = %target.host(), upload_id = %upload_id),
        err
    )]
    pub async fn upload_part(
        &self,
        target: &UploadTarget,
        upload_id: &str,
        part_number: u32,
        payload: Payload,
        attempt: u32,
    ) -> Result<PartResult, UploadError> {
        let url = self.object_url(target);
        let (checksum, body) = request_body(payload);
        let request = self
            .base_request(target, &url, true)
            .query(&[
                ("partNumber", part_number.to_string()),
                ("uploadID", upload_id.to_string()),
            ])
            .header(HEADER_CRC32, checksum.as_str())
            .body(body);

        let envelope = self
            .execute(ReportAction::ChunkUpload, target, attempt, request)
            .await?;

        Ok(PartResult {
            number: part_number,
            checksum,
            content_type_hint: envelope.content_type_hint(),
        })
    }

    /// Merge uploaded parts into the final object
    ///
    /// For Archive and IA objects the content type reported for part 1 is
    /// forwarded as the `ObjectContentType` query parameter.
    #[tracing::instrument(
        name = "gateway.merge_parts",
        skip(self, target, parts, content_type),
        fields(host = %target.host(), upload_id = %upload_id, parts_count = parts.len()),
        err
    )]
    pub async fn merge_parts(
        &self,
        target: &UploadTarget,
        upload_id: &str,
        parts: &[PartResult],
        content_type: Option<&str>,
        attempt: u32,
    ) -> Result<(), UploadError> {
        let body = merge_body(parts)?;
        let url = self.object_url(target);
        let mut request = self
            .base_request(target, &url, true)
            .query(&[("uploadID", upload_id)]);

        if target.storage_class != StorageClass::Standard {
            if let Some(content_type) = content_type.filter(|c| !c.is_empty()) {
                request = request.query(&[("ObjectContentType", content_type)]);
            }
        }

        self.execute(
            ReportAction::MergeChunk,
            target,
            attempt,
            request.body(body),
        )
        .await?;
        Ok(())
    }

    /// Send `request`, decode the envelope, and report the call.
    async fn execute(
        &self,
        action: ReportAction,
        target: &UploadTarget,
        attempt: u32,
        request: reqwest::RequestBuilder,
    ) -> Result<GatewayResponse, UploadError> {
        let start = Instant::now();
        let mut report = UploadReport::new(action, &target.space_name, target.host());
        report.retry_count = attempt;

        let result = self.send(request, &mut report).await;

        report.latency = start.elapsed();
        if let Err(e) = &result {
            report.error = Some(e.to_string());
        }
        self.reporter.report(report);
        result
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        report: &mut UploadReport,
    ) -> Result<GatewayResponse, UploadError> {
        let response = request
            .send()
            .await
            .map_err(|e| UploadError::Transfer(TransferError::transport(e.to_string())))?;

        let status = response.status().as_u16();
        let request_id = response
            .headers()
            .get(HEADER_LOG_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        report.status = Some(status);
        report.request_id = request_id.clone();

        let body = response.bytes().await.map_err(|e| {
            UploadError::Transfer(TransferError {
                status: Some(status),
                message: format!("read response body: {}", e),
                request_id: request_id.clone(),
                ..Default::default()
            })
        })?;

        GatewayResponse::decode(status, &body, request_id.as_deref())?
            .into_result(status, request_id.as_deref())
    }
}

/// Checksum header value and request body for a payload.
fn request_body(payload: Payload) -> (String, reqwest::Body) {
    match payload {
        Payload::Bytes(bytes) => (crc32_hex(&bytes), reqwest::Body::from(bytes)),
        Payload::Stream(reader) => (
            UNVERIFIED_CRC32.to_string(),
            reqwest::Body::wrap_stream(ReaderStream::new(reader)),
        ),
    }
}
