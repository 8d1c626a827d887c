//! Upload session facade
//!
//! Ties the pieces together: apply for an upload target, pick the VPC or
//! gateway path, transfer, then commit the session key. Every facade call
//! emits one `finish-upload` telemetry record.
//!
//! The low-level primitives (`create_multipart_upload`, `upload_part`,
//! `complete_multipart_upload`, `put_object`, `upload_content`) are for
//! callers that chunk their own streams against a target built with
//! [`build_upload_target`].

mod target;

pub use target::{build_upload_target, candidate_targets};

use crate::config::{Config, RetryConfig, UploadConfig};
use crate::control::{
    ApplyUploadInfoRequest, ApplyUploadInfoResponse, CommitUploadInfoRequest,
    CommitUploadInfoResponse, ControlPlane, ControlPlaneError, HttpControlPlane,
    HttpControlPlaneConfig,
};
use crate::storage::{StorageClient, StorageClientConfig};
use crate::telemetry::{
    MetricsReporter, NoopReporter, ReportAction, SharedReporter, UploadReport,
};
use crate::upload::retry::with_host_failover;
use crate::upload::stream::StreamUploader;
use crate::upload::vpc::VpcUploader;
use crate::upload::{
    uses_multipart, ByteStream, MultipartHandler, PartResult, Payload, PutObjectHandler,
    RetryPolicy, StorageClass, UploadError, UploadHandler, UploadOutcome, UploadSource,
    UploadTarget,
};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

const FILE_TYPE_MEDIA: &str = "media";
const FILE_TYPE_OBJECT: &str = "object";

/// Stage of a facade call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Validate,
    ApplyUploadInfo,
    Upload,
    CommitUploadInfo,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Validate => "validate",
            Phase::ApplyUploadInfo => "apply upload info",
            Phase::Upload => "upload",
            Phase::CommitUploadInfo => "commit upload info",
        })
    }
}

/// Error from a lower layer
#[derive(Error, Debug)]
pub enum SessionFailure {
    #[error(transparent)]
    Control(#[from] ControlPlaneError),

    #[error(transparent)]
    Upload(#[from] UploadError),
}

/// Facade error: the failing phase, the best request id known at that
/// point, and the cause.
#[derive(Error, Debug)]
#[error("{phase} failed: {source}")]
pub struct SessionError {
    pub phase: Phase,
    pub request_id: Option<String>,
    #[source]
    pub source: SessionFailure,
}

impl SessionError {
    fn new(phase: Phase, request_id: Option<&str>, source: impl Into<SessionFailure>) -> Self {
        let source = source.into();
        let request_id = request_id
            .filter(|id| !id.is_empty())
            .or_else(|| match &source {
                SessionFailure::Control(e) => e.request_id(),
                SessionFailure::Upload(e) => e.request_id(),
            })
            .map(str::to_string);
        Self {
            phase,
            request_id,
            source,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// HTTP-style status code for the failure.
    pub fn status(&self) -> u16 {
        match &self.source {
            SessionFailure::Control(e) => e.status(),
            SessionFailure::Upload(e) => e.status(),
        }
    }

    /// Best-effort commit response carrying the request id and message.
    pub fn to_response(&self) -> CommitUploadInfoResponse {
        CommitUploadInfoResponse::from_error(
            self.request_id().unwrap_or_default(),
            &self.to_string(),
        )
    }
}

/// Fields shared by file and stream uploads
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub space_name: String,
    pub file_type: String,
    pub file_name: String,
    pub file_extension: String,
    pub callback_args: String,
    pub functions: String,
    pub vod_upload_source: String,
    pub expire_time: Option<String>,
    /// Falls back to the configured storage class
    pub storage_class: Option<StorageClass>,
    pub client_net_work_mode: String,
    pub client_idc_mode: String,
    pub upload_host_prefer: String,
    /// 0 uses the configured chunk size
    pub chunk_size: u64,
    /// 0 uses the configured parallelism; file uploads only
    pub parallel_num: usize,
}

/// Upload of a local file
#[derive(Debug, Clone, Default)]
pub struct FileUploadRequest {
    pub path: PathBuf,
    pub options: UploadOptions,
}

/// Upload of a byte stream
pub struct StreamUploadRequest {
    pub content: ByteStream,
    /// Declared length, or 0 when unknown
    pub size: u64,
    pub options: UploadOptions,
}

impl fmt::Debug for StreamUploadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamUploadRequest")
            .field("size", &self.size)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Client-side upload engine
#[derive(Clone)]
pub struct Uploader {
    control: Arc<dyn ControlPlane>,
    storage: StorageClient,
    vpc: VpcUploader,
    reporter: SharedReporter,
    upload: UploadConfig,
    retry: RetryConfig,
}

impl fmt::Debug for Uploader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Uploader")
            .field("upload", &self.upload)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Uploader {
    /// Create an uploader that reports to the metrics registry.
    pub fn new(
        control: Arc<dyn ControlPlane>,
        upload: UploadConfig,
        retry: RetryConfig,
    ) -> Result<Self, UploadError> {
        let reporter: SharedReporter = Arc::new(MetricsReporter);
        let storage = StorageClient::new(StorageClientConfig {
            scheme: upload.scheme.clone(),
            timeout: None,
        })?
        .with_reporter(reporter.clone());
        let vpc = VpcUploader::new(upload.vpc_timeout())?.with_reporter(reporter.clone());
        Ok(Self {
            control,
            storage,
            vpc,
            reporter,
            upload,
            retry,
        })
    }

    /// Create an uploader talking to the HTTP control plane in `config`.
    pub fn from_config(config: &Config) -> Result<Self, UploadError> {
        let control = HttpControlPlane::new(HttpControlPlaneConfig {
            endpoint: config.control_plane.endpoint.clone(),
            token: config.control_plane.token.clone(),
            timeout: Some(config.control_plane.timeout()),
        })
        .map_err(|e| UploadError::InvalidInput(e.to_string()))?;

        let reporter: SharedReporter = if config.telemetry.enabled {
            Arc::new(MetricsReporter)
        } else {
            Arc::new(NoopReporter)
        };

        Ok(Self::new(Arc::new(control), config.upload.clone(), config.retry.clone())?
            .with_reporter(reporter))
    }

    /// Send telemetry to `reporter`
    pub fn with_reporter(mut self, reporter: SharedReporter) -> Self {
        self.storage = self.storage.with_reporter(reporter.clone());
        self.vpc = self.vpc.with_reporter(reporter.clone());
        self.reporter = reporter;
        self
    }

    fn host_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry.host_attempts, self.retry.delay())
    }

    fn part_retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry.part_attempts, self.retry.delay())
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Upload a media file.
    pub async fn upload_media(
        &self,
        mut request: FileUploadRequest,
    ) -> Result<CommitUploadInfoResponse, SessionError> {
        request.options.file_type = FILE_TYPE_MEDIA.to_string();
        self.upload_file(request).await
    }

    /// Upload a material file with the caller's file type.
    pub async fn upload_material(
        &self,
        request: FileUploadRequest,
    ) -> Result<CommitUploadInfoResponse, SessionError> {
        self.upload_file(request).await
    }

    /// Upload a file as a plain object.
    pub async fn upload_object(
        &self,
        mut request: FileUploadRequest,
    ) -> Result<CommitUploadInfoResponse, SessionError> {
        request.options.file_type = FILE_TYPE_OBJECT.to_string();
        self.upload_file(request).await
    }

    pub async fn upload_media_stream(
        &self,
        mut request: StreamUploadRequest,
    ) -> Result<CommitUploadInfoResponse, SessionError> {
        request.options.file_type = FILE_TYPE_MEDIA.to_string();
        self.upload_stream(request).await
    }

    pub async fn upload_material_stream(
        &self,
        request: StreamUploadRequest,
    ) -> Result<CommitUploadInfoResponse, SessionError> {
        self.upload_stream(request).await
    }

    pub async fn upload_object_stream(
        &self,
        mut request: StreamUploadRequest,
    ) -> Result<CommitUploadInfoResponse, SessionError> {
        request.options.file_type = FILE_TYPE_OBJECT.to_string();
        self.upload_stream(request).await
    }

    /// Upload a local file and commit it.
    #[tracing::instrument(
        name = "session.upload_file",
        skip(self, request),
        fields(
            space = %request.options.space_name,
            file_type = %request.options.file_type,
            path = %request.path.display(),
        ),
        err
    )]
    pub async fn upload_file(
        &self,
        request: FileUploadRequest,
    ) -> Result<CommitUploadInfoResponse, SessionError> {
        let start_time = Instant::now();
        let space_name = request.options.space_name.clone();
        let result = self.upload_file_inner(request).await;
        self.report_finish(&space_name, start_time, result.as_ref().err());
        result
    }

    /// Upload a byte stream and commit it.
    #[tracing::instrument(
        name = "session.upload_stream",
        skip(self, request),
        fields(
            space = %request.options.space_name,
            file_type = %request.options.file_type,
            declared_size = request.size,
        ),
        err
    )]
    pub async fn upload_stream(
        &self,
        request: StreamUploadRequest,
    ) -> Result<CommitUploadInfoResponse, SessionError> {
        let start_time = Instant::now();
        let space_name = request.options.space_name.clone();
        let result = self.upload_stream_inner(request).await;
        self.report_finish(&space_name, start_time, result.as_ref().err());
        result
    }

    async fn upload_file_inner(
        &self,
        request: FileUploadRequest,
    ) -> Result<CommitUploadInfoResponse, SessionError> {
        let FileUploadRequest { path, options } = request;

        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|e| SessionError::new(Phase::Validate, None, UploadError::from(e)))?
            .len();
        if size == 0 {
            return Err(SessionError::new(
                Phase::Validate,
                None,
                UploadError::InvalidInput("file size is zero".into()),
            ));
        }

        let chunk_size = self.file_chunk_size(options.chunk_size);
        let parallel = match options.parallel_num {
            0 => self.upload.parallel_num,
            n => n,
        };
        let storage_class = options.storage_class.unwrap_or(self.upload.storage_class);

        let apply = self.apply(&options, storage_class, size).await?;
        let request_id = apply.request_id().to_string();

        let outcome = self
            .transfer_file(&apply, &options.space_name, &path, size, chunk_size, parallel, storage_class)
            .await
            .map_err(|e| SessionError::new(Phase::Upload, Some(&request_id), e))?;

        self.commit(&options, &outcome, &request_id).await
    }

    async fn upload_stream_inner(
        &self,
        request: StreamUploadRequest,
    ) -> Result<CommitUploadInfoResponse, SessionError> {
        let StreamUploadRequest {
            content,
            size,
            options,
        } = request;

        let chunk_size = self
            .stream_chunk_size(options.chunk_size)
            .map_err(|e| SessionError::new(Phase::Validate, None, e))?;
        let storage_class = options.storage_class.unwrap_or(self.upload.storage_class);

        let apply = self.apply(&options, storage_class, size).await?;
        let request_id = apply.request_id().to_string();

        let outcome = self
            .transfer_stream(&apply, &options.space_name, content, size, chunk_size, storage_class)
            .await
            .map_err(|e| SessionError::new(Phase::Upload, Some(&request_id), e))?;

        self.commit(&options, &outcome, &request_id).await
    }

    fn file_chunk_size(&self, requested: u64) -> u64 {
        let requested = if requested == 0 {
            self.upload.chunk_size
        } else {
            requested
        };
        requested.max(self.upload.min_chunk_size)
    }

    fn stream_chunk_size(&self, requested: u64) -> Result<u64, UploadError> {
        let chunk_size = if requested == 0 {
            self.upload.chunk_size
        } else {
            requested
        };
        if chunk_size < self.upload.stream_min_chunk_size {
            return Err(UploadError::InvalidInput(format!(
                "chunk size must be at least {} bytes",
                self.upload.stream_min_chunk_size
            )));
        }
        Ok(chunk_size)
    }

    // ------------------------------------------------------------------
    // Control plane
    // ------------------------------------------------------------------

    async fn apply(
        &self,
        options: &UploadOptions,
        storage_class: StorageClass,
        size: u64,
    ) -> Result<ApplyUploadInfoResponse, SessionError> {
        let request = ApplyUploadInfoRequest {
            space_name: options.space_name.clone(),
            file_type: options.file_type.clone(),
            file_name: options.file_name.clone(),
            file_extension: options.file_extension.clone(),
            storage_class,
            client_net_work_mode: options.client_net_work_mode.clone(),
            client_idc_mode: options.client_idc_mode.clone(),
            need_fallback: true,
            upload_host_prefer: options.upload_host_prefer.clone(),
            file_size: size as f64,
        };

        let start_time = Instant::now();
        match self.control.apply_upload_info(&request).await {
            Ok(resp) => {
                if let Some(error) = resp.response_metadata.service_error() {
                    let err = ControlPlaneError::ServiceError {
                        code: error.code.clone(),
                        message: error.message.clone(),
                        request_id: resp.request_id().to_string(),
                    };
                    return Err(SessionError::new(
                        Phase::ApplyUploadInfo,
                        Some(resp.request_id()),
                        err,
                    ));
                }
                tracing::debug!(request_id = %resp.request_id(), "Applied for upload info");
                Ok(resp)
            }
            Err(e) => {
                self.report_control_failure(
                    ReportAction::ApplyUploadInfo,
                    &options.space_name,
                    start_time,
                    &e,
                );
                Err(SessionError::new(Phase::ApplyUploadInfo, None, e))
            }
        }
    }

    async fn commit(
        &self,
        options: &UploadOptions,
        outcome: &UploadOutcome,
        apply_request_id: &str,
    ) -> Result<CommitUploadInfoResponse, SessionError> {
        let request = CommitUploadInfoRequest {
            space_name: options.space_name.clone(),
            session_key: outcome.session_key.clone(),
            callback_args: options.callback_args.clone(),
            functions: options.functions.clone(),
            vod_upload_source: options.vod_upload_source.clone(),
            expire_time: options.expire_time.clone(),
        };

        let start_time = Instant::now();
        match self.control.commit_upload_info(&request).await {
            Ok(resp) => {
                if let Some(error) = resp.response_metadata.service_error() {
                    let err = ControlPlaneError::ServiceError {
                        code: error.code.clone(),
                        message: error.message.clone(),
                        request_id: resp.response_metadata.request_id.clone(),
                    };
                    return Err(SessionError::new(
                        Phase::CommitUploadInfo,
                        Some(&resp.response_metadata.request_id),
                        err,
                    ));
                }
                tracing::info!(
                    object_id = %outcome.object_id,
                    vid = %resp.result.data.vid,
                    "Upload committed"
                );
                Ok(resp)
            }
            Err(e) => {
                self.report_control_failure(
                    ReportAction::CommitUploadInfo,
                    &options.space_name,
                    start_time,
                    &e,
                );
                let request_id = e.request_id().unwrap_or(apply_request_id).to_string();
                Err(SessionError::new(
                    Phase::CommitUploadInfo,
                    Some(&request_id),
                    e,
                ))
            }
        }
    }

    // ------------------------------------------------------------------
    // Transfer
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn transfer_file(
        &self,
        apply: &ApplyUploadInfoResponse,
        space_name: &str,
        path: &Path,
        size: u64,
        chunk_size: u64,
        parallel: usize,
        storage_class: StorageClass,
    ) -> Result<UploadOutcome, UploadError> {
        if let Some(vpc) = &apply.data().vpc_upload_address {
            self.vpc.upload_file(vpc, path, size, space_name).await?;
            return target::vpc_outcome(apply);
        }

        let targets = candidate_targets(apply, space_name, storage_class)?;
        let handler: Box<dyn UploadHandler> = if uses_multipart(size, chunk_size) {
            Box::new(
                MultipartHandler::new(self.storage.clone(), chunk_size, parallel)
                    .with_part_retry(self.part_retry()),
            )
        } else {
            Box::new(PutObjectHandler::new(self.storage.clone()))
        };
        tracing::debug!(
            method = handler.method(),
            candidates = targets.len(),
            chunk_size,
            "Starting gateway upload"
        );

        let source = UploadSource::File(path.to_path_buf());
        let handler = handler.as_ref();
        let source = &source;
        let ((), target) = with_host_failover(&targets, self.host_retry(), move |target, attempt| async move {
            handler.upload(&target, source, size, attempt).await
        })
        .await?;

        Ok(UploadOutcome {
            object_id: target.object_id,
            session_key: target.session_key,
        })
    }

    async fn transfer_stream(
        &self,
        apply: &ApplyUploadInfoResponse,
        space_name: &str,
        content: ByteStream,
        size: u64,
        chunk_size: u64,
        storage_class: StorageClass,
    ) -> Result<UploadOutcome, UploadError> {
        if let Some(vpc) = &apply.data().vpc_upload_address {
            self.vpc.upload_stream(vpc, content, size, space_name).await?;
            return target::vpc_outcome(apply);
        }

        let target = build_upload_target(apply, space_name, storage_class)?;
        self.upload_content(&target, content, size, chunk_size)
            .await?;

        Ok(UploadOutcome {
            object_id: target.object_id,
            session_key: target.session_key,
        })
    }

    // ------------------------------------------------------------------
    // Low-level primitives
    // ------------------------------------------------------------------

    /// Start a multipart upload on the target's preferred host.
    pub async fn create_multipart_upload(
        &self,
        target: &UploadTarget,
    ) -> Result<String, UploadError> {
        target.validate()?;
        self.storage.init_multipart(target, 0).await
    }

    /// Upload one part of a multipart upload.
    pub async fn upload_part(
        &self,
        target: &UploadTarget,
        upload_id: &str,
        part_number: u32,
        payload: Payload,
    ) -> Result<PartResult, UploadError> {
        target.validate()?;
        if payload.is_empty() {
            return Err(UploadError::InvalidInput("nil data and content".into()));
        }
        if part_number == 0 {
            return Err(UploadError::InvalidInput("part numbers start at 1".into()));
        }
        self.storage
            .upload_part(target, upload_id, part_number, payload, 0)
            .await
    }

    /// Merge the parts of a multipart upload.
    pub async fn complete_multipart_upload(
        &self,
        target: &UploadTarget,
        upload_id: &str,
        parts: &[PartResult],
    ) -> Result<(), UploadError> {
        target.validate()?;
        let content_type = parts
            .iter()
            .find(|p| p.number == 1)
            .and_then(|p| p.content_type_hint.as_deref());
        self.storage
            .merge_parts(target, upload_id, parts, content_type, 0)
            .await
    }

    /// Upload a whole object in one request.
    pub async fn put_object(
        &self,
        target: &UploadTarget,
        payload: Payload,
    ) -> Result<(), UploadError> {
        target.validate()?;
        if payload.is_empty() {
            return Err(UploadError::InvalidInput("nil data and content".into()));
        }
        PutObjectHandler::new(self.storage.clone())
            .upload_payload(target, payload, 0)
            .await
    }

    /// Upload a stream of `size` bytes (0 when unknown) in `chunk_size` parts.
    ///
    /// Returns the number of bytes sent.
    pub async fn upload_content(
        &self,
        target: &UploadTarget,
        content: ByteStream,
        size: u64,
        chunk_size: u64,
    ) -> Result<u64, UploadError> {
        StreamUploader::new(self.storage.clone(), chunk_size)
            .with_part_retry(self.part_retry())
            .upload(target, content, size)
            .await
    }

    // ------------------------------------------------------------------
    // Telemetry
    // ------------------------------------------------------------------

    fn report_finish(&self, space_name: &str, start_time: Instant, error: Option<&SessionError>) {
        let mut report = UploadReport::new(ReportAction::FinishUpload, space_name, "");
        report.latency = start_time.elapsed();
        match error {
            None => report.status = Some(200),
            Some(e) => {
                report.status = Some(e.status());
                report.request_id = e.request_id().map(str::to_string);
                report.error = Some(e.to_string());
            }
        }
        self.reporter.report(report);
    }

    fn report_control_failure(
        &self,
        action: ReportAction,
        space_name: &str,
        start_time: Instant,
        error: &ControlPlaneError,
    ) {
        let mut report = UploadReport::new(action, space_name, "");
        report.latency = start_time.elapsed();
        report.status = Some(error.status());
        report.request_id = error.request_id().map(str::to_string);
        report.error = Some(error.to_string());
        self.reporter.report(report);
    }
}
