//! Upload module
//!
//! Transfers bytes to the storage data plane, either through the shared
//! upload gateway (single-shot or multipart) or straight to storage with
//! pre-signed URLs on the VPC path.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt};

pub mod multipart;
pub mod planner;
pub mod put_object;
pub mod retry;
pub mod stream;
pub mod vpc;

pub use multipart::MultipartHandler;
pub use planner::{PartPlan, PartSpec, MAX_PARTS};
pub use put_object::PutObjectHandler;
pub use retry::{RetryDecision, RetryPolicy};

/// Owned byte stream accepted by the streaming entry points.
pub type ByteStream = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// Failure reported by the data plane, or by the transport underneath it.
///
/// Every field except the message is optional: a connection failure has
/// no HTTP status, a gateway envelope may carry `code` without a sub-code,
/// and only some responses carry a request id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferError {
    /// HTTP status of the response, if one was received.
    pub status: Option<u16>,
    /// `error.code` of the gateway envelope.
    pub code: Option<i64>,
    /// `error.error_code` of the gateway envelope (service sub-code).
    pub error_code: Option<i64>,
    pub message: String,
    /// Server-assigned request id, for support tickets.
    pub request_id: Option<String>,
}

impl TransferError {
    /// A failure before any response arrived.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// True when no response was received at all.
    pub fn is_transport(&self) -> bool {
        self.status.is_none() && self.code.is_none() && self.error_code.is_none()
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(status) = self.status {
            write!(f, " (status={}", status)?;
        } else {
            write!(f, " (status=none")?;
        }
        if let Some(code) = self.code {
            write!(f, ", code={}", code)?;
        }
        if let Some(error_code) = self.error_code {
            write!(f, ", error_code={}", error_code)?;
        }
        if let Some(request_id) = &self.request_id {
            write!(f, ", request_id={}", request_id)?;
        }
        write!(f, ")")
    }
}

impl std::error::Error for TransferError {}

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parts over {max}: {parts} parts planned", max = MAX_PARTS)]
    TooManyParts { parts: u64 },

    #[error("Mismatch part upload: expected {expected} part URLs, got {actual}")]
    PartCountMismatch { expected: u64, actual: usize },

    #[error("Size and content mismatch: stream does not hold exactly {declared} bytes")]
    SizeMismatch { declared: u64 },

    #[error("Transfer error: {0}")]
    Transfer(TransferError),

    #[error("Integrity check failed for {target}: local {local}, storage {remote}")]
    IntegrityMismatch {
        target: String,
        local: String,
        remote: String,
    },

    #[error("Malformed storage response: {0}")]
    MalformedResponse(String),

    #[error("No upload address: {0}")]
    NoUploadAddress(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Multipart upload error: {0}")]
    MultipartError(String),

    #[error("Upload failed after trying {hosts} candidate host(s)")]
    UploadFailed {
        hosts: usize,
        #[source]
        last: Option<Box<UploadError>>,
    },
}

impl UploadError {
    /// The transfer failure behind this error, if any.
    pub fn transfer(&self) -> Option<&TransferError> {
        match self {
            UploadError::Transfer(e) => Some(e),
            _ => None,
        }
    }

    /// Server request id carried by the error, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            UploadError::Transfer(e) => e.request_id.as_deref(),
            UploadError::UploadFailed { last: Some(last), .. } => last.request_id(),
            _ => None,
        }
    }

    /// HTTP status to report for this error.
    pub fn status(&self) -> u16 {
        match self {
            UploadError::Transfer(e) => e.status.unwrap_or(500),
            UploadError::InvalidInput(_)
            | UploadError::TooManyParts { .. }
            | UploadError::PartCountMismatch { .. }
            | UploadError::SizeMismatch { .. }
            | UploadError::NoUploadAddress(_) => 400,
            _ => 500,
        }
    }

    pub fn retry_decision(&self) -> RetryDecision {
        retry::classify(self)
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        UploadError::Transfer(TransferError {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
            ..Default::default()
        })
    }
}

/// Storage class requested for the object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageClass {
    #[default]
    Standard,
    #[serde(rename = "ia", alias = "infrequent_access")]
    InfrequentAccess,
    Archive,
}

impl StorageClass {
    /// Value of the `X-Upload-Storage-Class` header; standard sends none.
    pub fn header_value(&self) -> Option<&'static str> {
        match self {
            StorageClass::Standard => None,
            StorageClass::InfrequentAccess => Some("ia"),
            StorageClass::Archive => Some("archive"),
        }
    }
}

impl std::str::FromStr for StorageClass {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "standard" => Ok(StorageClass::Standard),
            "ia" | "infrequent_access" => Ok(StorageClass::InfrequentAccess),
            "archive" => Ok(StorageClass::Archive),
            other => Err(UploadError::InvalidInput(format!(
                "unknown storage class '{}'",
                other
            ))),
        }
    }
}

/// Negotiated upload destination.
///
/// Built from the control-plane response and immutable once chosen, except
/// that host failover moves `preferred_host_index` along `hosts`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadTarget {
    pub space_name: String,
    pub hosts: Vec<String>,
    pub object_id: String,
    pub session_key: String,
    pub auth_token: String,
    pub storage_class: StorageClass,
    pub preferred_host_index: usize,
}

impl UploadTarget {
    /// Reject targets that cannot be uploaded to.
    pub fn validate(&self) -> Result<(), UploadError> {
        if self.auth_token.is_empty() || self.object_id.is_empty() || self.hosts.is_empty() {
            return Err(UploadError::InvalidInput(
                "wrong upload common info".to_string(),
            ));
        }
        Ok(())
    }

    /// Host to talk to: the preferred one when in range, else the first.
    pub fn host(&self) -> &str {
        let index = if self.preferred_host_index < self.hosts.len() {
            self.preferred_host_index
        } else {
            0
        };
        self.hosts.get(index).map(String::as_str).unwrap_or_default()
    }

    /// Move to the next host. Returns false when none is left.
    pub fn advance_host(&mut self) -> bool {
        if self.preferred_host_index + 1 < self.hosts.len() {
            self.preferred_host_index += 1;
            true
        } else {
            false
        }
    }
}

/// Outcome of one uploaded part; the merge call needs every one of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartResult {
    pub number: u32,
    pub checksum: String,
    /// Only meaningful when returned for part 1.
    pub content_type_hint: Option<String>,
}

/// Where an uploaded object ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub object_id: String,
    pub session_key: String,
}

/// Request body for the low-level primitives.
pub enum Payload {
    /// Fully buffered; hashed before sending.
    Bytes(Bytes),
    /// Streamed as-is; sent with the unverified checksum sentinel.
    Stream(ByteStream),
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Bytes(b) if b.is_empty())
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Bytes(b) => write!(f, "Payload::Bytes({} bytes)", b.len()),
            Payload::Stream(_) => write!(f, "Payload::Stream"),
        }
    }
}

/// Random-access source the multipart pipeline reads parts from.
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// Each read opens its own handle, so workers never share an offset.
    File(PathBuf),
    Memory(Bytes),
}

impl UploadSource {
    /// Read the whole source into memory.
    pub async fn read_all(&self) -> Result<Bytes, UploadError> {
        match self {
            UploadSource::File(path) => Ok(Bytes::from(tokio::fs::read(path).await?)),
            UploadSource::Memory(bytes) => Ok(bytes.clone()),
        }
    }

    /// Read exactly `spec.length` bytes at `spec.offset`.
    pub async fn read_part(&self, spec: &PartSpec) -> Result<Bytes, UploadError> {
        match self {
            UploadSource::File(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(std::io::SeekFrom::Start(spec.offset)).await?;
                let mut data = vec![0u8; spec.length as usize];
                file.read_exact(&mut data).await?;
                Ok(Bytes::from(data))
            }
            UploadSource::Memory(bytes) => {
                let start = spec.offset as usize;
                let end = start + spec.length as usize;
                if end > bytes.len() {
                    return Err(UploadError::InvalidInput(format!(
                        "part {} [{}, {}) is outside the {}-byte buffer",
                        spec.number,
                        start,
                        end,
                        bytes.len()
                    )));
                }
                Ok(bytes.slice(start..end))
            }
        }
    }
}

/// Read up to `limit` bytes; fewer only at end of stream.
pub(crate) async fn read_chunk<R>(reader: &mut R, limit: u64) -> Result<Bytes, UploadError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut data = Vec::with_capacity(limit.min(64 * 1024 * 1024) as usize);
    (&mut *reader).take(limit).read_to_end(&mut data).await?;
    Ok(Bytes::from(data))
}

/// Transfer strategy for a source of known size.
#[async_trait]
pub trait UploadHandler: Send + Sync {
    /// Upload `source` (`size` bytes) to `target`.
    ///
    /// `attempt` is the host-tier attempt number, used for telemetry.
    async fn upload(
        &self,
        target: &UploadTarget,
        source: &UploadSource,
        size: u64,
        attempt: u32,
    ) -> Result<(), UploadError>;

    /// Short name used in metrics labels.
    fn method(&self) -> &'static str;
}

/// Whether a `size`-byte payload goes through the multipart pipeline.
///
/// A payload of exactly one chunk is still sent in a single request.
pub fn uses_multipart(size: u64, chunk_size: u64) -> bool {
    size > chunk_size
}
