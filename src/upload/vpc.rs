//! VPC direct-to-storage uploads
//!
//! When the control plane hands out pre-signed URLs for a private network
//! target, bytes bypass the gateway:
//!
//! - `direct`: one `PUT` of the whole object to `PutUrl`.
//! - `part`: one `PUT` per pre-signed part URL, in order, then a `POST` of
//!   the part list to `CompletePartUrl`.
//!
//! Storage answers each `PUT` with `x-tos-hash-crc64ecma`, which must match
//! the CRC-64 of the bytes sent. Parts go up sequentially because the part
//! layout is fixed by the URLs, not chosen here.

use super::{read_chunk, ByteStream, TransferError, UploadError};
use crate::checksum::{crc64_ecma_of_reader, crc64_ecma_string};
use crate::control::{PartUploadInfo, VpcUploadAddress};
use crate::telemetry::{NoopReporter, ReportAction, SharedReporter, UploadReport};
use bytes::Bytes;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

/// Client timeout for VPC transfers (15 minutes)
pub const DEFAULT_VPC_TIMEOUT: Duration = Duration::from_secs(900);

pub const HEADER_CRC64: &str = "x-tos-hash-crc64ecma";
pub const HEADER_REQUEST_ID: &str = "x-tos-request-id";

const MODE_DIRECT: &str = "direct";
const MODE_PART: &str = "part";
const QUICK_COMPLETE_ENABLED: &str = "enable";

/// One entry of the completion body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VpcPart {
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct CompleteBody<'a> {
    parts: &'a [VpcPart],
}

/// Number of part URLs storage must have handed out for `size` bytes.
pub fn expected_part_count(size: u64, part_size: u64) -> Result<u64, UploadError> {
    if part_size == 0 {
        return Err(UploadError::InvalidInput("vpc part size is zero".into()));
    }
    let whole = size / part_size;
    Ok(if size % part_size > 0 { whole + 1 } else { whole })
}

/// Check the URL count against the size before anything is sent.
fn check_part_urls(info: &PartUploadInfo, size: u64) -> Result<(), UploadError> {
    // An unknown stream size allows a single part.
    let expected = if size == 0 {
        1
    } else {
        expected_part_count(size, info.part_size)?
    };
    if info.part_put_urls.len() as u64 != expected {
        return Err(UploadError::PartCountMismatch {
            expected,
            actual: info.part_put_urls.len(),
        });
    }
    Ok(())
}

fn url_host(url: &str) -> Result<String, UploadError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| UploadError::InvalidInput(format!("pre-signed url is invalid: {}", e)))?;
    Ok(parsed.host_str().unwrap_or_default().to_string())
}

/// VPC upload client
#[derive(Clone)]
pub struct VpcUploader {
    http: reqwest::Client,
    reporter: SharedReporter,
}

impl std::fmt::Debug for VpcUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VpcUploader").finish_non_exhaustive()
    }
}

impl VpcUploader {
    /// Create a new VPC uploader with the given client timeout
    pub fn new(timeout: Duration) -> Result<Self, UploadError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UploadError::InvalidInput(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            reporter: Arc::new(NoopReporter),
        })
    }

    /// Send telemetry to `reporter`
    pub fn with_reporter(mut self, reporter: SharedReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// Upload a file of `size` bytes as instructed by `address`.
    #[tracing::instrument(
        name = "vpc.upload_file",
        skip(self, address, path),
        fields(mode = %address.upload_mode),
        err
    )]
    pub async fn upload_file(
        &self,
        address: &VpcUploadAddress,
        path: &Path,
        size: u64,
        space_name: &str,
    ) -> Result<(), UploadError> {
        if address.quick_complete_mode == QUICK_COMPLETE_ENABLED {
            tracing::info!("Object already stored, skipping transfer");
            return Ok(());
        }

        match address.upload_mode.as_str() {
            MODE_DIRECT => self.put_file(address, path, size, space_name).await,
            MODE_PART => {
                let info = part_info(address)?;
                check_part_urls(info, size)?;

                let mut file = tokio::fs::File::open(path).await?;
                let last = info.part_put_urls.len() - 1;
                let mut parts = Vec::with_capacity(info.part_put_urls.len());
                let mut offset = 0u64;
                for (i, url) in info.part_put_urls.iter().enumerate() {
                    let length = if i == last { size - offset } else { info.part_size };
                    file.seek(std::io::SeekFrom::Start(offset)).await?;
                    let mut data = vec![0u8; length as usize];
                    file.read_exact(&mut data).await?;

                    let number = (i + 1) as u32;
                    let etag = self.put_part(url, number, Bytes::from(data), space_name).await?;
                    parts.push(VpcPart {
                        part_number: number,
                        etag,
                    });
                    offset += length;
                }

                self.complete(info, &parts, space_name).await
            }
            other => Err(UploadError::InvalidInput(format!(
                "unknown vpc upload mode '{}'",
                other
            ))),
        }
    }

    /// Upload a stream as instructed by `address`.
    ///
    /// `size` is the declared length, or 0 when unknown. The direct mode
    /// streams the body without a CRC-64 check; the part mode buffers one
    /// part at a time and checks each.
    #[tracing::instrument(
        name = "vpc.upload_stream",
        skip(self, address, content),
        fields(mode = %address.upload_mode),
        err
    )]
    pub async fn upload_stream(
        &self,
        address: &VpcUploadAddress,
        mut content: ByteStream,
        size: u64,
        space_name: &str,
    ) -> Result<(), UploadError> {
        if address.quick_complete_mode == QUICK_COMPLETE_ENABLED {
            tracing::info!("Object already stored, skipping transfer");
            return Ok(());
        }

        match address.upload_mode.as_str() {
            MODE_DIRECT => {
                let body = reqwest::Body::wrap_stream(ReaderStream::new(content));
                self.put_direct(address, body, None, None, space_name).await
            }
            MODE_PART => {
                let info = part_info(address)?;
                check_part_urls(info, size)?;

                let mut parts = Vec::with_capacity(info.part_put_urls.len());
                for (i, url) in info.part_put_urls.iter().enumerate() {
                    let data = read_chunk(&mut content, info.part_size).await?;
                    if data.is_empty() {
                        return Err(UploadError::SizeMismatch { declared: size });
                    }
                    let number = (i + 1) as u32;
                    let etag = self.put_part(url, number, data, space_name).await?;
                    parts.push(VpcPart {
                        part_number: number,
                        etag,
                    });
                }

                let mut probe = [0u8; 1];
                if content.read(&mut probe).await? != 0 {
                    return Err(UploadError::SizeMismatch { declared: size });
                }

                self.complete(info, &parts, space_name).await
            }
            other => Err(UploadError::InvalidInput(format!(
                "unknown vpc upload mode '{}'",
                other
            ))),
        }
    }

    async fn put_file(
        &self,
        address: &VpcUploadAddress,
        path: &Path,
        size: u64,
        space_name: &str,
    ) -> Result<(), UploadError> {
        let mut file = tokio::fs::File::open(path).await?;
        let (local, _) = crc64_ecma_of_reader(&mut file).await?;
        file.seek(std::io::SeekFrom::Start(0)).await?;

        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        self.put_direct(address, body, Some(size), Some(local), space_name)
            .await
    }

    async fn put_direct(
        &self,
        address: &VpcUploadAddress,
        body: reqwest::Body,
        length: Option<u64>,
        local_crc64: Option<String>,
        space_name: &str,
    ) -> Result<(), UploadError> {
        let host = url_host(&address.put_url)?;
        let mut request = self.http.put(&address.put_url);
        for (key, value) in &address.put_url_headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(length) = length {
            request = request.header(reqwest::header::CONTENT_LENGTH, length);
        }

        let headers = self
            .send(ReportAction::VpcDirectUpload, &host, space_name, request.body(body))
            .await?;

        if let Some(local) = local_crc64 {
            verify_crc64("object", &local, &headers)?;
        }
        Ok(())
    }

    #[tracing::instrument(name = "vpc.put_part", skip(self, url, data, space_name), fields(bytes = data.len()), err)]
    async fn put_part(
        &self,
        url: &str,
        part_number: u32,
        data: Bytes,
        space_name: &str,
    ) -> Result<String, UploadError> {
        let host = url_host(url)?;
        let local = crc64_ecma_string(&data);
        let request = self.http.put(url).body(data);

        let headers = self
            .send(ReportAction::VpcChunkUpload, &host, space_name, request)
            .await?;

        verify_crc64(&format!("part {}", part_number), &local, &headers)?;
        Ok(headers
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string())
    }

    #[tracing::instrument(name = "vpc.complete", skip(self, info, parts, space_name), fields(parts_count = parts.len()), err)]
    async fn complete(
        &self,
        info: &PartUploadInfo,
        parts: &[VpcPart],
        space_name: &str,
    ) -> Result<(), UploadError> {
        let host = url_host(&info.complete_part_url)?;
        let body = serde_json::to_vec(&CompleteBody { parts })
            .map_err(|e| UploadError::MultipartError(e.to_string()))?;
        let mut request = self.http.post(&info.complete_part_url);
        for (key, value) in &info.complete_url_headers {
            request = request.header(key.as_str(), value.as_str());
        }

        self.send(ReportAction::VpcMergeChunk, &host, space_name, request.body(body))
            .await?;
        Ok(())
    }

    /// Send `request`, require `200 OK`, and report the call.
    async fn send(
        &self,
        action: ReportAction,
        host: &str,
        space_name: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::header::HeaderMap, UploadError> {
        let start = Instant::now();
        let mut report = UploadReport::new(action, space_name, host);

        let result: Result<reqwest::header::HeaderMap, UploadError> = async {
            let response = request
                .send()
                .await
                .map_err(|e| UploadError::Transfer(TransferError::transport(e.to_string())))?;

            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let request_id = headers
                .get(HEADER_REQUEST_ID)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            report.status = Some(status);
            report.request_id = request_id.clone();

            if status != 200 {
                let body = response.text().await.unwrap_or_default();
                return Err(UploadError::Transfer(TransferError {
                    status: Some(status),
                    message: format!("{} error: {}", action, body),
                    request_id,
                    ..Default::default()
                }));
            }
            Ok(headers)
        }
        .await;

        report.latency = start.elapsed();
        if let Err(e) = &result {
            report.error = Some(e.to_string());
        }
        self.reporter.report(report);
        result
    }
}

fn part_info(address: &VpcUploadAddress) -> Result<&PartUploadInfo, UploadError> {
    match &address.part_upload_info {
        Some(info) if !info.part_put_urls.is_empty() => Ok(info),
        _ => Err(UploadError::InvalidInput("empty part upload info".into())),
    }
}

fn verify_crc64(
    target: &str,
    local: &str,
    headers: &reqwest::header::HeaderMap,
) -> Result<(), UploadError> {
    let remote = headers
        .get(HEADER_CRC64)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if remote != local {
        return Err(UploadError::IntegrityMismatch {
            target: target.to_string(),
            local: local.to_string(),
            remote: remote.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(part_size: u64, urls: usize) -> PartUploadInfo {
        PartUploadInfo {
            part_size,
            part_put_urls: (0..urls).map(|i| format!("http://h/p{}", i)).collect(),
            complete_part_url: "http://h/complete".into(),
            complete_url_headers: Default::default(),
        }
    }

    #[test]
    fn test_expected_part_count() {
        assert_eq!(expected_part_count(10, 5).unwrap(), 2);
        assert_eq!(expected_part_count(11, 5).unwrap(), 3);
        assert_eq!(expected_part_count(4, 5).unwrap(), 1);
        assert!(expected_part_count(4, 0).is_err());
    }

    #[test]
    fn test_url_count_must_match() {
        assert!(check_part_urls(&info(5, 3), 11).is_ok());
        assert!(check_part_urls(&info(5, 2), 10).is_ok());

        let err = check_part_urls(&info(5, 2), 11).unwrap_err();
        assert!(matches!(
            err,
            UploadError::PartCountMismatch { expected: 3, actual: 2 }
        ));
        assert!(check_part_urls(&info(5, 3), 10).is_err());
    }

    #[test]
    fn test_completion_body_shape() {
        let parts = vec![VpcPart {
            part_number: 1,
            etag: "\"e1\"".into(),
        }];
        let body = serde_json::to_string(&CompleteBody { parts: &parts }).unwrap();
        assert_eq!(body, r#"{"Parts":[{"PartNumber":1,"ETag":"\"e1\""}]}"#);
    }
}
