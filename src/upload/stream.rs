//! Stream uploads through the gateway
//!
//! A stream cannot be read at random offsets, so parts are cut from it in
//! order, one chunk at a time, and uploaded sequentially. Each chunk is
//! buffered, which gives it a real CRC-32 and the part-tier retry.

use super::retry::RetryPolicy;
use super::{
    read_chunk, uses_multipart, ByteStream, PartResult, Payload, UploadError, UploadTarget,
    MAX_PARTS,
};
use crate::metrics;
use crate::storage::StorageClient;
use bytes::Bytes;
use std::time::Instant;

/// Sequential stream uploader
#[derive(Debug, Clone)]
pub struct StreamUploader {
    client: StorageClient,
    chunk_size: u64,
    part_retry: RetryPolicy,
}

impl StreamUploader {
    pub fn new(client: StorageClient, chunk_size: u64) -> Self {
        Self {
            client,
            chunk_size,
            part_retry: RetryPolicy::default(),
        }
    }

    /// Use `policy` for individual part uploads
    pub fn with_part_retry(mut self, policy: RetryPolicy) -> Self {
        self.part_retry = policy;
        self
    }

    /// Upload `content` to `target` and return the number of bytes sent.
    ///
    /// `size` is the declared length, or 0 when unknown:
    ///
    /// - unknown: the first chunk decides. A short first chunk is the whole
    ///   object and goes up in one request; otherwise multipart.
    /// - up to one chunk: one streamed request, sent unverified.
    /// - more than one chunk: multipart, chunk by chunk until the stream ends.
    #[tracing::instrument(
        name = "upload.stream",
        skip(self, target, content),
        fields(host = %target.host(), object_id = %target.object_id, chunk_size = self.chunk_size),
        err
    )]
    pub async fn upload(
        &self,
        target: &UploadTarget,
        content: ByteStream,
        size: u64,
    ) -> Result<u64, UploadError> {
        if self.chunk_size == 0 {
            return Err(UploadError::InvalidInput("chunk size is zero".into()));
        }
        target.validate()?;
        let start_time = Instant::now();

        match self.transfer(target, content, size).await {
            Ok((method, bytes)) => {
                metrics::record_upload_duration(
                    &target.space_name,
                    method,
                    start_time.elapsed().as_secs_f64(),
                );
                metrics::record_upload_success(&target.space_name, bytes);
                Ok(bytes)
            }
            Err(e) => {
                metrics::record_upload_failure(&target.space_name);
                Err(e)
            }
        }
    }

    /// Pick the request shape and send; yields the method label and bytes sent.
    async fn transfer(
        &self,
        target: &UploadTarget,
        mut content: ByteStream,
        size: u64,
    ) -> Result<(&'static str, u64), UploadError> {
        if size == 0 {
            let first = read_chunk(&mut content, self.chunk_size).await?;
            if (first.len() as u64) < self.chunk_size {
                let bytes = first.len() as u64;
                self.client
                    .put_object(target, Payload::Bytes(first), 0)
                    .await?;
                return Ok(("put_object", bytes));
            }
            let bytes = self.upload_chunks(target, content, Some(first)).await?;
            return Ok(("multipart", bytes));
        }

        if uses_multipart(size, self.chunk_size) {
            let planned = size.div_ceil(self.chunk_size);
            if planned > MAX_PARTS {
                return Err(UploadError::TooManyParts { parts: planned });
            }
            let bytes = self.upload_chunks(target, content, None).await?;
            return Ok(("multipart", bytes));
        }

        self.client
            .put_object(target, Payload::Stream(content), 0)
            .await?;
        Ok(("put_object", size))
    }

    /// Multipart upload of the remaining stream, optionally starting with a
    /// chunk that was already read. Returns the bytes uploaded.
    async fn upload_chunks(
        &self,
        target: &UploadTarget,
        mut content: ByteStream,
        first: Option<Bytes>,
    ) -> Result<u64, UploadError> {
        let upload_id = self.client.init_multipart(target, 0).await?;

        let mut parts: Vec<PartResult> = Vec::new();
        let mut pending = first;
        let mut uploaded: u64 = 0;
        loop {
            let data = match pending.take() {
                Some(data) => data,
                None => read_chunk(&mut content, self.chunk_size).await?,
            };
            if data.is_empty() {
                break;
            }

            let number = parts.len() as u32 + 1;
            if u64::from(number) > MAX_PARTS {
                return Err(UploadError::TooManyParts {
                    parts: u64::from(number),
                });
            }
            uploaded += data.len() as u64;

            let part = self
                .part_retry
                .run(|attempt| {
                    self.client.upload_part(
                        target,
                        &upload_id,
                        number,
                        Payload::Bytes(data.clone()),
                        attempt,
                    )
                })
                .await?;
            parts.push(part);
        }

        if parts.is_empty() {
            return Err(UploadError::InvalidInput("content is empty".into()));
        }

        let content_type = parts
            .first()
            .and_then(|p| p.content_type_hint.as_deref());
        self.client
            .merge_parts(target, &upload_id, &parts, content_type, 0)
            .await?;

        tracing::info!(
            upload_id = %upload_id,
            parts = parts.len(),
            bytes = uploaded,
            "Completed stream multipart upload"
        );
        metrics::record_multipart_upload_success(&target.space_name, parts.len());
        Ok(uploaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageClientConfig;
    use std::time::Duration;
    use wiremock::matchers::{header, method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn uploader(chunk: u64) -> StreamUploader {
        let client = StorageClient::new(StorageClientConfig {
            scheme: "http".into(),
            timeout: None,
        })
        .unwrap();
        StreamUploader::new(client, chunk).with_part_retry(RetryPolicy::new(3, Duration::ZERO))
    }

    fn target_for(server: &MockServer) -> UploadTarget {
        UploadTarget {
            space_name: "space".into(),
            hosts: vec![server.address().to_string()],
            object_id: "obj".into(),
            auth_token: "auth".into(),
            ..Default::default()
        }
    }

    fn stream(len: usize) -> ByteStream {
        Box::new(std::io::Cursor::new(vec![3u8; len]))
    }

    async fn mount_multipart(server: &MockServer, parts: u64) {
        Mock::given(method("PUT"))
            .and(query_param("uploads", ""))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"success":0,"payload":{"uploadID":"up-s"}}"#),
            )
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(query_param("uploadID", "up-s"))
            .and(wiremock::matchers::query_param_is_missing("partNumber"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"success":0}"#))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(query_param("uploadID", "up-s"))
            .and(header("Content-CRC32", crate::checksum::crc32_hex(&[3u8; 10]).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"success":0}"#))
            .expect(parts)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_known_small_size_streams_unverified() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(header("Content-CRC32", "Ignore"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"success":0}"#))
            .expect(1)
            .mount(&server)
            .await;

        uploader(10)
            .upload(&target_for(&server), stream(10), 10)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_known_large_size_uploads_sequential_chunks() {
        let server = MockServer::start().await;
        mount_multipart(&server, 3).await;

        let sent = uploader(10)
            .upload(&target_for(&server), stream(30), 30)
            .await
            .unwrap();
        assert_eq!(sent, 30);
    }

    #[tokio::test]
    async fn test_unknown_size_short_stream_is_single_request() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(header("Content-CRC32", crate::checksum::crc32_hex(&[3u8; 4]).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"success":0}"#))
            .expect(1)
            .mount(&server)
            .await;

        let sent = uploader(10)
            .upload(&target_for(&server), stream(4), 0)
            .await
            .unwrap();
        assert_eq!(sent, 4);
    }

    #[tokio::test]
    async fn test_unknown_size_long_stream_is_multipart() {
        let server = MockServer::start().await;
        mount_multipart(&server, 2).await;

        let sent = uploader(10)
            .upload(&target_for(&server), stream(20), 0)
            .await
            .unwrap();
        assert_eq!(sent, 20);
    }

    #[tokio::test]
    async fn test_unknown_size_counts_bytes_actually_sent() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(query_param("uploads", ""))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"success":0,"payload":{"uploadID":"up-s"}}"#),
            )
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(query_param("uploadID", "up-s"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"success":0}"#))
            .mount(&server)
            .await;

        let before = metrics::UPLOAD_BYTES_TOTAL.get();
        let sent = uploader(10)
            .upload(&target_for(&server), stream(25), 0)
            .await
            .unwrap();
        assert_eq!(sent, 25);
        assert!(metrics::UPLOAD_BYTES_TOTAL.get() - before >= 25.0);
    }

    #[tokio::test]
    async fn test_too_many_parts_counts_as_failure() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let target = UploadTarget {
            space_name: "space-too-many".into(),
            ..target_for(&server)
        };
        let err = uploader(1)
            .upload(&target, stream(4), 100_000)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::TooManyParts { parts: 100_000 }));
        assert_eq!(
            metrics::UPLOADS_TOTAL
                .with_label_values(&["space-too-many", "failure"])
                .get(),
            1.0
        );
    }
}
