//! PutObject handler
//!
//! Handles payloads that fit in a single chunk: the whole object goes up in
//! one `PUT` with its CRC-32.

use super::{Payload, UploadError, UploadHandler, UploadSource, UploadTarget};
use crate::metrics;
use crate::storage::StorageClient;
use async_trait::async_trait;
use std::time::Instant;

/// Single-request upload handler
#[derive(Debug, Clone)]
pub struct PutObjectHandler {
    client: StorageClient,
}

impl PutObjectHandler {
    pub fn new(client: StorageClient) -> Self {
        Self { client }
    }

    /// Upload a payload already in hand (buffer or stream).
    #[tracing::instrument(
        name = "upload.put_object",
        skip(self, target, payload),
        fields(
            space = %target.space_name,
            host = %target.host(),
            object_id = %target.object_id,
            payload = ?payload,
        ),
        err
    )]
    pub async fn upload_payload(
        &self,
        target: &UploadTarget,
        payload: Payload,
        attempt: u32,
    ) -> Result<(), UploadError> {
        let bytes_written = match &payload {
            Payload::Bytes(b) => b.len() as u64,
            Payload::Stream(_) => 0,
        };
        let start_time = Instant::now();

        let result = self.client.put_object(target, payload, attempt).await;

        let duration = start_time.elapsed();
        metrics::record_upload_duration(&target.space_name, "put_object", duration.as_secs_f64());

        match result {
            Ok(()) => {
                metrics::record_upload_success(&target.space_name, bytes_written);
                tracing::info!(
                    bytes_written = bytes_written,
                    duration_ms = duration.as_millis() as u64,
                    "PutObject upload completed"
                );
                Ok(())
            }
            Err(e) => {
                metrics::record_upload_failure(&target.space_name);
                metrics::record_error("put_object");
                tracing::error!(
                    error = %e,
                    duration_ms = duration.as_millis() as u64,
                    "PutObject upload failed"
                );
                Err(e)
            }
        }
    }
}

#[async_trait]
impl UploadHandler for PutObjectHandler {
    async fn upload(
        &self,
        target: &UploadTarget,
        source: &UploadSource,
        _size: u64,
        attempt: u32,
    ) -> Result<(), UploadError> {
        let data = source.read_all().await?;
        self.upload_payload(target, Payload::Bytes(data), attempt)
            .await
    }

    fn method(&self) -> &'static str {
        "put_object"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageClientConfig;
    use bytes::Bytes;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn handler() -> PutObjectHandler {
        PutObjectHandler::new(
            StorageClient::new(StorageClientConfig {
                scheme: "http".into(),
                timeout: None,
            })
            .unwrap(),
        )
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

    #[tokio::test]
    async fn test_upload_memory_source() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/obj"))
            .and(header("Content-CRC32", "cbf43926"))
            .and(body_bytes(b"123456789".to_vec()))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"success":0}"#))
            .expect(1)
            .mount(&server)
            .await;

        let source = UploadSource::Memory(Bytes::from_static(b"123456789"));
        handler()
            .upload(&target_for(&server), &source, 9, 0)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upload_failure_surfaces_message() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"success":-1,"error":{"code":403,"error_code":4030,"message":"denied"}}"#,
            ))
            .mount(&server)
            .await;

        let source = UploadSource::Memory(Bytes::from_static(b"abc"));
        let err = handler()
            .upload(&target_for(&server), &source, 3, 0)
            .await
            .unwrap_err();
        assert_eq!(err.transfer().unwrap().message, "denied");
    }
}
