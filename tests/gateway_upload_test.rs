//! Gateway Upload Integration Tests
//!
//! Drives the single-request and multipart pipelines against a mock gateway.
//!
//! ## Test Coverage
//!
//! - Single request vs multipart threshold
//! - Parallel part upload with randomized latency
//! - Merge body ordering and completeness
//! - Too many parts rejected before any request

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rand::Rng;
    use std::io::Write;
    use std::time::Duration;
    use vod_uploadr::checksum::crc32_hex;
    use vod_uploadr::storage::{StorageClient, StorageClientConfig};
    use vod_uploadr::upload::stream::StreamUploader;
    use vod_uploadr::upload::{
        uses_multipart, MultipartHandler, PutObjectHandler, RetryPolicy, UploadError,
        UploadHandler, UploadSource, UploadTarget,
    };
    use wiremock::matchers::{method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    const OK: &str = r#"{"success":0}"#;

    fn client() -> StorageClient {
        StorageClient::new(StorageClientConfig {
            scheme: "http".into(),
            timeout: Some(Duration::from_secs(30)),
        })
        .unwrap()
    }

    fn target_for(server: &MockServer) -> UploadTarget {
        UploadTarget {
            space_name: "space".into(),
            hosts: vec![server.address().to_string()],
            object_id: "tos-space/video".into(),
            session_key: "sk".into(),
            auth_token: "auth".into(),
            ..Default::default()
        }
    }

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut rng = rand::rng();
        (0..len).map(|_| rng.random()).collect()
    }

    async fn mount_init(server: &MockServer, upload_id: &str, expected: u64) {
        Mock::given(method("PUT"))
            .and(path("/tos-space/video"))
            .and(query_param("uploads", ""))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                r#"{{"success":0,"payload":{{"uploadID":"{}"}}}}"#,
                upload_id
            )))
            .expect(expected)
            .mount(server)
            .await;
    }

    async fn mount_merge(server: &MockServer, upload_id: &str, expected: u64) {
        Mock::given(method("PUT"))
            .and(path("/tos-space/video"))
            .and(query_param("uploadID", upload_id))
            .and(query_param_is_missing("partNumber"))
            .respond_with(ResponseTemplate::new(200).set_body_string(OK))
            .expect(expected)
            .mount(server)
            .await;
    }

    fn merge_request(requests: &[Request]) -> Option<String> {
        requests
            .iter()
            .find(|r| {
                r.url.query_pairs().any(|(k, _)| k == "uploadID")
                    && !r.url.query_pairs().any(|(k, _)| k == "partNumber")
            })
            .map(|r| String::from_utf8_lossy(&r.body).to_string())
    }

    // ========================================================================
    // TEST: Threshold
    // ========================================================================

    /// A payload of exactly one chunk goes up in one request
    #[tokio::test]
    async fn test_exactly_one_chunk_is_single_request() {
        let server = MockServer::start().await;
        let data = random_bytes(1024);

        Mock::given(method("PUT"))
            .and(path("/tos-space/video"))
            .and(query_param_is_missing("uploads"))
            .and(wiremock::matchers::header("Content-CRC32", crc32_hex(&data).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_string(OK))
            .expect(1)
            .mount(&server)
            .await;
        mount_init(&server, "never", 0).await;

        assert!(!uses_multipart(data.len() as u64, 1024));
        let handler = PutObjectHandler::new(client());
        handler
            .upload(
                &target_for(&server),
                &UploadSource::Memory(Bytes::from(data)),
                1024,
                0,
            )
            .await
            .unwrap();
    }

    /// One byte over the chunk size switches a stream to multipart with two parts
    #[tokio::test]
    async fn test_one_byte_over_chunk_is_multipart() {
        let server = MockServer::start().await;
        let data = random_bytes(1025);
        mount_init(&server, "up-1", 1).await;
        mount_merge(&server, "up-1", 1).await;
        Mock::given(method("PUT"))
            .and(query_param("uploadID", "up-1"))
            .and(query_param("partNumber", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(OK))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(query_param("uploadID", "up-1"))
            .and(query_param("partNumber", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(OK))
            .expect(1)
            .mount(&server)
            .await;

        assert!(uses_multipart(data.len() as u64, 1024));
        StreamUploader::new(client(), 1024)
            .upload(
                &target_for(&server),
                Box::new(std::io::Cursor::new(data.clone())),
                1025,
            )
            .await
            .unwrap();

        let merge = merge_request(&server.received_requests().await.unwrap()).unwrap();
        assert_eq!(
            merge,
            format!(
                "1:{},2:{}",
                crc32_hex(&data[..1024]),
                crc32_hex(&data[1024..])
            )
        );
    }

    /// A file one byte over the chunk size is multipart; the last part
    /// absorbs the remainder
    #[tokio::test]
    async fn test_file_remainder_absorbed_into_last_part() {
        let server = MockServer::start().await;
        let data = random_bytes(1025);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();

        mount_init(&server, "up-f", 1).await;
        mount_merge(&server, "up-f", 1).await;
        Mock::given(method("PUT"))
            .and(query_param("uploadID", "up-f"))
            .and(query_param("partNumber", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(OK))
            .expect(1)
            .mount(&server)
            .await;

        let handler = MultipartHandler::new(client(), 1024, 2);
        handler
            .upload(
                &target_for(&server),
                &UploadSource::File(file.path().to_path_buf()),
                1025,
                0,
            )
            .await
            .unwrap();

        let merge = merge_request(&server.received_requests().await.unwrap()).unwrap();
        assert_eq!(merge, format!("1:{}", crc32_hex(&data)));
    }

    // ========================================================================
    // TEST: Concurrent workers
    // ========================================================================

    /// 100 parts over 8 workers with random per-part latency: the merge body
    /// lists every part once, in order
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_hundred_parts_with_eight_workers() {
        let server = MockServer::start().await;
        let chunk = 256usize;
        let data = random_bytes(chunk * 100);

        mount_init(&server, "up-100", 1).await;
        mount_merge(&server, "up-100", 1).await;
        let delays: Vec<u64> = {
            let mut rng = rand::rng();
            (0..100).map(|_| rng.random_range(0..40)).collect()
        };
        for (i, delay) in delays.iter().enumerate() {
            Mock::given(method("PUT"))
                .and(query_param("uploadID", "up-100"))
                .and(query_param("partNumber", (i + 1).to_string().as_str()))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_string(OK)
                        .set_delay(Duration::from_millis(*delay)),
                )
                .expect(1)
                .mount(&server)
                .await;
        }

        let handler = MultipartHandler::new(client(), chunk as u64, 8);
        handler
            .upload(
                &target_for(&server),
                &UploadSource::Memory(Bytes::from(data.clone())),
                data.len() as u64,
                0,
            )
            .await
            .unwrap();

        let merge = merge_request(&server.received_requests().await.unwrap()).unwrap();
        let expected: Vec<String> = data
            .chunks(chunk)
            .enumerate()
            .map(|(i, part)| format!("{}:{}", i + 1, crc32_hex(part)))
            .collect();
        assert_eq!(merge, expected.join(","));
    }

    /// A part that keeps failing aborts the upload and no merge is sent
    #[tokio::test]
    async fn test_failed_part_prevents_merge() {
        let server = MockServer::start().await;
        let data = random_bytes(64 * 4);

        mount_init(&server, "up-x", 1).await;
        mount_merge(&server, "up-x", 0).await;
        Mock::given(method("PUT"))
            .and(query_param("uploadID", "up-x"))
            .and(query_param("partNumber", "3"))
            .respond_with(ResponseTemplate::new(500).set_body_string(
                r#"{"success":1,"error":{"code":500,"error_code":5002,"message":"disk full"}}"#,
            ))
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(query_param("uploadID", "up-x"))
            .respond_with(ResponseTemplate::new(200).set_body_string(OK))
            .mount(&server)
            .await;

        let handler = MultipartHandler::new(client(), 64, 2)
            .with_part_retry(RetryPolicy::new(3, Duration::ZERO));
        let err = handler
            .upload(
                &target_for(&server),
                &UploadSource::Memory(Bytes::from(data)),
                256,
                0,
            )
            .await
            .unwrap_err();
        let transfer = err.transfer().unwrap();
        assert_eq!(transfer.error_code, Some(5002));
        assert_eq!(transfer.message, "disk full");
    }

    /// More than 10000 parts is rejected without touching the network
    #[tokio::test]
    async fn test_too_many_parts_rejected() {
        let server = MockServer::start().await;
        mount_init(&server, "never", 0).await;

        let handler = MultipartHandler::new(client(), 1, 4);
        let err = handler
            .upload(
                &target_for(&server),
                &UploadSource::Memory(Bytes::from(vec![0u8; 10])),
                100_000_000_000,
                0,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::TooManyParts { .. }));
    }
}
