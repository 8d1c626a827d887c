//! Gateway response envelope and merge body
//!
//! Every gateway call answers with a JSON envelope:
//!
//! ```json
//! {"success": 0, "error": {"code": 0, "error_code": 0, "message": ""},
//!  "payload": {"uploadID": "...", "meta": {"ObjectContentType": "video/mp4"}}}
//! ```
//!
//! `success == 0` means the call succeeded; anything else carries the error.

use crate::upload::{PartResult, TransferError, UploadError};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayResponse {
    #[serde(default)]
    pub success: i64,
    #[serde(default)]
    pub error: GatewayErrorBody,
    #[serde(default)]
    pub payload: GatewayPayload,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayErrorBody {
    #[serde(default)]
    pub code: i64,
    #[serde(default, alias = "errorCode")]
    pub error_code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayPayload {
    #[serde(default, rename = "uploadID", alias = "uploadId")]
    pub upload_id: String,
    #[serde(default)]
    pub meta: PayloadMeta,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PayloadMeta {
    #[serde(default, rename = "ObjectContentType")]
    pub object_content_type: String,
}

impl GatewayResponse {
    /// Decode a response body.
    ///
    /// A body that is not an envelope is a transfer failure when the status
    /// says the server failed, and a malformed response otherwise.
    pub fn decode(
        status: u16,
        body: &[u8],
        request_id: Option<&str>,
    ) -> Result<Self, UploadError> {
        let preview = || String::from_utf8_lossy(body).chars().take(256).collect::<String>();
        match serde_json::from_slice::<GatewayResponse>(body) {
            Ok(envelope) => Ok(envelope),
            Err(_) if status >= 300 => Err(UploadError::Transfer(TransferError {
                status: Some(status),
                message: format!("unexpected gateway response: {}", preview()),
                request_id: request_id.map(str::to_string),
                ..Default::default()
            })),
            Err(e) => Err(UploadError::MalformedResponse(format!(
                "{}, got result: {}",
                e,
                preview()
            ))),
        }
    }

    /// Turn a failed envelope into an error.
    pub fn into_result(self, status: u16, request_id: Option<&str>) -> Result<Self, UploadError> {
        if self.success == 0 {
            return Ok(self);
        }
        let message = if self.error.message.is_empty() {
            self.error.error.clone()
        } else {
            self.error.message.clone()
        };
        Err(UploadError::Transfer(TransferError {
            status: Some(status),
            code: Some(self.error.code),
            error_code: Some(self.error.error_code),
            message,
            request_id: request_id.map(str::to_string),
        }))
    }

    pub fn content_type_hint(&self) -> Option<String> {
        let hint = &self.payload.meta.object_content_type;
        (!hint.is_empty()).then(|| hint.clone())
    }
}

/// Build the merge body: `"{number}:{checksum}"` joined by commas, in part
/// number order regardless of the order the results arrived in.
pub fn merge_body(parts: &[PartResult]) -> Result<String, UploadError> {
    if parts.is_empty() {
        return Err(UploadError::MultipartError("body crc32 empty".into()));
    }
    let mut ordered: Vec<&PartResult> = parts.iter().collect();
    ordered.sort_by_key(|p| p.number);
    Ok(ordered
        .iter()
        .map(|p| format!("{}:{}", p.number, p.checksum))
        .collect::<Vec<_>>()
        .join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(number: u32, checksum: &str) -> PartResult {
        PartResult {
            number,
            checksum: checksum.to_string(),
            content_type_hint: None,
        }
    }

    #[test]
    fn test_merge_body_is_ordered() {
        let parts = vec![part(3, "c3"), part(1, "c1"), part(2, "c2")];
        assert_eq!(merge_body(&parts).unwrap(), "1:c1,2:c2,3:c3");
    }

    #[test]
    fn test_merge_body_empty_fails() {
        assert!(merge_body(&[]).is_err());
    }

    #[test]
    fn test_decode_success_with_upload_id() {
        let body = br#"{"success":0,"payload":{"uploadID":"up-1"}}"#;
        let envelope = GatewayResponse::decode(200, body, None)
            .unwrap()
            .into_result(200, None)
            .unwrap();
        assert_eq!(envelope.payload.upload_id, "up-1");
        assert_eq!(envelope.content_type_hint(), None);
    }

    #[test]
    fn test_decode_content_type_hint() {
        let body = br#"{"success":0,"payload":{"meta":{"ObjectContentType":"video/mp4"}}}"#;
        let envelope = GatewayResponse::decode(200, body, None).unwrap();
        assert_eq!(envelope.content_type_hint().as_deref(), Some("video/mp4"));
    }

    #[test]
    fn test_failed_envelope_carries_codes() {
        let body = br#"{"success":-1,"error":{"code":500,"error_code":5002,"message":"busy"}}"#;
        let err = GatewayResponse::decode(200, body, Some("log-1"))
            .unwrap()
            .into_result(200, Some("log-1"))
            .unwrap_err();
        let transfer = err.transfer().unwrap();
        assert_eq!(transfer.code, Some(500));
        assert_eq!(transfer.error_code, Some(5002));
        assert_eq!(transfer.message, "busy");
        assert_eq!(transfer.request_id.as_deref(), Some("log-1"));
    }

    #[test]
    fn test_non_json_bodies() {
        let err = GatewayResponse::decode(502, b"bad gateway", None).unwrap_err();
        assert_eq!(err.transfer().unwrap().status, Some(502));

        let err = GatewayResponse::decode(200, b"<html/>", None).unwrap_err();
        assert!(matches!(err, UploadError::MalformedResponse(_)));
    }
}
