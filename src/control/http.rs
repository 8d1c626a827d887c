//! JSON-over-HTTP control-plane client
//!
//! Each call is `POST {endpoint}?Action={name}&Version={version}` with a
//! JSON body and an optional bearer token. Request signing is left to
//! whatever sits in front of the endpoint.

use super::{
    ApplyUploadInfoRequest, ApplyUploadInfoResponse, CommitUploadInfoRequest,
    CommitUploadInfoResponse, ControlPlane, ControlPlaneError, ResponseMetadata,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default timeout for control-plane requests (30 seconds)
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// API version sent with every action
pub const API_VERSION: &str = "2020-08-01";

/// Control-plane client configuration
#[derive(Debug, Clone)]
pub struct HttpControlPlaneConfig {
    /// Base URL (e.g., "https://vod.example.com/")
    pub endpoint: String,
    /// Bearer token; omitted from requests when empty
    pub token: Option<String>,
    /// Request timeout (default: 30 seconds)
    pub timeout: Option<Duration>,
}

/// Control-plane client over HTTP
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    config: HttpControlPlaneConfig,
    client: reqwest::Client,
}

/// Just enough of any response to pull out its metadata
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct MetadataOnly {
    response_metadata: ResponseMetadata,
}

impl HttpControlPlane {
    /// Create a new control-plane client
    pub fn new(config: HttpControlPlaneConfig) -> Result<Self, ControlPlaneError> {
        let timeout = config.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ControlPlaneError::RequestError(e.to_string()))?;

        Ok(Self { config, client })
    }

    #[tracing::instrument(
        name = "control_plane.call",
        skip(self, body),
        fields(endpoint = %self.config.endpoint, request_id),
        err
    )]
    async fn call<Req, Resp>(&self, action: &str, body: &Req) -> Result<Resp, ControlPlaneError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let mut request = self
            .client
            .post(&self.config.endpoint)
            .query(&[("Action", action), ("Version", API_VERSION)])
            .json(body);
        if let Some(token) = self.config.token.as_deref().filter(|t| !t.is_empty()) {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ControlPlaneError::RequestError(e.to_string()))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ControlPlaneError::ResponseError(e.to_string()))?;

        let metadata = serde_json::from_slice::<MetadataOnly>(&bytes)
            .map(|m| m.response_metadata)
            .unwrap_or_default();
        tracing::Span::current().record("request_id", metadata.request_id.as_str());

        if let Some(error) = metadata.service_error() {
            return Err(ControlPlaneError::ServiceError {
                code: error.code.clone(),
                message: error.message.clone(),
                request_id: metadata.request_id.clone(),
            });
        }

        if !status.is_success() {
            return Err(ControlPlaneError::StatusError {
                status: status.as_u16(),
                request_id: metadata.request_id,
                message: String::from_utf8_lossy(&bytes).chars().take(256).collect(),
            });
        }

        serde_json::from_slice(&bytes).map_err(|e| ControlPlaneError::ResponseError(e.to_string()))
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn apply_upload_info(
        &self,
        request: &ApplyUploadInfoRequest,
    ) -> Result<ApplyUploadInfoResponse, ControlPlaneError> {
        self.call("ApplyUploadInfo", request).await
    }

    async fn commit_upload_info(
        &self,
        request: &CommitUploadInfoRequest,
    ) -> Result<CommitUploadInfoResponse, ControlPlaneError> {
        self.call("CommitUploadInfo", request).await
    }
}
