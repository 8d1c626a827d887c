//! Control-plane collaborator
//!
//! The control plane allocates upload destinations (`ApplyUploadInfo`) and
//! registers finished objects (`CommitUploadInfo`). Models mirror its JSON
//! wire format, which uses PascalCase field names.

pub mod http;

pub use self::http::{HttpControlPlane, HttpControlPlaneConfig};

use crate::upload::StorageClass;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Control-plane errors
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    #[error("Request error: {0}")]
    RequestError(String),

    #[error("HTTP {status} from control plane (request_id={request_id}): {message}")]
    StatusError {
        status: u16,
        request_id: String,
        message: String,
    },

    #[error("Response error: {0}")]
    ResponseError(String),

    #[error("Service error {code} (request_id={request_id}): {message}")]
    ServiceError {
        code: String,
        message: String,
        request_id: String,
    },
}

impl ControlPlaneError {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ControlPlaneError::StatusError { request_id, .. }
            | ControlPlaneError::ServiceError { request_id, .. }
                if !request_id.is_empty() =>
            {
                Some(request_id)
            }
            _ => None,
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            ControlPlaneError::StatusError { status, .. } => *status,
            ControlPlaneError::ServiceError { .. } => 400,
            _ => 500,
        }
    }
}

/// `ResponseMetadata.Error`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ResponseError {
    pub code: String,
    pub message: String,
}

/// Metadata every control-plane response carries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ResponseMetadata {
    pub request_id: String,
    pub action: String,
    pub version: String,
    pub service: String,
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl ResponseMetadata {
    /// The service error, when one is reported (`Code` other than `"0"`).
    pub fn service_error(&self) -> Option<&ResponseError> {
        self.error
            .as_ref()
            .filter(|e| !e.code.is_empty() && e.code != "0")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ApplyUploadInfoRequest {
    pub space_name: String,
    pub file_type: String,
    pub file_name: String,
    pub file_extension: String,
    pub storage_class: StorageClass,
    pub client_net_work_mode: String,
    #[serde(rename = "ClientIDCMode")]
    pub client_idc_mode: String,
    pub need_fallback: bool,
    pub upload_host_prefer: String,
    pub file_size: f64,
}

/// Where the object is stored and the token that authorizes writing it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StoreInfo {
    pub store_uri: String,
    pub auth: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UploadAddress {
    pub store_infos: Vec<StoreInfo>,
    pub upload_hosts: Vec<String>,
    pub session_key: String,
}

impl UploadAddress {
    /// First store info, if the address has one.
    pub fn store_info(&self) -> Option<&StoreInfo> {
        self.store_infos.first()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CandidateUploadAddresses {
    pub main_upload_addresses: Vec<UploadAddress>,
    pub backup_upload_addresses: Vec<UploadAddress>,
    pub fallback_upload_addresses: Vec<UploadAddress>,
}

impl CandidateUploadAddresses {
    /// Main, then backup, then fallback addresses.
    pub fn in_priority_order(&self) -> impl Iterator<Item = &UploadAddress> {
        self.main_upload_addresses
            .iter()
            .chain(self.backup_upload_addresses.iter())
            .chain(self.fallback_upload_addresses.iter())
    }
}

/// Pre-signed part URLs for a VPC part upload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PartUploadInfo {
    pub part_size: u64,
    pub part_put_urls: Vec<String>,
    pub complete_part_url: String,
    pub complete_url_headers: HashMap<String, String>,
}

/// Private-network upload instructions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct VpcUploadAddress {
    /// `direct` or `part`
    pub upload_mode: String,
    pub put_url: String,
    pub put_url_headers: HashMap<String, String>,
    pub part_upload_info: Option<PartUploadInfo>,
    /// `enable` when the object already exists and no transfer is needed
    pub quick_complete_mode: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ApplyUploadInfoData {
    pub upload_address: Option<UploadAddress>,
    pub candidate_upload_addresses: Option<CandidateUploadAddresses>,
    #[serde(rename = "VpcTosUploadAddress", alias = "VpcUploadAddress")]
    pub vpc_upload_address: Option<VpcUploadAddress>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ApplyUploadInfoResult {
    pub data: ApplyUploadInfoData,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ApplyUploadInfoResponse {
    pub response_metadata: ResponseMetadata,
    pub result: ApplyUploadInfoResult,
}

impl ApplyUploadInfoResponse {
    pub fn request_id(&self) -> &str {
        &self.response_metadata.request_id
    }

    pub fn data(&self) -> &ApplyUploadInfoData {
        &self.result.data
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CommitUploadInfoRequest {
    pub space_name: String,
    pub session_key: String,
    pub callback_args: String,
    pub functions: String,
    pub vod_upload_source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_time: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CommitUploadInfoData {
    pub vid: String,
    pub mid: String,
    pub poster_uri: String,
    pub callback_args: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_info: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CommitUploadInfoResult {
    pub data: CommitUploadInfoData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CommitUploadInfoResponse {
    pub response_metadata: ResponseMetadata,
    pub result: CommitUploadInfoResult,
}

impl CommitUploadInfoResponse {
    /// Best-effort response for a failed upload: the request id and the
    /// error message, nothing else.
    pub fn from_error(request_id: &str, message: &str) -> Self {
        Self {
            response_metadata: ResponseMetadata {
                request_id: request_id.to_string(),
                service: "vod".to_string(),
                error: Some(ResponseError {
                    code: String::new(),
                    message: message.to_string(),
                }),
                ..Default::default()
            },
            result: CommitUploadInfoResult::default(),
        }
    }
}

/// Remote calls the uploader makes against the control plane
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn apply_upload_info(
        &self,
        request: &ApplyUploadInfoRequest,
    ) -> Result<ApplyUploadInfoResponse, ControlPlaneError>;

    async fn commit_upload_info(
        &self,
        request: &CommitUploadInfoRequest,
    ) -> Result<CommitUploadInfoResponse, ControlPlaneError>;
}
