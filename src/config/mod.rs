//! Configuration module for VOD Uploadr
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation.

use crate::upload::StorageClass;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

const MIB: u64 = 1024 * 1024;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("VOD_TOKEN", "secret");
/// assert_eq!(expand_env_vars("Bearer ${VOD_TOKEN}"), "Bearer secret");
/// assert_eq!(expand_env_vars("${MISSING:-fallback}"), "fallback");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]+))?\}").unwrap();
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in re.captures_iter(s) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name.as_str()) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);
    result
}

fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub control_plane: ControlPlaneConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_http_url(&self.control_plane.endpoint) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid control plane endpoint '{}': must start with http:// or https://",
                self.control_plane.endpoint
            )));
        }

        let upload = &self.upload;
        match upload.scheme.as_str() {
            "http" | "https" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid scheme '{}': must be 'http' or 'https'",
                    other
                )))
            }
        }

        if upload.min_chunk_size == 0 || upload.stream_min_chunk_size == 0 {
            return Err(ConfigError::ValidationError(
                "Minimum chunk sizes must be greater than zero".into(),
            ));
        }

        if upload.chunk_size < upload.stream_min_chunk_size {
            return Err(ConfigError::ValidationError(format!(
                "chunk_size {} is below stream_min_chunk_size {}",
                upload.chunk_size, upload.stream_min_chunk_size
            )));
        }

        if upload.parallel_num == 0 {
            return Err(ConfigError::ValidationError(
                "parallel_num must be at least 1".into(),
            ));
        }

        if self.retry.host_attempts == 0 || self.retry.part_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "Retry attempts must be at least 1".into(),
            ));
        }

        match self.logging.format.as_str() {
            "text" | "json" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format '{}': must be 'text' or 'json'",
                    other
                )))
            }
        }

        Ok(())
    }
}

/// Control-plane endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    pub endpoint: String,
    /// Bearer token. Supports ${VAR} expansion.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_control_plane_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            token: None,
            timeout_seconds: default_control_plane_timeout(),
        }
    }
}

impl ControlPlaneConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_control_plane_timeout() -> u64 {
    30
}

/// Upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// File uploads raise smaller chunk sizes to this
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: u64,
    /// Stream uploads reject smaller chunk sizes
    #[serde(default = "default_stream_min_chunk_size")]
    pub stream_min_chunk_size: u64,
    #[serde(default = "default_parallel_num")]
    pub parallel_num: usize,
    #[serde(default)]
    pub storage_class: StorageClass,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_vpc_timeout")]
    pub vpc_timeout_seconds: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            min_chunk_size: default_min_chunk_size(),
            stream_min_chunk_size: default_stream_min_chunk_size(),
            parallel_num: default_parallel_num(),
            storage_class: StorageClass::default(),
            scheme: default_scheme(),
            vpc_timeout_seconds: default_vpc_timeout(),
        }
    }
}

impl UploadConfig {
    pub fn vpc_timeout(&self) -> Duration {
        Duration::from_secs(self.vpc_timeout_seconds)
    }
}

fn default_chunk_size() -> u64 {
    20 * MIB
}

fn default_min_chunk_size() -> u64 {
    20 * MIB
}

fn default_stream_min_chunk_size() -> u64 {
    5 * MIB
}

fn default_parallel_num() -> usize {
    1
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_vpc_timeout() -> u64 {
    900
}

/// Retry configuration for the host tier and the part tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_attempts")]
    pub host_attempts: u32,
    #[serde(default = "default_attempts")]
    pub part_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub delay_millis: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            host_attempts: default_attempts(),
            part_attempts: default_attempts(),
            delay_millis: default_retry_delay(),
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_millis)
    }
}

fn default_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    100
}

/// Logging configuration
///
/// ```yaml
/// logging:
///   level: "debug"   # RUST_LOG takes precedence
///   format: "json"   # text or json
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

/// Upload telemetry reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_telemetry_enabled")]
    pub enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: default_telemetry_enabled(),
        }
    }
}

fn default_telemetry_enabled() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            control_plane: ControlPlaneConfig {
                endpoint: "https://vod.example.com".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_upload_defaults() {
        let config = UploadConfig::default();
        assert_eq!(config.chunk_size, 20 * MIB);
        assert_eq!(config.stream_min_chunk_size, 5 * MIB);
        assert_eq!(config.parallel_num, 1);
        assert_eq!(config.vpc_timeout(), Duration::from_secs(900));
        assert_eq!(config.scheme, "https");
    }

    #[test]
    fn test_config_validation() {
        assert!(valid_config().validate().is_ok());

        let mut no_endpoint = valid_config();
        no_endpoint.control_plane.endpoint = "vod.example.com".into();
        assert!(no_endpoint.validate().is_err());

        let mut bad_format = valid_config();
        bad_format.logging.format = "xml".into();
        assert!(bad_format.validate().is_err());

        let mut no_workers = valid_config();
        no_workers.upload.parallel_num = 0;
        assert!(no_workers.validate().is_err());

        let mut tiny_chunk = valid_config();
        tiny_chunk.upload.chunk_size = MIB;
        assert!(tiny_chunk.validate().is_err());
    }

    #[test]
    fn test_expand_env_var_default() {
        assert_eq!(
            expand_env_vars("${VOD_UPLOADR_SURELY_UNSET:-fallback}"),
            "fallback"
        );
        assert_eq!(
            expand_env_vars("keep ${VOD_UPLOADR_SURELY_UNSET}"),
            "keep ${VOD_UPLOADR_SURELY_UNSET}"
        );
    }
}
