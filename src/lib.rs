//! VOD Uploadr Library
//!
//! Client-side upload engine for an object-storage-backed media service.
//!
//! # Features
//!
//! - **Gateway uploads**: single request or multipart with a worker pool
//! - **Host failover**: main, backup and fallback hosts with classified retry
//! - **VPC direct path**: pre-signed URLs with CRC-64 verification
//! - **Integrity**: CRC-32 on every gateway request
//!
//! # Example
//!
//! ```no_run
//! use vod_uploadr::{config::Config, session::{FileUploadRequest, UploadOptions}, Uploader};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let uploader = Uploader::from_config(&config)?;
//!     let response = uploader
//!         .upload_media(FileUploadRequest {
//!             path: "video.mp4".into(),
//!             options: UploadOptions {
//!                 space_name: "my-space".into(),
//!                 ..Default::default()
//!             },
//!         })
//!         .await?;
//!     println!("{}", response.result.data.vid);
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod config;
pub mod control;
pub mod logging;
pub mod metrics;
pub mod session;
pub mod storage;
pub mod telemetry;
pub mod upload;

// Re-export commonly used types
pub use config::Config;
pub use session::{SessionError, Uploader};
pub use upload::{UploadError, UploadTarget};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
