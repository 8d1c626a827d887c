//! VOD Uploadr - upload files and streams to a VOD space

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use vod_uploadr::config::Config;
use vod_uploadr::session::{FileUploadRequest, StreamUploadRequest, UploadOptions};
use vod_uploadr::upload::StorageClass;
use vod_uploadr::{logging, Uploader};

/// VOD Uploadr - chunked and VPC direct-path uploads
#[derive(Parser, Debug)]
#[command(name = "vod-uploadr")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a local file
    UploadFile {
        path: PathBuf,
        #[command(flatten)]
        common: CommonArgs,
        /// Number of parts uploaded concurrently
        #[arg(long, default_value_t = 0)]
        parallel: usize,
    },
    /// Upload standard input
    UploadStream {
        /// Declared length; 0 when unknown
        #[arg(long, default_value_t = 0)]
        size: u64,
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(clap::Args, Debug)]
struct CommonArgs {
    #[arg(long)]
    space: String,
    /// media, object, or a material type such as image
    #[arg(long, default_value = "media")]
    file_type: String,
    #[arg(long, default_value = "")]
    file_name: String,
    #[arg(long, default_value = "")]
    file_extension: String,
    /// Part size in bytes; 0 uses the configured size
    #[arg(long, default_value_t = 0)]
    chunk_size: u64,
    /// standard, ia or archive
    #[arg(long)]
    storage_class: Option<StorageClass>,
    #[arg(long, default_value = "")]
    callback_args: String,
    #[arg(long, default_value = "")]
    functions: String,
}

impl CommonArgs {
    fn into_options(self) -> UploadOptions {
        UploadOptions {
            space_name: self.space,
            file_type: self.file_type,
            file_name: self.file_name,
            file_extension: self.file_extension,
            callback_args: self.callback_args,
            functions: self.functions,
            storage_class: self.storage_class,
            chunk_size: self.chunk_size,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;
    logging::init_subscriber(&config.logging)?;
    info!("Starting VOD Uploadr v{}", vod_uploadr::VERSION);
    info!("Loaded configuration from {:?}", args.config);

    let uploader = Uploader::from_config(&config)?;

    let result = match args.command {
        Command::UploadFile {
            path,
            common,
            parallel,
        } => {
            let mut options = common.into_options();
            options.parallel_num = parallel;
            let request = FileUploadRequest { path, options };
            match request.options.file_type.as_str() {
                "media" => uploader.upload_media(request).await,
                "object" => uploader.upload_object(request).await,
                _ => uploader.upload_material(request).await,
            }
        }
        Command::UploadStream { size, common } => {
            let options = common.into_options();
            let request = StreamUploadRequest {
                content: Box::new(tokio::io::stdin()),
                size,
                options,
            };
            match request.options.file_type.as_str() {
                "media" => uploader.upload_media_stream(request).await,
                "object" => uploader.upload_object_stream(request).await,
                _ => uploader.upload_material_stream(request).await,
            }
        }
    };

    match result {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Err(e) => {
            error!(request_id = ?e.request_id(), error = %e, "Upload failed");
            println!("{}", serde_json::to_string_pretty(&e.to_response())?);
            Err(e.into())
        }
    }
}
