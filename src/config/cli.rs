use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the imagecache binary.
#[derive(Debug, Parser)]
#[command(
    name = "imagecache",
    version,
    about = "Caching proxy for signed object-store files and image variants"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "IMAGECACHE_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP proxy.
    Serve(Box<ServeArgs>),
    /// Print a signed request path for an object.
    Sign(SignArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct OriginOverrides {
    /// Override the origin backend (s3|local).
    #[arg(long = "origin-backend", value_name = "BACKEND")]
    pub origin_backend: Option<String>,

    /// Override the S3 bucket.
    #[arg(long = "origin-bucket", value_name = "BUCKET")]
    pub origin_bucket: Option<String>,

    /// Override the S3 region.
    #[arg(long = "origin-region", value_name = "REGION")]
    pub origin_region: Option<String>,

    /// Override the S3 endpoint; `[none]` clears it.
    #[arg(long = "origin-endpoint", value_name = "URL", value_hint = ValueHint::Url)]
    pub origin_endpoint: Option<String>,

    /// Toggle path-style S3 addressing.
    #[arg(
        long = "origin-force-path-style",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub origin_force_path_style: Option<bool>,

    /// Allow plain-HTTP origin endpoints.
    #[arg(
        long = "origin-allow-http",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub origin_allow_http: Option<bool>,

    /// Override the directory served by the `local` backend.
    #[arg(
        long = "origin-local-directory",
        value_name = "PATH",
        value_hint = ValueHint::DirPath
    )]
    pub origin_local_directory: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub origin: OriginOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the cache directory.
    #[arg(
        long = "cache-directory",
        value_name = "PATH",
        value_hint = ValueHint::DirPath
    )]
    pub cache_directory: Option<PathBuf>,

    /// Toggle coalescing of concurrent image misses.
    #[arg(
        long = "cache-coalesce-image-misses",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_coalesce_image_misses: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SignKind {
    File,
    Image,
}

impl SignKind {
    pub fn route(self) -> &'static str {
        match self {
            SignKind::File => "file",
            SignKind::Image => "image",
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct SignArgs {
    /// Route the path is signed for.
    #[arg(long, value_enum, default_value_t = SignKind::Image)]
    pub kind: SignKind,

    /// Option segment, e.g. `w:320+h:200+contain+webp`.
    #[arg(long, value_name = "OPTIONS")]
    pub options: String,

    /// Override the signing key.
    #[arg(long = "signing-key", value_name = "KEY")]
    pub signing_key: Option<String>,

    /// Object key inside the origin bucket.
    #[arg(value_name = "OBJECT_PATH")]
    pub object_path: String,
}
