//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{fmt, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

mod cli;

pub use cli::{CliArgs, Command, OriginOverrides, ServeArgs, ServeOverrides, SignArgs, SignKind};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "imagecache";
const ENV_PREFIX: &str = "IMAGECACHE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_CACHE_DIR: &str = "./data/cache";
const DEFAULT_REGION: &str = "localhost";
/// Endpoint value that explicitly means "use the provider default".
const ENDPOINT_NONE: &str = "[none]";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub origin: OriginSettings,
    pub signing: SigningSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub directory: PathBuf,
    pub coalesce_image_misses: bool,
}

#[derive(Debug, Clone)]
pub enum OriginSettings {
    S3(S3Settings),
    Local { directory: PathBuf },
}

#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<SecretString>,
    pub force_path_style: bool,
    pub allow_http: bool,
}

#[derive(Debug, Clone)]
pub struct SigningSettings {
    pub key: SecretString,
}

/// A string that never appears in `Debug` or `Display` output.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Sign(args)) => raw.apply_sign_overrides(args),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    origin: RawOriginSettings,
    signing: RawSigningSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(directory) = overrides.cache_directory.as_ref() {
            self.cache.directory = Some(directory.clone());
        }
        if let Some(coalesce) = overrides.cache_coalesce_image_misses {
            self.cache.coalesce_image_misses = Some(coalesce);
        }

        self.apply_origin_overrides(&overrides.origin);
    }

    fn apply_origin_overrides(&mut self, overrides: &OriginOverrides) {
        if let Some(backend) = overrides.origin_backend.as_ref() {
            self.origin.backend = Some(backend.clone());
        }
        if let Some(bucket) = overrides.origin_bucket.as_ref() {
            self.origin.bucket = Some(bucket.clone());
        }
        if let Some(region) = overrides.origin_region.as_ref() {
            self.origin.region = Some(region.clone());
        }
        if let Some(endpoint) = overrides.origin_endpoint.as_ref() {
            self.origin.endpoint = Some(endpoint.clone());
        }
        if let Some(value) = overrides.origin_force_path_style {
            self.origin.force_path_style = Some(value);
        }
        if let Some(value) = overrides.origin_allow_http {
            self.origin.allow_http = Some(value);
        }
        if let Some(directory) = overrides.origin_local_directory.as_ref() {
            self.origin.local_directory = Some(directory.clone());
        }
    }

    fn apply_sign_overrides(&mut self, args: &SignArgs) {
        if let Some(key) = args.signing_key.as_ref() {
            self.signing.key = Some(key.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            origin,
            signing,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let origin = build_origin_settings(origin)?;
        let signing = build_signing_settings(signing)?;

        Ok(Self {
            server,
            logging,
            cache,
            origin,
            signing,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }
    let graceful_shutdown = Duration::from_secs(graceful_secs);

    Ok(ServerSettings {
        addr,
        graceful_shutdown,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let directory = cache
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "cache.directory",
            "path must not be empty",
        ));
    }

    Ok(CacheSettings {
        directory,
        coalesce_image_misses: cache.coalesce_image_misses.unwrap_or(true),
    })
}

fn build_origin_settings(origin: RawOriginSettings) -> Result<OriginSettings, LoadError> {
    let backend = origin
        .backend
        .as_deref()
        .map(str::trim)
        .unwrap_or("s3")
        .to_ascii_lowercase();

    match backend.as_str() {
        "s3" => {
            let bucket = non_empty(origin.bucket).ok_or_else(|| {
                LoadError::invalid("origin.bucket", "required for the s3 backend")
            })?;
            let region = non_empty(origin.region).unwrap_or_else(|| DEFAULT_REGION.to_string());
            let endpoint = non_empty(origin.endpoint).filter(|value| value != ENDPOINT_NONE);

            Ok(OriginSettings::S3(S3Settings {
                bucket,
                region,
                endpoint,
                access_key_id: non_empty(origin.access_key_id),
                secret_access_key: non_empty(origin.secret_access_key).map(SecretString::new),
                force_path_style: origin.force_path_style.unwrap_or(false),
                allow_http: origin.allow_http.unwrap_or(false),
            }))
        }
        "local" => {
            let directory = origin
                .local_directory
                .filter(|path| !path.as_os_str().is_empty())
                .ok_or_else(|| {
                    LoadError::invalid("origin.local_directory", "required for the local backend")
                })?;
            Ok(OriginSettings::Local { directory })
        }
        other => Err(LoadError::invalid(
            "origin.backend",
            format!("unknown backend `{other}` (expected s3 or local)"),
        )),
    }
}

fn build_signing_settings(signing: RawSigningSettings) -> Result<SigningSettings, LoadError> {
    let key = signing
        .key
        .filter(|value| !value.is_empty())
        .ok_or_else(|| LoadError::invalid("signing.key", "must be set and non-empty"))?;

    Ok(SigningSettings {
        key: SecretString::new(key),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    directory: Option<PathBuf>,
    coalesce_image_misses: Option<bool>,
}

#[derive(Clone, Deserialize, Default)]
#[serde(default)]
struct RawOriginSettings {
    backend: Option<String>,
    bucket: Option<String>,
    region: Option<String>,
    endpoint: Option<String>,
    access_key_id: Option<String>,
    secret_access_key: Option<String>,
    force_path_style: Option<bool>,
    allow_http: Option<bool>,
    local_directory: Option<PathBuf>,
}

impl fmt::Debug for RawOriginSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawOriginSettings")
            .field("backend", &self.backend)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field(
                "secret_access_key",
                &self.secret_access_key.as_ref().map(|_| "[redacted]"),
            )
            .field("force_path_style", &self.force_path_style)
            .field("allow_http", &self.allow_http)
            .field("local_directory", &self.local_directory)
            .finish()
    }
}

#[derive(Clone, Deserialize, Default)]
#[serde(default)]
struct RawSigningSettings {
    key: Option<String>,
}

impl fmt::Debug for RawSigningSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSigningSettings")
            .field("key", &self.key.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests;
