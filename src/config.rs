use crate::services::storage_service::DEFAULT_PART_SIZE;
use crate::uploader::SideChannelPolicy;
use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Command-line entry point. Every flag overrides its environment variable,
/// which overrides the built-in default.
#[derive(Parser, Debug)]
#[command(author, version, about = "Streaming multipart upload of screen recordings")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the upload backend
    Serve(ServeArgs),
    /// Stream a media file through the uploader as a live recording
    Upload(UploadArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// Host to bind to (overrides SCREENCAST_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides SCREENCAST_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where payloads are stored (overrides SCREENCAST_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides SCREENCAST_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Base URL put into write targets (overrides SCREENCAST_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Allowed browser origin, `*` for any (overrides SCREENCAST_CORS_ORIGIN)
    #[arg(long)]
    pub cors_origin: Option<String>,

    /// Default part size in bytes (overrides SCREENCAST_PART_SIZE)
    #[arg(long)]
    pub part_size: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

#[derive(Args, Debug)]
pub struct UploadArgs {
    /// Backend base URL (overrides SCREENCAST_API_BASE)
    #[arg(long)]
    pub api_base: Option<String>,

    /// Identity the recording is uploaded for
    #[arg(long)]
    pub user_id: String,

    /// Requested object key; the backend picks one when omitted
    #[arg(long)]
    pub key: Option<String>,

    #[arg(long, default_value = "video/webm")]
    pub content_type: String,

    /// Bytes delivered per timeslice
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Chunk cadence in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub timeslice_ms: u64,

    /// What a failed live-fragment write does: fatal or degraded
    #[arg(long, default_value = "fatal")]
    pub side_channel: SideChannelPolicy,

    /// Per-request timeout in seconds, 0 disables it
    #[arg(long, default_value_t = 60)]
    pub request_timeout_secs: u64,

    /// Media file to upload
    pub input: PathBuf,
}

const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;

/// Backend configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub public_url: String,
    pub cors_origin: Option<String>,
    pub part_size: u64,
    pub migrate: bool,
}

impl ServerConfig {
    pub fn from_args(args: ServeArgs) -> Result<Self> {
        Self::resolve(args, |name| env::var(name).ok())
    }

    /// Merge `args` over the variables `lookup` returns, then defaults.
    pub fn resolve(args: ServeArgs, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let host = args
            .host
            .or_else(|| lookup("SCREENCAST_HOST"))
            .unwrap_or_else(|| "0.0.0.0".into());
        let port = match args.port {
            Some(port) => port,
            None => parse_var(&lookup, "SCREENCAST_PORT")?.unwrap_or(8000),
        };
        let part_size = match args.part_size {
            Some(size) => size,
            None => parse_var(&lookup, "SCREENCAST_PART_SIZE")?.unwrap_or(DEFAULT_PART_SIZE),
        };
        if part_size == 0 {
            bail!("part size must be positive");
        }

        let public_url = args
            .public_url
            .or_else(|| lookup("SCREENCAST_PUBLIC_URL"))
            .unwrap_or_else(|| {
                let reachable = match host.as_str() {
                    "0.0.0.0" | "::" => "127.0.0.1",
                    other => other,
                };
                format!("http://{}:{}", reachable, port)
            });
        let cors_origin = args
            .cors_origin
            .or_else(|| lookup("SCREENCAST_CORS_ORIGIN"))
            .unwrap_or_else(|| "http://localhost:3000".into());

        Ok(Self {
            storage_dir: args
                .storage_dir
                .or_else(|| lookup("SCREENCAST_STORAGE_DIR"))
                .unwrap_or_else(|| "./data/objects".into()),
            database_url: args
                .database_url
                .or_else(|| lookup("SCREENCAST_DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/screencast.db".into()),
            public_url,
            cors_origin: (cors_origin.trim() != "*").then_some(cors_origin),
            part_size,
            migrate: args.migrate,
            host,
            port,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Uploader configuration.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub api_base: String,
    pub user_id: String,
    pub key: Option<String>,
    pub content_type: String,
    pub chunk_size: usize,
    pub timeslice: Duration,
    pub side_channel: SideChannelPolicy,
    pub request_timeout: Option<Duration>,
    pub input: PathBuf,
}

impl UploadConfig {
    pub fn from_args(args: UploadArgs) -> Result<Self> {
        Self::resolve(args, |name| env::var(name).ok())
    }

    pub fn resolve(args: UploadArgs, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if args.user_id.trim().is_empty() {
            bail!("--user-id must not be empty");
        }
        if args.chunk_size == 0 {
            bail!("--chunk-size must be positive");
        }
        if args.timeslice_ms == 0 {
            bail!("--timeslice-ms must be positive");
        }

        Ok(Self {
            api_base: args
                .api_base
                .or_else(|| lookup("SCREENCAST_API_BASE"))
                .unwrap_or_else(|| "http://localhost:8000".into()),
            user_id: args.user_id,
            key: args.key.filter(|k| !k.trim().is_empty()),
            content_type: args.content_type,
            chunk_size: args.chunk_size,
            timeslice: Duration::from_millis(args.timeslice_ms),
            side_channel: args.side_channel,
            request_timeout: (args.request_timeout_secs > 0)
                .then(|| Duration::from_secs(args.request_timeout_secs)),
            input: args.input,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(None),
    }
}
