use anyhow::{Context, Result};
use clap::Parser;
use screencast_upload::{
    config::{Cli, Command, ServerConfig, UploadConfig},
    recorder::{self, ReaderCapture},
    routes,
    services::{
        self,
        storage_service::{ServiceSettings, StorageService},
    },
    uploader::{CoordinatorOptions, HttpUploadClient, RecordingSession, UploadCoordinator},
};
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Serve(args) => serve(ServerConfig::from_args(args)?).await,
        Command::Upload(args) => upload(UploadConfig::from_args(args)?).await,
    }
}

async fn serve(cfg: ServerConfig) -> Result<()> {
    tracing::info!("Starting upload backend with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if !db_path.starts_with(":memory:") {
        let db_path = Path::new(db_path);
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }

        // SQLx refuses to create the file itself without `mode=rwc`
        if let Err(e) = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(db_path)
        {
            tracing::warn!("Failed to open database file manually: {}", e);
        }
    }

    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
            .with_context(|| format!("connecting to {}", db_url))?,
    );

    // --- Schema ---
    services::run_migrations(&db).await?;
    if cfg.migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Initialize core service ---
    let settings = ServiceSettings::new(cfg.public_url.clone(), cfg.part_size);
    let storage = StorageService::new(db.clone(), cfg.storage_dir.clone(), settings);
    let app = routes::app(storage, cfg.cors_origin.as_deref());

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn upload(cfg: UploadConfig) -> Result<()> {
    let client = Arc::new(HttpUploadClient::new(&cfg.api_base, cfg.request_timeout)?);

    let filename = cfg
        .input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "recording.webm".into());
    let recording = RecordingSession::new(
        cfg.user_id.clone(),
        cfg.key.clone().unwrap_or_default(),
        cfg.content_type.clone(),
    );
    let options = CoordinatorOptions {
        side_channel: cfg.side_channel,
        filename,
        ..CoordinatorOptions::default()
    };
    let coordinator = UploadCoordinator::new(client, recording, options);

    let mut status = coordinator.subscribe();
    let watcher = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let snapshot = status.borrow_and_update().clone();
            match snapshot.error {
                Some(error) => tracing::error!("status: {} ({})", snapshot.status, error),
                None => tracing::info!("status: {}", snapshot.status),
            }
        }
    });

    let stop = CancellationToken::new();
    let on_ctrl_c = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, finishing the upload");
            on_ctrl_c.cancel();
        }
    });

    let mut device = ReaderCapture::open_file(&cfg.input, cfg.chunk_size, cfg.timeslice);
    let result = recorder::record(&coordinator, &mut device, stop).await;
    drop(coordinator);
    let _ = watcher.await;

    let summary = result.context("recording upload failed")?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    Ok(())
}
