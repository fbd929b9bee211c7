#![allow(dead_code)]

use screencast_upload::{
    routes,
    services::{
        self,
        storage_service::{ServiceSettings, StorageService},
    },
};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// A backend served on an ephemeral localhost port, backed by in-memory
/// SQLite and a temporary payload directory.
pub struct TestServer {
    pub base_url: String,
    pub service: StorageService,
    _dir: TempDir,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

pub fn can_bind_localhost() -> bool {
    std::net::TcpListener::bind("127.0.0.1:0").is_ok()
}

pub async fn spawn_backend(part_size: u64) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());

    let dir = tempfile::tempdir().unwrap();
    let db = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    services::run_migrations(&db).await.unwrap();

    let service = StorageService::new(
        Arc::new(db),
        dir.path().to_path_buf(),
        ServiceSettings::new(base_url.clone(), part_size),
    );
    let app = routes::app(service.clone(), None);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base_url,
        service,
        _dir: dir,
    }
}
