//! Health & readiness handlers.
//!
//! - GET /            -> greeting
//! - GET /api/health  -> liveness in the shape browser clients poll
//! - GET /healthz     -> simple liveness ("ok")
//! - GET /readyz      -> readiness: SQLite, payload disk, open upload count

use crate::{
    models::multipart::UPLOAD_OPEN, services::storage_service::StorageService,
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::fs;
use uuid::Uuid;

/// `GET /`
pub async fn root() -> impl IntoResponse {
    Json(serde_json::json!({ "message": "screencast-upload backend" }))
}

/// `GET /api/health`
pub async fn api_health() -> impl IntoResponse {
    Json(ServiceHealthResponse {
        status: "healthy",
        service: "backend",
    })
}

/// `GET /healthz`
///
/// Liveness probe, never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// `GET /readyz`
///
/// HTTP 200 when every check passes, HTTP 503 otherwise. The body lists
/// each check and, for the metadata store, how many uploads are still open.
pub async fn readyz(State(service): State<StorageService>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    checks.insert("sqlite", check_sqlite(&service).await);
    checks.insert("disk", check_disk(&service).await);

    let ready = checks.values().all(|c| c.ok);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            status: if ready { "ok" } else { "error" },
            checks,
        }),
    )
}

/// Count open uploads; doubles as a round trip through the pool.
async fn check_sqlite(service: &StorageService) -> CheckStatus {
    match sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM multipart_uploads WHERE status = ?")
        .bind(UPLOAD_OPEN)
        .fetch_one(&*service.db)
        .await
    {
        Ok(open) => CheckStatus {
            ok: true,
            error: None,
            open_uploads: Some(open),
        },
        Err(e) => CheckStatus::failed(format!("error: {}", e)),
    }
}

/// Write, read back and remove a probe file under the payload directory.
async fn check_disk(service: &StorageService) -> CheckStatus {
    let probe = service
        .base_path
        .join(format!(".readyz-{}", Uuid::new_v4()));

    let outcome = match fs::write(&probe, b"readyz").await {
        Err(e) => return CheckStatus::failed(format!("could not write probe: {}", e)),
        Ok(_) => match fs::read(&probe).await {
            Ok(bytes) if bytes == b"readyz" => Ok(()),
            Ok(_) => Err("probe content mismatch".to_string()),
            Err(e) => Err(format!("could not read probe: {}", e)),
        },
    };

    // best-effort cleanup; a leftover probe file does not fail readiness
    let cleanup = fs::remove_file(&probe).await;

    match (outcome, cleanup) {
        (Err(e), _) => CheckStatus::failed(e),
        (Ok(()), Err(e)) => CheckStatus {
            ok: true,
            error: Some(format!("could not remove probe: {}", e)),
            open_uploads: None,
        },
        (Ok(()), Ok(())) => CheckStatus {
            ok: true,
            error: None,
            open_uploads: None,
        },
    }
}

#[derive(Serialize)]
struct ServiceHealthResponse {
    status: &'static str,
    service: &'static str,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    open_uploads: Option<i64>,
}

impl CheckStatus {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
            open_uploads: None,
        }
    }
}
