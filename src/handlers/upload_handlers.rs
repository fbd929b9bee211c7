//! HTTP handlers for the multipart-upload API under `/api/upload`.
//!
//! Each handler deserializes the JSON contract from `models::upload` and
//! delegates to `StorageService`.

use crate::{
    errors::AppError,
    models::upload::{
        AbortUploadQuery, AbortUploadResponse, CompleteUploadRequest, CompleteUploadResponse,
        InitiateUploadRequest, InitiateUploadResponse, SignChunkRequest, SignChunkResponse,
        SignPartRequest, SignPartResponse,
    },
    services::storage_service::StorageService,
};
use axum::{
    Json,
    extract::{Query, State},
};

/// `POST /api/upload/initiate`
pub async fn initiate_upload(
    State(service): State<StorageService>,
    Json(req): Json<InitiateUploadRequest>,
) -> Result<Json<InitiateUploadResponse>, AppError> {
    Ok(Json(service.initiate_upload(req).await?))
}

/// `POST /api/upload/sign-part`
pub async fn sign_part(
    State(service): State<StorageService>,
    Json(req): Json<SignPartRequest>,
) -> Result<Json<SignPartResponse>, AppError> {
    Ok(Json(service.sign_part(req).await?))
}

/// `POST /api/upload/sign-chunk`
pub async fn sign_chunk(
    State(service): State<StorageService>,
    Json(req): Json<SignChunkRequest>,
) -> Result<Json<SignChunkResponse>, AppError> {
    Ok(Json(service.sign_chunk(req).await?))
}

/// `POST /api/upload/complete`
pub async fn complete_upload(
    State(service): State<StorageService>,
    Json(req): Json<CompleteUploadRequest>,
) -> Result<Json<CompleteUploadResponse>, AppError> {
    Ok(Json(service.complete_upload(req).await?))
}

/// `DELETE /api/upload/abort?upload_id=..&key=..`
pub async fn abort_upload(
    State(service): State<StorageService>,
    Query(q): Query<AbortUploadQuery>,
) -> Result<Json<AbortUploadResponse>, AppError> {
    Ok(Json(service.abort_upload(&q.upload_id, &q.key).await?))
}
