//! JSON bodies exchanged on the `/api/upload/*` endpoints.
//!
//! Field names follow the browser-facing contract (camelCase, and the
//! S3-style `PartNumber`/`ETag` pair inside `parts`), so the same types are
//! serialized by the uploader and deserialized by the backend.

use serde::{Deserialize, Serialize};

/// `POST /api/upload/initiate`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InitiateUploadRequest {
    pub filename: String,

    /// Total size in bytes, `0` when unknown (live recording).
    #[serde(default)]
    pub size: u64,

    pub content_type: String,

    /// Requested object key. The backend picks one when empty.
    #[serde(default)]
    pub desired_key: Option<String>,

    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InitiateUploadResponse {
    pub upload_id: String,

    /// Canonical key, may differ from the requested one.
    pub key: String,

    /// Minimum bytes per non-final part.
    pub part_size: u64,

    /// One write target per part, only when the size was known upfront.
    #[serde(default)]
    pub urls: Vec<String>,
}

/// `POST /api/upload/sign-part`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignPartRequest {
    pub key: String,
    pub upload_id: String,
    pub part_number: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SignPartResponse {
    pub url: String,
}

/// `POST /api/upload/sign-chunk`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignChunkRequest {
    pub user_id: String,
    pub recording_id: String,
    pub seq: u64,
    #[serde(default = "default_ext")]
    pub ext: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

fn default_ext() -> String {
    "webm".into()
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SignChunkResponse {
    #[serde(default)]
    pub success: bool,
    pub key: String,
    pub url: String,
}

/// One entry of the `parts` list submitted on completion.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: String,
}

/// `POST /api/upload/complete`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadRequest {
    pub key: String,
    pub upload_id: String,
    pub parts: Vec<CompletedPart>,
    pub user_id: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CompleteUploadResponse {
    pub success: bool,
    pub location: String,
    pub key: String,
}

/// Query string of `DELETE /api/upload/abort`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AbortUploadQuery {
    pub upload_id: String,
    pub key: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AbortUploadResponse {
    pub success: bool,
    pub message: String,
}
