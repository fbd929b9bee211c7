//! Per-user record of a screen recording upload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

pub const VIDEO_UPLOADING: &str = "uploading";
pub const VIDEO_COMPLETED: &str = "completed";
pub const VIDEO_FAILED: &str = "failed";

/// One row per recording the backend has been asked to store.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct VideoUpload {
    pub id: Uuid,

    pub user_id: String,

    /// Final object key of the recording.
    pub s3_key: String,

    pub filename: String,

    pub content_type: String,

    /// Multipart session backing the upload, if any.
    pub upload_id: Option<String>,

    /// `uploading`, `completed` or `failed`.
    pub status: String,

    pub created_at: DateTime<Utc>,

    pub completed_at: Option<DateTime<Utc>>,

    /// Size in bytes once completed.
    pub file_size: Option<i64>,
}
