//! Represents multipart upload sessions, their parts, and the single-use
//! write targets handed out for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle of a multipart upload session.
pub const UPLOAD_OPEN: &str = "uploading";
pub const UPLOAD_COMPLETED: &str = "completed";
pub const UPLOAD_ABORTED: &str = "aborted";

/// A multipart upload session, initiated before any part is written.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MultipartUpload {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Unique upload ID (returned to client).
    pub upload_id: String,

    /// Object key being uploaded.
    pub key: String,

    pub content_type: String,

    /// Owner recorded at initiation, if the client sent one.
    pub user_id: Option<String>,

    /// Minimum size of every part except the last one.
    pub part_size: i64,

    /// One of `uploading`, `completed`, `aborted`.
    pub status: String,

    /// Timestamp when upload was initiated.
    pub initiated_at: DateTime<Utc>,

    pub finished_at: Option<DateTime<Utc>>,
}

impl MultipartUpload {
    pub fn is_open(&self) -> bool {
        self.status == UPLOAD_OPEN
    }
}

/// Represents a single uploaded part in a multipart upload session.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct MultipartPart {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Reference to parent upload session.
    pub upload_id: String,

    /// Part number (1-based).
    pub part_number: i64,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Hex MD5 of the part body, without quotes.
    pub etag: String,

    /// Timestamp when this part was uploaded.
    pub uploaded_at: DateTime<Utc>,
}

/// What a write target authorizes.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// One part of a multipart upload.
    Part,
    /// A standalone object (live fragment).
    Object,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Part => "part",
            TargetKind::Object => "object",
        }
    }
}

/// A single-use, time-limited write authorization. Its token is the last
/// path segment of the URL handed to the client.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct SignedTarget {
    pub token: String,

    /// `part` or `object`.
    pub kind: String,

    /// Destination object key (the upload key for parts).
    pub key: String,

    pub upload_id: Option<String>,

    pub part_number: Option<i64>,

    /// Content type the writer must send, when the target was signed for one.
    pub content_type: Option<String>,

    pub expires_at: DateTime<Utc>,

    /// Set when the target has been consumed.
    pub used_at: Option<DateTime<Utc>>,
}

impl SignedTarget {
    pub fn kind(&self) -> Option<TargetKind> {
        match self.kind.as_str() {
            "part" => Some(TargetKind::Part),
            "object" => Some(TargetKind::Object),
            _ => None,
        }
    }
}
