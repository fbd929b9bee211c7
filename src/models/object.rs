//! Represents an object (file) stored by the backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata of a stored object. The payload lives on disk; this row only
/// describes it.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Object key (path-like identifier).
    pub key: String,

    /// Last path segment of the key.
    pub filename: String,

    /// Content type (MIME type).
    pub content_type: Option<String>,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Hex MD5 for single writes, `md5-of-md5s-N` for multipart objects.
    pub etag: Option<String>,

    /// Timestamp when object was last modified.
    pub last_modified: DateTime<Utc>,
}
