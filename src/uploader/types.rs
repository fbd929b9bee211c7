//! Values passed between the uploader components.

use super::error::{UploadError, UploadResult};
use crate::models::upload::{CompletedPart, InitiateUploadResponse};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One active recording. The `user_id` is explicit and travels with every
/// call that needs an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSession {
    pub user_id: String,

    /// Requested destination object key.
    pub final_key: String,

    pub content_type: String,

    /// Local identifier namespacing the live fragments.
    pub recording_id: String,
}

impl RecordingSession {
    /// Create a session with a fresh `recording_id`.
    pub fn new(
        user_id: impl Into<String>,
        final_key: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            final_key: final_key.into(),
            content_type: content_type.into(),
            recording_id: Uuid::new_v4().to_string(),
        }
    }
}

/// Server-assigned multipart upload identity. Immutable once opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub upload_id: String,

    /// Canonical key, may differ from the requested one.
    pub key: String,

    /// Minimum bytes in every segment but the last. Always `> 0`.
    pub part_size: u64,
}

impl TryFrom<InitiateUploadResponse> for UploadSession {
    type Error = UploadError;

    fn try_from(resp: InitiateUploadResponse) -> UploadResult<Self> {
        if resp.upload_id.is_empty() || resp.key.is_empty() {
            return Err(UploadError::session(
                "initiate",
                None,
                "response is missing uploadId or key",
            ));
        }
        if resp.part_size == 0 {
            return Err(UploadError::session(
                "initiate",
                None,
                "response carries a zero partSize",
            ));
        }
        Ok(Self {
            upload_id: resp.upload_id,
            key: resp.key,
            part_size: resp.part_size,
        })
    }
}

/// A contiguous run of chunk bytes shipped as one numbered part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// 1-based, strictly increasing, never reused.
    pub part_number: u32,
    pub bytes: Bytes,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Proof that a segment was durably written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentReceipt {
    pub part_number: u32,

    /// `ETag` exactly as the storage backend returned it.
    pub content_hash: String,
}

impl From<SegmentReceipt> for CompletedPart {
    fn from(receipt: SegmentReceipt) -> Self {
        CompletedPart {
            part_number: receipt.part_number,
            etag: receipt.content_hash,
        }
    }
}

/// A chunk published on the side channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveFragment {
    pub recording_id: String,

    /// 1-based chunk arrival index.
    pub seq: u64,

    pub ext: String,
    pub content_type: String,

    /// Object key the backend assigned, when it reported one.
    pub key: Option<String>,
}

/// Single-use destination for one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTarget {
    pub url: String,

    /// Object key behind the URL, when the backend reports it.
    pub key: Option<String>,
}

/// Body and headers of a raw write to a [`WriteTarget`].
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub body: Bytes,
    pub content_type: Option<String>,

    /// Base64 MD5 of `body`, sent as `Content-MD5`.
    pub content_md5: Option<String>,
}

/// What came back from a raw write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResponse {
    pub status: u16,

    /// `ETag` header, `None` when absent or hidden by the transport.
    pub etag: Option<String>,
}

impl WriteResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
