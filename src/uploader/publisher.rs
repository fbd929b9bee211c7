//! Side-Channel Publisher
//!
//! Every chunk goes out on its own as a live fragment keyed by
//! `recording_id` + `seq`, whatever the segment boundaries are. Nothing is
//! buffered or retried here.

use super::client::UploadBackend;
use super::error::{UploadError, UploadResult};
use super::types::{LiveFragment, WriteRequest};
use crate::models::upload::SignChunkRequest;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

pub struct SideChannelPublisher<B> {
    backend: Arc<B>,
    user_id: String,
    recording_id: String,
    ext: String,
    content_type: String,
}

impl<B: UploadBackend> SideChannelPublisher<B> {
    pub fn new(
        backend: Arc<B>,
        user_id: impl Into<String>,
        recording_id: impl Into<String>,
        content_type: impl Into<String>,
    ) -> Self {
        let content_type = content_type.into();
        Self {
            backend,
            user_id: user_id.into(),
            recording_id: recording_id.into(),
            ext: extension_for(&content_type).to_string(),
            content_type,
        }
    }

    /// Sign a destination for `seq` and write `chunk` there. Any failure,
    /// signing included, is reported as [`UploadError::SideChannel`].
    pub async fn publish(&self, chunk: Bytes, seq: u64) -> UploadResult<LiveFragment> {
        let side_channel = |message: String| UploadError::SideChannel { seq, message };

        let target = self
            .backend
            .fragment_destination(SignChunkRequest {
                user_id: self.user_id.clone(),
                recording_id: self.recording_id.clone(),
                seq,
                ext: self.ext.clone(),
                content_type: Some(self.content_type.clone()),
            })
            .await
            .map_err(|e| side_channel(e.to_string()))?;

        let len = chunk.len();
        let response = self
            .backend
            .write(
                &target,
                WriteRequest {
                    body: chunk,
                    content_type: Some(self.content_type.clone()),
                    content_md5: None,
                },
            )
            .await
            .map_err(|e| side_channel(e.to_string()))?;

        if !response.is_success() {
            return Err(side_channel(format!("HTTP {}", response.status)));
        }
        debug!(seq, bytes = len, "published live fragment");

        Ok(LiveFragment {
            recording_id: self.recording_id.clone(),
            seq,
            ext: self.ext.clone(),
            content_type: self.content_type.clone(),
            key: target.key,
        })
    }
}

/// File extension for a media content type, ignoring codec parameters.
/// Unknown types fall back to `webm`.
pub fn extension_for(content_type: &str) -> &'static str {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match essence.as_str() {
        "video/mp4" | "audio/mp4" => "mp4",
        "video/ogg" | "audio/ogg" => "ogg",
        "video/x-matroska" => "mkv",
        "video/quicktime" => "mov",
        _ => "webm",
    }
}
