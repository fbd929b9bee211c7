//! Error kinds of a recording upload.

use super::state::RecorderStatus;
use thiserror::Error;

/// Every failure of the upload path. All but `InvalidState` are fatal to
/// the recording they happen in.
#[derive(Error, Debug)]
pub enum UploadError {
    /// initiate / sign / complete / abort answered with a non-success
    /// status, or could not be reached. `message` carries the response body
    /// verbatim when there was one.
    #[error("{operation} failed: {message}")]
    Session {
        operation: &'static str,
        status: Option<u16>,
        message: String,
    },

    #[error("part {part_number} failed: {message}")]
    SegmentWrite { part_number: u32, message: String },

    /// The storage backend accepted the part but its `ETag` header was not
    /// readable, usually because CORS does not expose it.
    #[error("missing ETag for part {part_number} (check storage CORS ExposeHeaders)")]
    MissingContentHash { part_number: u32 },

    #[error("live chunk {seq} PUT failed: {message}")]
    SideChannel { seq: u64, message: String },

    #[error("capture device error: {0}")]
    DeviceCapture(String),

    /// Internal sequencing contract broken. Never reachable through the
    /// public API.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// Call rejected because of the current status; nothing was done.
    #[error("cannot {action} while {status}")]
    InvalidState {
        action: &'static str,
        status: RecorderStatus,
    },

    /// A raw write to a write target never produced a response.
    #[error("transport error: {0}")]
    Transport(String),
}

pub type UploadResult<T> = Result<T, UploadError>;

impl UploadError {
    pub(crate) fn session(
        operation: &'static str,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        UploadError::Session {
            operation,
            status,
            message: message.into(),
        }
    }
}
