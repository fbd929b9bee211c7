//! Streaming multipart upload of a live recording.
//!
//! Chunks arrive from a capture device at a fixed cadence. Each one is
//! published on its own as a live fragment and also appended to the
//! current segment; full segments become numbered multipart parts, and the
//! ordered part receipts close the upload at the end.
//!
//! - [`assembler`]: size-bounded segment buffering, no I/O
//! - [`publisher`]: per-chunk live fragments
//! - [`client`]: the backend contract and its HTTP implementation
//! - [`finalizer`]: at-most-once completion with the ordered receipts
//! - [`coordinator`]: the state machine tying them together

pub mod assembler;
pub mod client;
pub mod coordinator;
pub mod error;
pub mod finalizer;
pub mod publisher;
pub mod state;
pub mod types;

#[cfg(test)]
pub(crate) mod fake;

pub use assembler::{Assembled, Flushed, SegmentAssembler};
pub use client::{HttpUploadClient, UploadBackend};
pub use coordinator::{CoordinatorOptions, SideChannelPolicy, UploadCoordinator, UploadSummary};
pub use error::{UploadError, UploadResult};
pub use finalizer::Finalizer;
pub use publisher::SideChannelPublisher;
pub use state::{RecorderSnapshot, RecorderStatus};
pub use types::{
    LiveFragment, RecordingSession, Segment, SegmentReceipt, UploadSession, WriteRequest,
    WriteResponse, WriteTarget,
};
