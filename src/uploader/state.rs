//! Recording state machine
//!
//! `idle → starting → recording → stopping → finalizing → uploaded`, with
//! `error` reachable from every non-terminal state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse status surfaced to whoever drives the recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecorderStatus {
    /// Nothing started yet
    #[default]
    Idle,
    /// Upload session being opened, device starting
    Starting,
    /// Device delivering chunks
    Recording,
    /// Stop requested, device winding down
    Stopping,
    /// Trailing segment flushed, completion in flight
    Finalizing,
    /// Upload completed
    Uploaded,
    /// Unrecoverable failure
    Error,
}

impl RecorderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecorderStatus::Idle => "idle",
            RecorderStatus::Starting => "starting",
            RecorderStatus::Recording => "recording",
            RecorderStatus::Stopping => "stopping",
            RecorderStatus::Finalizing => "finalizing",
            RecorderStatus::Uploaded => "uploaded",
            RecorderStatus::Error => "error",
        }
    }

    /// No transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecorderStatus::Uploaded | RecorderStatus::Error)
    }

    /// Statuses in which chunks are still accepted. A device may deliver a
    /// last chunk after stop was requested.
    pub fn accepts_chunks(&self) -> bool {
        matches!(self, RecorderStatus::Recording | RecorderStatus::Stopping)
    }
}

impl fmt::Display for RecorderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status plus the single human-readable error message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecorderSnapshot {
    pub status: RecorderStatus,
    pub error: Option<String>,
}
