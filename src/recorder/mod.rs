//! Capture-device boundary and the loop that drives a recording.
//!
//! A [`CaptureDevice`] delivers chunks at a fixed cadence through a channel
//! of [`CaptureEvent`]s; [`record`] pumps them into an
//! [`UploadCoordinator`](crate::uploader::UploadCoordinator) and finalizes
//! the upload once the device has fully stopped.

pub mod device;
pub mod session;

pub use device::{CaptureDevice, CaptureEvent, ReaderCapture};
pub use session::record;
