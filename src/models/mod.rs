//! Data models shared by the upload backend and the recording uploader.
//!
//! `upload` holds the JSON wire contract of the `/api/upload/*` endpoints and
//! is used on both sides. The remaining modules are SQLite rows owned by the
//! backend and map to tables via `sqlx::FromRow`.

pub mod multipart;
pub mod object;
pub mod upload;
pub mod video;
