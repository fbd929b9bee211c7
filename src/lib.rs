//! Streaming multipart upload of live screen recordings.
//!
//! [`uploader`] turns an open-ended chunk stream into ordered multipart
//! parts plus per-chunk live fragments, [`recorder`] drives it from a
//! capture device, and the remaining modules make up the HTTP backend the
//! uploader talks to.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod recorder;
pub mod routes;
pub mod services;
pub mod uploader;
