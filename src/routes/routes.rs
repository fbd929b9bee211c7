//! Defines routes for the recording upload backend.
//!
//! ## Structure
//! - **Upload API** (JSON)
//!   - `POST   /api/upload/initiate`  : open a multipart upload
//!   - `POST   /api/upload/sign-part` : write target for one part
//!   - `POST   /api/upload/sign-chunk`: write target for one live fragment
//!   - `POST   /api/upload/complete`  : stitch parts into the final object
//!   - `DELETE /api/upload/abort`     : discard an unfinished upload
//!
//! - **Payloads**
//!   - `PUT    /targets/{token}` : single-use write, answers with `ETag`
//!   - `GET    /objects/{*key}`  : download a stored object
//!   - `HEAD   /objects/{*key}`  : metadata only
//!
//! The wildcard `*key` allows nested keys like `users/u1/latest/parts/r/part-000001.webm`.

use crate::{
    handlers::{
        health_handlers::{api_health, healthz, readyz, root},
        object_handlers::{get_object, head_object, put_to_target},
        upload_handlers::{
            abort_upload, complete_upload, initiate_upload, sign_chunk, sign_part,
        },
    },
    services::storage_service::StorageService,
};
use axum::{
    Router,
    routing::{delete, get, post, put},
};

/// Build and return the router for the upload backend.
///
/// The router carries shared state (`StorageService`) to all handlers.
pub fn routes() -> Router<StorageService> {
    Router::new()
        .route("/", get(root))
        // health endpoints
        .route("/api/health", get(api_health))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // multipart upload API
        .route("/api/upload/initiate", post(initiate_upload))
        .route("/api/upload/sign-part", post(sign_part))
        .route("/api/upload/sign-chunk", post(sign_chunk))
        .route("/api/upload/complete", post(complete_upload))
        .route("/api/upload/abort", delete(abort_upload))
        // payloads
        .route("/targets/{token}", put(put_to_target))
        .route("/objects/{*key}", get(get_object).head(head_object))
}
