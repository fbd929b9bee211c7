pub mod routes;

use crate::services::storage_service::StorageService;
use axum::{
    Router,
    http::{HeaderValue, header},
};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

/// The complete application: routes, state, CORS and request tracing.
///
/// CORS exposes `ETag`; browsers hide it from scripts otherwise and every
/// part write would look like it lost its content hash.
pub fn app(service: StorageService, cors_origin: Option<&str>) -> Router {
    let origin = match cors_origin.and_then(|o| HeaderValue::from_str(o).ok()) {
        Some(origin) => AllowOrigin::exact(origin),
        None => AllowOrigin::any(),
    };
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([header::ETAG]);

    routes::routes()
        .with_state(service)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
