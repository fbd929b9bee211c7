//! HTTP handlers for object payloads.
//! Streams bodies to and from disk to avoid buffering in memory and
//! delegates storage concerns to `StorageService`.

use crate::{
    errors::AppError, models::object::Object, services::storage_service::StorageService,
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use std::io;
use tokio_util::io::ReaderStream;

static CONTENT_MD5: HeaderName = HeaderName::from_static("content-md5");

/// `PUT /targets/{token}`: write a part or live fragment through a
/// single-use target handed out by sign-part / sign-chunk.
pub async fn put_to_target(
    State(service): State<StorageService>,
    Path(token): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, AppError> {
    let content_type = header_string(&headers, &header::CONTENT_TYPE);
    let content_md5 = header_string(&headers, &CONTENT_MD5);

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(|err| io::Error::new(io::ErrorKind::Other, err)));

    let etag = service
        .accept_write(&token, content_type, content_md5, stream)
        .await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

/// Download an object `/objects/{*key}` as a streaming response.
pub async fn get_object(
    State(service): State<StorageService>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let (meta, file) = service.get_object_reader(&key).await?;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);

    Ok(response)
}

/// HEAD `/objects/{*key}`: same headers as GET but no body.
pub async fn head_object(
    State(service): State<StorageService>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let meta = service.get_object_metadata(&key).await?;
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);

    Ok(response)
}

fn header_string(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn set_object_headers(headers: &mut HeaderMap, meta: &Object) {
    let content_type = meta
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&meta.size_bytes.max(0).to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );

    if let Some(etag) = meta.etag.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
            headers.insert(header::ETAG, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(&meta.last_modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
