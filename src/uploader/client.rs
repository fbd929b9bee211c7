//! Upload Session Client
//!
//! [`UploadBackend`] is everything the uploader needs from the outside
//! world: the multipart session endpoints plus raw writes to the single-use
//! targets they hand out. [`HttpUploadClient`] speaks it over HTTP.

use super::error::{UploadError, UploadResult};
use super::types::{UploadSession, WriteRequest, WriteResponse, WriteTarget};
use crate::models::upload::{
    AbortUploadQuery, CompleteUploadRequest, CompleteUploadResponse, InitiateUploadRequest,
    InitiateUploadResponse, SignChunkRequest, SignChunkResponse, SignPartRequest,
    SignPartResponse,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Url, header};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait UploadBackend: Send + Sync {
    /// Open a multipart upload.
    async fn open_session(&self, req: InitiateUploadRequest) -> UploadResult<UploadSession>;

    /// Single-use write target for one part.
    async fn segment_destination(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
    ) -> UploadResult<WriteTarget>;

    /// Single-use write target for one live fragment.
    async fn fragment_destination(&self, req: SignChunkRequest) -> UploadResult<WriteTarget>;

    /// Close the upload with its ordered part list.
    async fn complete(&self, req: CompleteUploadRequest) -> UploadResult<CompleteUploadResponse>;

    async fn abort(&self, upload_id: &str, key: &str) -> UploadResult<()>;

    /// Raw write of a body to a target. Any HTTP answer is `Ok`; only a
    /// missing answer is an error.
    async fn write(&self, target: &WriteTarget, req: WriteRequest) -> UploadResult<WriteResponse>;
}

#[derive(Clone, Debug)]
pub struct HttpUploadClient {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpUploadClient {
    /// `base_url` is the backend root, e.g. `http://localhost:8000`.
    /// `timeout` bounds every request, `None` leaves them unbounded.
    pub fn new(base_url: &str, timeout: Option<Duration>) -> Result<Self> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).context("invalid API base URL")?;

        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().context("failed to build HTTP client")?;

        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, operation: &'static str, path: &str) -> UploadResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| UploadError::session(operation, None, format!("bad URL: {}", e)))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        req: reqwest::RequestBuilder,
    ) -> UploadResult<T> {
        let response = req
            .send()
            .await
            .map_err(|e| UploadError::session(operation, None, e.to_string()))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(UploadError::session(operation, Some(status.as_u16()), body));
        }
        serde_json::from_str(&body).map_err(|e| {
            UploadError::session(
                operation,
                Some(status.as_u16()),
                format!("unexpected response body: {}", e),
            )
        })
    }
}

#[async_trait]
impl UploadBackend for HttpUploadClient {
    async fn open_session(&self, req: InitiateUploadRequest) -> UploadResult<UploadSession> {
        let url = self.url("initiate", "api/upload/initiate")?;
        let resp: InitiateUploadResponse = self
            .send_json("initiate", self.http.post(url).json(&req))
            .await?;
        UploadSession::try_from(resp)
    }

    async fn segment_destination(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
    ) -> UploadResult<WriteTarget> {
        let url = self.url("sign-part", "api/upload/sign-part")?;
        let body = SignPartRequest {
            key: key.to_string(),
            upload_id: upload_id.to_string(),
            part_number,
        };
        let resp: SignPartResponse = self
            .send_json("sign-part", self.http.post(url).json(&body))
            .await?;
        Ok(WriteTarget {
            url: resp.url,
            key: None,
        })
    }

    async fn fragment_destination(&self, req: SignChunkRequest) -> UploadResult<WriteTarget> {
        let url = self.url("sign-chunk", "api/upload/sign-chunk")?;
        let resp: SignChunkResponse = self
            .send_json("sign-chunk", self.http.post(url).json(&req))
            .await?;
        Ok(WriteTarget {
            url: resp.url,
            key: Some(resp.key),
        })
    }

    async fn complete(&self, req: CompleteUploadRequest) -> UploadResult<CompleteUploadResponse> {
        let url = self.url("complete", "api/upload/complete")?;
        self.send_json("complete", self.http.post(url).json(&req))
            .await
    }

    async fn abort(&self, upload_id: &str, key: &str) -> UploadResult<()> {
        let url = self.url("abort", "api/upload/abort")?;
        let query = AbortUploadQuery {
            upload_id: upload_id.to_string(),
            key: key.to_string(),
        };
        let response = self
            .http
            .delete(url)
            .query(&query)
            .send()
            .await
            .map_err(|e| UploadError::session("abort", None, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UploadError::session("abort", Some(status.as_u16()), body));
        }
        Ok(())
    }

    async fn write(&self, target: &WriteTarget, req: WriteRequest) -> UploadResult<WriteResponse> {
        let mut builder = self.http.put(&target.url).body(req.body);
        if let Some(content_type) = req.content_type.as_deref() {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        if let Some(md5) = req.content_md5.as_deref() {
            builder = builder.header("Content-MD5", md5);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        debug!(url = %target.url, status, etag = ?etag, "write finished");

        Ok(WriteResponse { status, etag })
    }
}
