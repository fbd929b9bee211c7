//! src/services/storage_service.rs
//!
//! StorageService: the multipart-upload backend behind `/api/upload/*`.
//! Metadata (sessions, parts, write targets, objects, recordings) lives in
//! SQLite; payloads live on local disk, objects sharded beneath
//! `base_path/{shard}/{shard}/{key}` and in-flight parts beneath
//! `base_path/.multipart/{upload_id}/`.

use crate::models::{
    multipart::{
        MultipartPart, MultipartUpload, SignedTarget, TargetKind, UPLOAD_ABORTED,
        UPLOAD_COMPLETED, UPLOAD_OPEN,
    },
    object::Object,
    upload::{
        AbortUploadResponse, CompleteUploadRequest, CompleteUploadResponse, InitiateUploadRequest,
        InitiateUploadResponse, SignChunkRequest, SignChunkResponse, SignPartRequest,
        SignPartResponse,
    },
    video::{VIDEO_COMPLETED, VIDEO_FAILED, VIDEO_UPLOADING},
};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures::{Stream, StreamExt, pin_mut, stream};
use md5::Context;
use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("upload `{0}` not found")]
    UploadNotFound(String),
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("write target is unknown, expired or already used")]
    TargetUnavailable,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("the Content-MD5 you specified did not match what was received")]
    BadDigest,
    #[error("part {part_number} is {size} bytes, smaller than the minimum of {min}")]
    PartTooSmall {
        part_number: u32,
        size: i64,
        min: i64,
    },
    #[error("invalid part list: {0}")]
    InvalidPart(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Smallest part size the backend will hand out in production.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
/// Part size used when the client does not know the total size.
pub const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;
/// Upper bound on parts per upload.
pub const MAX_PARTS: u64 = 10_000;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const PART_TARGET_TTL_SECS: i64 = 3600;
const CHUNK_TARGET_TTL_SECS: i64 = 600;
const MULTIPART_DIR: &str = ".multipart";
const COMPLETION_MARKER: &str = "date.data";

/// Tunables that do not come from requests.
#[derive(Clone, Debug)]
pub struct ServiceSettings {
    /// Base URL clients use to reach this server, without trailing slash.
    pub public_url: String,
    pub default_part_size: u64,
    pub min_part_size: u64,
}

impl ServiceSettings {
    pub fn new(public_url: impl Into<String>, default_part_size: u64) -> Self {
        Self {
            public_url: public_url.into().trim_end_matches('/').to_string(),
            default_part_size,
            min_part_size: MIN_PART_SIZE.min(default_part_size),
        }
    }
}

/// StorageService provides the multipart-upload backend:
/// - initiate / sign-part / sign-chunk hand out single-use write targets
/// - `accept_write` stores the body a client PUTs to one of those targets
/// - complete stitches the parts into the final object
/// - abort discards an unfinished upload
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where payloads are stored.
    pub base_path: PathBuf,

    pub settings: ServiceSettings,
}

/// Choose the part size for an upload of `file_size` bytes.
///
/// Returns `(part_size, total_parts)`. An unknown size (`0`) gets the
/// default and a single nominal part; a known size grows the part size so
/// the upload never needs more than [`MAX_PARTS`] parts.
pub fn choose_part_size(file_size: u64, default: u64, min: u64) -> (u64, u64) {
    let mut part_size = default.max(min);

    if file_size == 0 {
        return (part_size, 1);
    }

    if file_size.div_ceil(part_size) > MAX_PARTS {
        part_size = file_size.div_ceil(MAX_PARTS).max(min);
    }

    (part_size, file_size.div_ceil(part_size))
}

impl StorageService {
    /// Create a new StorageService backed by the provided SQLite pool and
    /// using `base_path` as the root directory for payloads.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>, settings: ServiceSettings) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            settings,
        }
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(StorageError::InvalidObjectKey);
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(StorageError::InvalidObjectKey);
        }
        if key.starts_with(MULTIPART_DIR) {
            return Err(StorageError::InvalidObjectKey);
        }
        Ok(())
    }

    /// Validate one caller-supplied component of a generated key.
    fn ensure_segment_safe(field: &str, value: &str) -> StorageResult<()> {
        if value.is_empty()
            || value.contains('/')
            || value.contains("..")
            || value.bytes().any(|b| b.is_ascii_control() || b == b'\\')
        {
            return Err(StorageError::InvalidRequest(format!(
                "`{}` must be a non-empty path segment",
                field
            )));
        }
        Ok(())
    }

    /// Two-level shard identifiers for an object key: the first two bytes of
    /// MD5(key) as lowercase hex.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Construct a fully-qualified object payload path. Parent directories
    /// may not exist yet.
    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.base_path.join(MULTIPART_DIR).join(upload_id)
    }

    fn part_path(&self, upload_id: &str, part_number: i64) -> PathBuf {
        self.upload_dir(upload_id)
            .join(format!("{:05}.part", part_number))
    }

    fn target_url(&self, token: &str) -> String {
        format!("{}/targets/{}", self.settings.public_url, token)
    }

    async fn fetch_upload(&self, upload_id: &str) -> StorageResult<MultipartUpload> {
        sqlx::query_as::<_, MultipartUpload>(
            "SELECT id, upload_id, key, content_type, user_id, part_size, status,
                    initiated_at, finished_at
             FROM multipart_uploads WHERE upload_id = ?",
        )
        .bind(upload_id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::UploadNotFound(upload_id.to_string()),
            other => StorageError::Sqlx(other),
        })
    }

    /// Fetch an upload that still accepts parts. Completed and aborted
    /// uploads are reported as missing, like S3's `NoSuchUpload`.
    async fn fetch_open_upload(&self, upload_id: &str) -> StorageResult<MultipartUpload> {
        let upload = self.fetch_upload(upload_id).await?;
        if !upload.is_open() {
            return Err(StorageError::UploadNotFound(upload_id.to_string()));
        }
        Ok(upload)
    }

    /// Persist a new single-use write target and return its URL.
    async fn issue_target(
        &self,
        kind: TargetKind,
        key: &str,
        upload_id: Option<&str>,
        part_number: Option<u32>,
        content_type: Option<&str>,
        ttl_secs: i64,
    ) -> StorageResult<String> {
        let token = Uuid::new_v4().simple().to_string();
        let expires_at = Utc::now() + Duration::seconds(ttl_secs);

        sqlx::query(
            "INSERT INTO write_targets
                (token, kind, key, upload_id, part_number, content_type, expires_at, used_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, NULL)",
        )
        .bind(&token)
        .bind(kind.as_str())
        .bind(key)
        .bind(upload_id)
        .bind(part_number.map(i64::from))
        .bind(content_type)
        .bind(expires_at)
        .execute(&*self.db)
        .await?;

        Ok(self.target_url(&token))
    }

    /// Start a multipart upload and record the recording it belongs to.
    pub async fn initiate_upload(
        &self,
        req: InitiateUploadRequest,
    ) -> StorageResult<InitiateUploadResponse> {
        if req.content_type.trim().is_empty() {
            return Err(StorageError::InvalidRequest(
                "contentType must not be empty".into(),
            ));
        }

        let key = match req.desired_key.as_deref().map(str::trim) {
            Some(desired) if !desired.is_empty() => desired.to_string(),
            _ => {
                let ext = Path::new(&req.filename)
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| format!(".{}", e))
                    .unwrap_or_else(|| ".webm".into());
                format!("videos/{}{}", Uuid::new_v4(), ext)
            }
        };
        self.ensure_key_safe(&key)?;

        let (part_size, total_parts) = choose_part_size(
            req.size,
            self.settings.default_part_size,
            self.settings.min_part_size,
        );

        let now = Utc::now();
        let upload_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO multipart_uploads
                (id, upload_id, key, content_type, user_id, part_size, status, initiated_at, finished_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL)",
        )
        .bind(Uuid::new_v4())
        .bind(&upload_id)
        .bind(&key)
        .bind(&req.content_type)
        .bind(req.user_id.as_deref())
        .bind(part_size as i64)
        .bind(UPLOAD_OPEN)
        .bind(now)
        .execute(&*self.db)
        .await?;

        let file_size = (req.size > 0).then_some(req.size as i64);
        sqlx::query(
            r#"
            INSERT INTO video_uploads (
                id, user_id, s3_key, filename, content_type, upload_id,
                status, created_at, completed_at, file_size
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, ?)
            ON CONFLICT(s3_key) DO UPDATE SET
                user_id = excluded.user_id,
                filename = excluded.filename,
                content_type = excluded.content_type,
                upload_id = excluded.upload_id,
                status = excluded.status,
                created_at = excluded.created_at,
                completed_at = NULL,
                file_size = excluded.file_size
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(req.user_id.as_deref().unwrap_or("unknown"))
        .bind(&key)
        .bind(&req.filename)
        .bind(&req.content_type)
        .bind(&upload_id)
        .bind(VIDEO_UPLOADING)
        .bind(now)
        .bind(file_size)
        .execute(&*self.db)
        .await?;

        let mut urls = Vec::new();
        if req.size > 0 {
            for part_number in 1..=total_parts as u32 {
                urls.push(
                    self.issue_target(
                        TargetKind::Part,
                        &key,
                        Some(&upload_id),
                        Some(part_number),
                        None,
                        PART_TARGET_TTL_SECS,
                    )
                    .await?,
                );
            }
        }

        info!(
            upload_id = %upload_id,
            key = %key,
            part_size,
            presigned = urls.len(),
            "initiated multipart upload"
        );

        Ok(InitiateUploadResponse {
            upload_id,
            key,
            part_size,
            urls,
        })
    }

    /// Hand out a single-use write target for one part of an open upload.
    pub async fn sign_part(&self, req: SignPartRequest) -> StorageResult<SignPartResponse> {
        let upload = self.fetch_open_upload(&req.upload_id).await?;
        if upload.key != req.key {
            return Err(StorageError::InvalidRequest(format!(
                "key `{}` does not belong to upload `{}`",
                req.key, req.upload_id
            )));
        }
        if req.part_number == 0 || u64::from(req.part_number) > MAX_PARTS {
            return Err(StorageError::InvalidRequest(format!(
                "partNumber must be between 1 and {}",
                MAX_PARTS
            )));
        }

        let url = self
            .issue_target(
                TargetKind::Part,
                &upload.key,
                Some(&upload.upload_id),
                Some(req.part_number),
                None,
                PART_TARGET_TTL_SECS,
            )
            .await?;
        debug!(upload_id = %upload.upload_id, part = req.part_number, "signed part");

        Ok(SignPartResponse { url })
    }

    /// Hand out a single-use write target for one live fragment.
    pub async fn sign_chunk(&self, req: SignChunkRequest) -> StorageResult<SignChunkResponse> {
        Self::ensure_segment_safe("userId", &req.user_id)?;
        Self::ensure_segment_safe("recordingId", &req.recording_id)?;
        Self::ensure_segment_safe("ext", &req.ext)?;

        let key = format!(
            "users/{}/latest/parts/{}/part-{:06}.{}",
            req.user_id, req.recording_id, req.seq, req.ext
        );
        self.ensure_key_safe(&key)?;

        let content_type = req
            .content_type
            .filter(|ct| !ct.trim().is_empty())
            .unwrap_or_else(|| format!("video/{}", req.ext));

        let url = self
            .issue_target(
                TargetKind::Object,
                &key,
                None,
                None,
                Some(&content_type),
                CHUNK_TARGET_TTL_SECS,
            )
            .await?;
        debug!(key = %key, seq = req.seq, "signed live chunk");

        Ok(SignChunkResponse {
            success: true,
            key,
            url,
        })
    }

    /// Load a write target and mark it used. Fails for unknown, expired and
    /// already consumed targets, and when the writer's content type does not
    /// match the one the target was signed for.
    async fn claim_target(
        &self,
        token: &str,
        content_type: Option<&str>,
    ) -> StorageResult<SignedTarget> {
        let target = sqlx::query_as::<_, SignedTarget>(
            "SELECT token, kind, key, upload_id, part_number, content_type, expires_at, used_at
             FROM write_targets WHERE token = ?",
        )
        .bind(token)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::TargetUnavailable,
            other => StorageError::Sqlx(other),
        })?;

        let now = Utc::now();
        if target.used_at.is_some() || target.expires_at <= now {
            return Err(StorageError::TargetUnavailable);
        }

        if let Some(expected) = target.content_type.as_deref() {
            if content_type != Some(expected) {
                return Err(StorageError::InvalidRequest(format!(
                    "Content-Type must be `{}` for this target",
                    expected
                )));
            }
        }

        let result =
            sqlx::query("UPDATE write_targets SET used_at = ? WHERE token = ? AND used_at IS NULL")
                .bind(now)
                .bind(token)
                .execute(&*self.db)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::TargetUnavailable);
        }

        Ok(target)
    }

    /// Store the body written to a write target.
    ///
    /// Consumes the target, streams the body to disk while computing its
    /// MD5, checks the optional base64 `Content-MD5`, and records the part
    /// or object. Returns the hex ETag (unquoted).
    pub async fn accept_write<S>(
        &self,
        token: &str,
        content_type: Option<String>,
        content_md5: Option<String>,
        stream: S,
    ) -> StorageResult<String>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let expected_md5 = match content_md5.as_deref() {
            Some(value) => Some(
                general_purpose::STANDARD
                    .decode(value.trim())
                    .map_err(|_| StorageError::InvalidRequest("invalid Content-MD5 header".into()))?,
            ),
            None => None,
        };

        let target = self.claim_target(token, content_type.as_deref()).await?;

        match target.kind() {
            Some(TargetKind::Part) => {
                let (upload_id, part_number) = match (target.upload_id.as_deref(), target.part_number)
                {
                    (Some(upload_id), Some(part_number)) => (upload_id, part_number),
                    _ => return Err(StorageError::TargetUnavailable),
                };
                // aborted or completed uploads no longer take parts
                self.fetch_open_upload(upload_id).await?;

                let path = self.part_path(upload_id, part_number);
                let (size_bytes, digest) =
                    write_stream_atomically(&path, stream, expected_md5.as_deref()).await?;
                let etag = format!("{:x}", digest);

                sqlx::query(
                    r#"
                    INSERT INTO multipart_parts (id, upload_id, part_number, size_bytes, etag, uploaded_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    ON CONFLICT(upload_id, part_number) DO UPDATE SET
                        size_bytes = excluded.size_bytes,
                        etag = excluded.etag,
                        uploaded_at = excluded.uploaded_at
                    "#,
                )
                .bind(Uuid::new_v4())
                .bind(upload_id)
                .bind(part_number)
                .bind(size_bytes)
                .bind(&etag)
                .bind(Utc::now())
                .execute(&*self.db)
                .await?;

                debug!(upload_id, part = part_number, size_bytes, "stored part");
                Ok(etag)
            }
            Some(TargetKind::Object) => {
                let path = self.object_path(&target.key);
                let (size_bytes, digest) =
                    write_stream_atomically(&path, stream, expected_md5.as_deref()).await?;
                let etag = format!("{:x}", digest);
                self.upsert_object(&target.key, content_type, size_bytes, &etag)
                    .await?;

                debug!(key = %target.key, size_bytes, "stored object");
                Ok(etag)
            }
            None => Err(StorageError::TargetUnavailable),
        }
    }

    /// Insert or overwrite an object row (S3-like overwrite semantics).
    async fn upsert_object(
        &self,
        key: &str,
        content_type: Option<String>,
        size_bytes: i64,
        etag: &str,
    ) -> StorageResult<Object> {
        let filename = key.rsplit('/').next().unwrap_or(key).to_string();

        let object = sqlx::query_as::<_, Object>(
            r#"
            INSERT INTO objects (id, key, filename, content_type, size_bytes, etag, last_modified)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                filename = excluded.filename,
                content_type = excluded.content_type,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            RETURNING id, key, filename, content_type, size_bytes, etag, last_modified
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key)
        .bind(&filename)
        .bind(content_type)
        .bind(size_bytes)
        .bind(etag)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await?;

        Ok(object)
    }

    /// Close a multipart upload.
    ///
    /// The submitted parts must be exactly `1..=N` once each, every ETag
    /// must match what was stored, and every part but the last must reach
    /// the session's part size. The parts are then concatenated into the
    /// final object and a `date.data` marker is written next to it.
    pub async fn complete_upload(
        &self,
        req: CompleteUploadRequest,
    ) -> StorageResult<CompleteUploadResponse> {
        let upload = self.fetch_open_upload(&req.upload_id).await?;
        if upload.key != req.key {
            return Err(StorageError::InvalidRequest(format!(
                "key `{}` does not belong to upload `{}`",
                req.key, req.upload_id
            )));
        }
        if req.parts.is_empty() {
            return Err(StorageError::InvalidPart(
                "you must specify at least one part".into(),
            ));
        }

        let mut parts = req.parts;
        parts.sort_by_key(|p| p.part_number);
        for (idx, part) in parts.iter().enumerate() {
            let expected = idx as u32 + 1;
            if part.part_number < expected {
                return Err(StorageError::InvalidPart(format!(
                    "part {} listed more than once",
                    part.part_number
                )));
            }
            if part.part_number > expected {
                return Err(StorageError::InvalidPart(format!(
                    "part {} is missing",
                    expected
                )));
            }
        }

        let stored: HashMap<i64, MultipartPart> = sqlx::query_as::<_, MultipartPart>(
            "SELECT id, upload_id, part_number, size_bytes, etag, uploaded_at
             FROM multipart_parts WHERE upload_id = ? ORDER BY part_number ASC",
        )
        .bind(&upload.upload_id)
        .fetch_all(&*self.db)
        .await?
        .into_iter()
        .map(|p| (p.part_number, p))
        .collect();

        let last_idx = parts.len() - 1;
        let mut ordered = Vec::with_capacity(parts.len());
        for (idx, part) in parts.iter().enumerate() {
            let stored_part = stored.get(&i64::from(part.part_number)).ok_or_else(|| {
                StorageError::InvalidPart(format!("part {} was never uploaded", part.part_number))
            })?;
            if normalize_etag(&part.etag) != stored_part.etag {
                return Err(StorageError::InvalidPart(format!(
                    "ETag mismatch for part {}",
                    part.part_number
                )));
            }
            if idx < last_idx && stored_part.size_bytes < upload.part_size {
                return Err(StorageError::PartTooSmall {
                    part_number: part.part_number,
                    size: stored_part.size_bytes,
                    min: upload.part_size,
                });
            }
            ordered.push(stored_part);
        }

        let (size_bytes, etag) = self.assemble_parts(&upload, &ordered).await?;
        self.upsert_object(
            &upload.key,
            Some(upload.content_type.clone()),
            size_bytes,
            &etag,
        )
        .await?;

        let finished_at = Utc::now();
        let result = sqlx::query(
            "UPDATE multipart_uploads SET status = ?, finished_at = ?
             WHERE upload_id = ? AND status = ?",
        )
        .bind(UPLOAD_COMPLETED)
        .bind(finished_at)
        .bind(&upload.upload_id)
        .bind(UPLOAD_OPEN)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::UploadNotFound(upload.upload_id.clone()));
        }

        self.discard_upload_payloads(&upload.upload_id).await?;
        self.write_completion_marker(&upload.key, finished_at).await?;

        sqlx::query(
            "UPDATE video_uploads SET status = ?, completed_at = ?, file_size = ?, user_id = ?
             WHERE s3_key = ?",
        )
        .bind(VIDEO_COMPLETED)
        .bind(finished_at)
        .bind(size_bytes)
        .bind(&req.user_id)
        .bind(&upload.key)
        .execute(&*self.db)
        .await?;

        info!(
            upload_id = %upload.upload_id,
            key = %upload.key,
            parts = ordered.len(),
            size_bytes,
            "completed multipart upload"
        );

        Ok(CompleteUploadResponse {
            success: true,
            location: format!("{}/objects/{}", self.settings.public_url, upload.key),
            key: upload.key,
        })
    }

    /// Concatenate parts into the final object file. Returns the total size
    /// and the multipart ETag: MD5 over the binary part digests, `-N`.
    async fn assemble_parts(
        &self,
        upload: &MultipartUpload,
        parts: &[&MultipartPart],
    ) -> StorageResult<(i64, String)> {
        let file_path = self.object_path(&upload.key);
        let parent = parent_dir(&file_path)?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let result = async {
            let mut out = File::create(&tmp_path).await?;
            let mut size_bytes: i64 = 0;
            let mut combined = Context::new();
            for part in parts {
                let mut input = File::open(self.part_path(&upload.upload_id, part.part_number)).await?;
                size_bytes += tokio::io::copy(&mut input, &mut out).await? as i64;
                combined.consume(decode_hex(&part.etag).ok_or_else(|| {
                    io::Error::new(ErrorKind::InvalidData, "stored part ETag is not hex")
                })?);
            }
            out.flush().await?;
            out.sync_all().await?;
            Ok::<_, io::Error>((size_bytes, combined))
        }
        .await;

        let (size_bytes, combined) = match result {
            Ok(ok) => ok,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        };

        replace_file(&tmp_path, &file_path).await?;
        Ok((
            size_bytes,
            format!("{:x}-{}", combined.compute(), parts.len()),
        ))
    }

    /// Write the `{"finishedAt": ...}` marker next to a completed object.
    async fn write_completion_marker(
        &self,
        key: &str,
        finished_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let marker_key = match key.rsplit_once('/') {
            Some((prefix, _)) => format!("{}/{}", prefix, COMPLETION_MARKER),
            None => COMPLETION_MARKER.to_string(),
        };
        let body = serde_json::json!({
            "finishedAt": finished_at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        })
        .to_string();

        let path = self.object_path(&marker_key);
        let body = stream::once(async move { Ok::<_, io::Error>(Bytes::from(body)) });
        let (size_bytes, digest) = write_stream_atomically(&path, body, None).await?;
        self.upsert_object(
            &marker_key,
            Some("application/json".into()),
            size_bytes,
            &format!("{:x}", digest),
        )
        .await?;
        Ok(())
    }

    /// Drop outstanding write targets and on-disk parts of an upload.
    async fn discard_upload_payloads(&self, upload_id: &str) -> StorageResult<()> {
        sqlx::query("DELETE FROM write_targets WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&*self.db)
            .await?;

        let dir = self.upload_dir(upload_id);
        match fs::remove_dir_all(&dir).await {
            Ok(_) => debug!("removed part directory {}", dir.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove part directory {}: {}", dir.display(), err),
        }
        Ok(())
    }

    /// Abort an unfinished upload and discard its parts.
    pub async fn abort_upload(
        &self,
        upload_id: &str,
        key: &str,
    ) -> StorageResult<AbortUploadResponse> {
        let upload = self.fetch_open_upload(upload_id).await?;
        if upload.key != key {
            return Err(StorageError::InvalidRequest(format!(
                "key `{}` does not belong to upload `{}`",
                key, upload_id
            )));
        }

        let result = sqlx::query(
            "UPDATE multipart_uploads SET status = ?, finished_at = ?
             WHERE upload_id = ? AND status = ?",
        )
        .bind(UPLOAD_ABORTED)
        .bind(Utc::now())
        .bind(upload_id)
        .bind(UPLOAD_OPEN)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::UploadNotFound(upload_id.to_string()));
        }

        self.discard_upload_payloads(upload_id).await?;

        sqlx::query("UPDATE video_uploads SET status = ? WHERE s3_key = ? AND upload_id = ?")
            .bind(VIDEO_FAILED)
            .bind(key)
            .bind(upload_id)
            .execute(&*self.db)
            .await?;

        info!(upload_id, key, "aborted multipart upload");
        Ok(AbortUploadResponse {
            success: true,
            message: "Upload aborted".into(),
        })
    }

    /// Fetch a stored object for reading.
    ///
    /// Returns metadata and an opened File handle ready for streaming out.
    pub async fn get_object_reader(&self, key: &str) -> StorageResult<(Object, File)> {
        let object = self.get_object_metadata(key).await?;

        let file = File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::ObjectNotFound(key.to_string())
            } else {
                StorageError::Io(err)
            }
        })?;

        Ok((object, file))
    }

    /// Fetch only object metadata.
    pub async fn get_object_metadata(&self, key: &str) -> StorageResult<Object> {
        self.ensure_key_safe(key)?;
        sqlx::query_as::<_, Object>(
            "SELECT id, key, filename, content_type, size_bytes, etag, last_modified
             FROM objects WHERE key = ?",
        )
        .bind(key)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::ObjectNotFound(key.to_string()),
            other => StorageError::Sqlx(other),
        })
    }
}

/// Stream `stream` into `file_path` through a temp file in the same
/// directory, fsync it, then rename into place. The MD5 of the body is
/// checked against `expected_md5` before the rename. Temp files are removed
/// on every error path.
async fn write_stream_atomically<S>(
    file_path: &Path,
    stream: S,
    expected_md5: Option<&[u8]>,
) -> StorageResult<(i64, md5::Digest)>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
{
    let parent = parent_dir(file_path)?;
    fs::create_dir_all(&parent).await?;
    let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
    let mut file = File::create(&tmp_path).await?;

    let mut size_bytes: i64 = 0;
    let mut digest = Context::new();
    pin_mut!(stream);
    while let Some(chunk_res) = stream.next().await {
        let chunk = match chunk_res {
            Ok(chunk) => chunk,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StorageError::Io(err));
            }
        };
        size_bytes += chunk.len() as i64;
        digest.consume(&chunk);
        if let Err(err) = file.write_all(&chunk).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
    }
    if let Err(err) = file.flush().await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(StorageError::Io(err));
    }
    if let Err(err) = file.sync_all().await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(StorageError::Io(err));
    }

    let digest = digest.compute();
    if let Some(expected) = expected_md5 {
        if expected != digest.0.as_slice() {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::BadDigest);
        }
    }

    replace_file(&tmp_path, file_path).await?;
    Ok((size_bytes, digest))
}

fn parent_dir(path: &Path) -> StorageResult<PathBuf> {
    path.parent().map(Path::to_path_buf).ok_or_else(|| {
        StorageError::Io(io::Error::new(
            ErrorKind::Other,
            "payload path missing parent directory",
        ))
    })
}

/// Rename `tmp_path` over `file_path`, replacing an existing file.
async fn replace_file(tmp_path: &Path, file_path: &Path) -> StorageResult<()> {
    if let Err(err) = fs::rename(tmp_path, file_path).await {
        if err.kind() == ErrorKind::AlreadyExists {
            fs::remove_file(file_path).await?;
            fs::rename(tmp_path, file_path).await?;
        } else {
            let _ = fs::remove_file(tmp_path).await;
            return Err(StorageError::Io(err));
        }
    }
    Ok(())
}

/// Strip the quotes (and weak prefix) S3 clients keep around ETags.
pub fn normalize_etag(etag: &str) -> String {
    etag.trim()
        .trim_start_matches("W/")
        .trim_matches('"')
        .to_ascii_lowercase()
}

fn decode_hex(value: &str) -> Option<Vec<u8>> {
    if value.len() % 2 != 0 {
        return None;
    }
    (0..value.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(value.get(i..i + 2)?, 16).ok())
        .collect()
}
