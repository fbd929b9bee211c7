//! In-memory [`UploadBackend`] for unit tests.

use super::client::UploadBackend;
use super::error::{UploadError, UploadResult};
use super::types::{UploadSession, WriteRequest, WriteResponse, WriteTarget};
use crate::models::upload::{
    CompleteUploadRequest, CompleteUploadResponse, InitiateUploadRequest, SignChunkRequest,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Mutex;

const PART_PREFIX: &str = "fake://part/";
const FRAGMENT_PREFIX: &str = "fake://fragment/";

#[derive(Default)]
struct Recorded {
    opened: Option<InitiateUploadRequest>,
    segments: Vec<(u32, Bytes, Option<String>)>,
    fragments: Vec<(u64, Bytes)>,
    completed: Option<CompleteUploadRequest>,
    complete_calls: usize,
    aborts: Vec<(String, String)>,
}

pub(crate) struct FakeBackend {
    part_size: u64,
    fail_open: bool,
    fail_segment_at: Option<u32>,
    fail_sign_part_at: Option<u32>,
    strip_etag: bool,
    fail_fragment_at: Option<u64>,
    recorded: Mutex<Recorded>,
}

impl FakeBackend {
    pub fn new(part_size: u64) -> Self {
        Self {
            part_size,
            fail_open: false,
            fail_segment_at: None,
            fail_sign_part_at: None,
            strip_etag: false,
            fail_fragment_at: None,
            recorded: Mutex::new(Recorded::default()),
        }
    }

    /// `initiate` answers 500.
    pub fn fail_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// The write of this part answers 500.
    pub fn fail_segment_at(mut self, part_number: u32) -> Self {
        self.fail_segment_at = Some(part_number);
        self
    }

    /// `sign-part` for this part answers 500.
    pub fn fail_sign_part_at(mut self, part_number: u32) -> Self {
        self.fail_sign_part_at = Some(part_number);
        self
    }

    /// Part writes succeed without an `ETag`, like a storage bucket whose
    /// CORS rules hide it.
    pub fn strip_etag(mut self) -> Self {
        self.strip_etag = true;
        self
    }

    /// The write of this live fragment answers 503.
    pub fn fail_fragment_at(mut self, seq: u64) -> Self {
        self.fail_fragment_at = Some(seq);
        self
    }

    pub fn opened(&self) -> Option<InitiateUploadRequest> {
        self.recorded.lock().unwrap().opened.clone()
    }

    pub fn segments(&self) -> Vec<(u32, Bytes)> {
        self.recorded
            .lock()
            .unwrap()
            .segments
            .iter()
            .map(|(n, b, _)| (*n, b.clone()))
            .collect()
    }

    pub fn segment_md5s(&self) -> Vec<Option<String>> {
        self.recorded
            .lock()
            .unwrap()
            .segments
            .iter()
            .map(|(_, _, md5)| md5.clone())
            .collect()
    }

    pub fn fragments(&self) -> Vec<(u64, Bytes)> {
        self.recorded.lock().unwrap().fragments.clone()
    }

    pub fn completed(&self) -> Option<CompleteUploadRequest> {
        self.recorded.lock().unwrap().completed.clone()
    }

    pub fn complete_calls(&self) -> usize {
        self.recorded.lock().unwrap().complete_calls
    }

    pub fn aborts(&self) -> Vec<(String, String)> {
        self.recorded.lock().unwrap().aborts.clone()
    }
}

#[async_trait]
impl UploadBackend for FakeBackend {
    async fn open_session(&self, req: InitiateUploadRequest) -> UploadResult<UploadSession> {
        if self.fail_open {
            return Err(UploadError::session("initiate", Some(500), "boom"));
        }
        let key = req
            .desired_key
            .clone()
            .unwrap_or_else(|| "videos/generated.webm".into());
        self.recorded.lock().unwrap().opened = Some(req);
        Ok(UploadSession {
            upload_id: "upload-1".into(),
            key,
            part_size: self.part_size,
        })
    }

    async fn segment_destination(
        &self,
        _key: &str,
        _upload_id: &str,
        part_number: u32,
    ) -> UploadResult<WriteTarget> {
        if self.fail_sign_part_at == Some(part_number) {
            return Err(UploadError::session("sign-part", Some(500), "signing refused"));
        }
        Ok(WriteTarget {
            url: format!("{}{}", PART_PREFIX, part_number),
            key: None,
        })
    }

    async fn fragment_destination(&self, req: SignChunkRequest) -> UploadResult<WriteTarget> {
        Ok(WriteTarget {
            url: format!("{}{}", FRAGMENT_PREFIX, req.seq),
            key: Some(format!(
                "users/{}/latest/parts/{}/part-{:06}.{}",
                req.user_id, req.recording_id, req.seq, req.ext
            )),
        })
    }

    async fn complete(&self, req: CompleteUploadRequest) -> UploadResult<CompleteUploadResponse> {
        let mut recorded = self.recorded.lock().unwrap();
        recorded.complete_calls += 1;
        if req.parts.is_empty() {
            return Err(UploadError::session(
                "complete",
                Some(400),
                r#"{"error":"parts must not be empty","status":400}"#,
            ));
        }
        let key = req.key.clone();
        recorded.completed = Some(req);
        Ok(CompleteUploadResponse {
            success: true,
            location: format!("fake://objects/{}", key),
            key,
        })
    }

    async fn abort(&self, upload_id: &str, key: &str) -> UploadResult<()> {
        self.recorded
            .lock()
            .unwrap()
            .aborts
            .push((upload_id.to_string(), key.to_string()));
        Ok(())
    }

    async fn write(&self, target: &WriteTarget, req: WriteRequest) -> UploadResult<WriteResponse> {
        if let Some(part) = target.url.strip_prefix(PART_PREFIX) {
            let part_number: u32 = part.parse().unwrap();
            if self.fail_segment_at == Some(part_number) {
                return Ok(WriteResponse {
                    status: 500,
                    etag: None,
                });
            }
            let etag = format!("\"{:x}\"", md5::compute(&req.body));
            self.recorded
                .lock()
                .unwrap()
                .segments
                .push((part_number, req.body, req.content_md5));
            return Ok(WriteResponse {
                status: 200,
                etag: (!self.strip_etag).then_some(etag),
            });
        }

        if let Some(seq) = target.url.strip_prefix(FRAGMENT_PREFIX) {
            let seq: u64 = seq.parse().unwrap();
            if self.fail_fragment_at == Some(seq) {
                return Ok(WriteResponse {
                    status: 503,
                    etag: None,
                });
            }
            self.recorded.lock().unwrap().fragments.push((seq, req.body));
            return Ok(WriteResponse {
                status: 200,
                etag: None,
            });
        }

        Err(UploadError::Transport(format!("unknown target {}", target.url)))
    }
}
