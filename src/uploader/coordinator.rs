//! Upload Coordinator
//!
//! Owns one recording from session open to completion. Chunk handling is
//! serialized by a single async mutex around the pipeline state (assembler,
//! receipts, `seq` counter): each chunk's live-fragment write and its
//! possible segment write run concurrently, and both finish before the next
//! chunk or the finalize step may touch the pipeline.

use super::assembler::{Assembled, Flushed, SegmentAssembler};
use super::client::UploadBackend;
use super::error::{UploadError, UploadResult};
use super::finalizer::Finalizer;
use super::publisher::SideChannelPublisher;
use super::state::{RecorderSnapshot, RecorderStatus};
use super::types::{RecordingSession, Segment, SegmentReceipt, UploadSession, WriteRequest};
use crate::models::upload::InitiateUploadRequest;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use serde::Serialize;
use std::{fmt, mem, str::FromStr, sync::Arc};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

/// What a failed live-fragment write does to the recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SideChannelPolicy {
    /// The recording fails, like any other write failure.
    #[default]
    Fatal,
    /// The failure is logged and counted; the durable upload goes on.
    Degraded,
}

impl FromStr for SideChannelPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fatal" => Ok(SideChannelPolicy::Fatal),
            "degraded" => Ok(SideChannelPolicy::Degraded),
            other => Err(format!(
                "unknown side-channel policy `{}` (expected fatal or degraded)",
                other
            )),
        }
    }
}

impl fmt::Display for SideChannelPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SideChannelPolicy::Fatal => f.write_str("fatal"),
            SideChannelPolicy::Degraded => f.write_str("degraded"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub side_channel: SideChannelPolicy,

    /// Send one best-effort abort when the recording fails after the
    /// session was opened.
    pub abort_on_failure: bool,

    /// Filename announced when the session is opened.
    pub filename: String,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            side_channel: SideChannelPolicy::Fatal,
            abort_on_failure: true,
            filename: "recording.webm".into(),
        }
    }
}

/// Outcome of a completed recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSummary {
    pub key: String,
    pub upload_id: String,
    pub location: String,
    pub parts: u32,
    pub bytes: u64,
    pub fragments: u64,
    pub side_channel_failures: u64,
}

struct Pipeline {
    session: UploadSession,
    assembler: SegmentAssembler,
    receipts: Vec<SegmentReceipt>,
    next_seq: u64,
    bytes: u64,
    fragments: u64,
    side_channel_failures: u64,
}

pub struct UploadCoordinator<B> {
    backend: Arc<B>,
    recording: RecordingSession,
    options: CoordinatorOptions,
    publisher: SideChannelPublisher<B>,
    finalizer: Finalizer<B>,
    pipeline: Mutex<Option<Pipeline>>,
    state: watch::Sender<RecorderSnapshot>,
}

impl<B: UploadBackend> UploadCoordinator<B> {
    pub fn new(backend: Arc<B>, recording: RecordingSession, options: CoordinatorOptions) -> Self {
        let publisher = SideChannelPublisher::new(
            backend.clone(),
            recording.user_id.clone(),
            recording.recording_id.clone(),
            recording.content_type.clone(),
        );
        let finalizer = Finalizer::new(backend.clone());
        let (state, _) = watch::channel(RecorderSnapshot::default());

        Self {
            backend,
            recording,
            options,
            publisher,
            finalizer,
            pipeline: Mutex::new(None),
            state,
        }
    }

    pub fn recording(&self) -> &RecordingSession {
        &self.recording
    }

    pub fn status(&self) -> RecorderStatus {
        self.state.borrow().status
    }

    /// Message of the failure that moved the recording to `error`.
    pub fn error_message(&self) -> Option<String> {
        self.state.borrow().error.clone()
    }

    pub fn snapshot(&self) -> RecorderSnapshot {
        self.state.borrow().clone()
    }

    /// Follow status changes as they happen.
    pub fn subscribe(&self) -> watch::Receiver<RecorderSnapshot> {
        self.state.subscribe()
    }

    /// `idle → starting`: open the multipart upload.
    pub async fn begin(&self) -> UploadResult<UploadSession> {
        self.transition("begin", &[RecorderStatus::Idle], RecorderStatus::Starting)?;

        let desired_key = Some(self.recording.final_key.trim())
            .filter(|k| !k.is_empty())
            .map(str::to_string);
        let opened = self
            .backend
            .open_session(InitiateUploadRequest {
                filename: self.options.filename.clone(),
                size: 0,
                content_type: self.recording.content_type.clone(),
                desired_key,
                user_id: Some(self.recording.user_id.clone()),
            })
            .await;

        let session = match opened {
            Ok(session) => session,
            Err(err) => return Err(self.fail_with(None, err).await),
        };
        info!(
            key = %session.key,
            upload_id = %session.upload_id,
            part_size = session.part_size,
            recording_id = %self.recording.recording_id,
            "upload session opened"
        );

        *self.pipeline.lock().await = Some(Pipeline {
            session: session.clone(),
            assembler: SegmentAssembler::new(session.part_size),
            receipts: Vec::new(),
            next_seq: 1,
            bytes: 0,
            fragments: 0,
            side_channel_failures: 0,
        });
        Ok(session)
    }

    /// `starting → recording`: the device confirmed it is capturing.
    pub fn mark_recording(&self) -> UploadResult<()> {
        self.transition(
            "start recording",
            &[RecorderStatus::Starting],
            RecorderStatus::Recording,
        )
    }

    /// Handle one chunk to completion: publish it as a live fragment and
    /// append it to the current segment, shipping the segment when full.
    /// Empty chunks are dropped without consuming a `seq`.
    pub async fn push_chunk(&self, chunk: Bytes) -> UploadResult<()> {
        let mut guard = self.pipeline.lock().await;

        let status = self.status();
        if !status.accepts_chunks() {
            return Err(UploadError::InvalidState {
                action: "push chunk",
                status,
            });
        }
        if chunk.is_empty() {
            return Ok(());
        }
        let Some(pipeline) = guard.as_mut() else {
            return Err(UploadError::InvariantViolation(
                "chunk accepted without an upload session".into(),
            ));
        };

        let seq = pipeline.next_seq;
        pipeline.next_seq += 1;
        let len = chunk.len() as u64;
        let ready = match pipeline.assembler.append(&chunk) {
            Assembled::Ready(segment) => Some(segment),
            Assembled::Pending => None,
        };
        let session = pipeline.session.clone();

        let (published, shipped) = tokio::join!(self.publisher.publish(chunk, seq), async {
            match ready {
                Some(segment) => self.ship_segment(&session, segment).await.map(Some),
                None => Ok(None),
            }
        });
        pipeline.bytes += len;

        match shipped {
            Ok(Some(receipt)) => pipeline.receipts.push(receipt),
            Ok(None) => {}
            Err(err) => return Err(self.fail_with(Some(&session), err).await),
        }

        match published {
            Ok(_) => pipeline.fragments += 1,
            Err(err) => match self.options.side_channel {
                SideChannelPolicy::Fatal => return Err(self.fail_with(Some(&session), err).await),
                SideChannelPolicy::Degraded => {
                    pipeline.side_channel_failures += 1;
                    warn!(seq, error = %err, "live fragment lost, continuing");
                }
            },
        }
        debug!(seq, bytes = len, buffered = pipeline.assembler.buffered(), "chunk handled");

        Ok(())
    }

    /// `recording → stopping`. Chunks the device still delivers are
    /// accepted until finalization starts.
    pub fn request_stop(&self) -> UploadResult<()> {
        if self.status() == RecorderStatus::Stopping {
            return Ok(());
        }
        self.transition(
            "stop",
            &[RecorderStatus::Recording],
            RecorderStatus::Stopping,
        )
    }

    /// `stopping → finalizing → uploaded`: wait for the chunk in flight,
    /// ship the trailing segment and complete the upload with every
    /// receipt. Called from `recording`, it passes through `stopping` first.
    pub async fn stop_and_finalize(&self) -> UploadResult<UploadSummary> {
        if self.status() == RecorderStatus::Recording {
            self.request_stop()?;
        }
        let mut guard = self.pipeline.lock().await;

        self.transition(
            "finalize",
            &[RecorderStatus::Stopping],
            RecorderStatus::Finalizing,
        )?;
        let Some(pipeline) = guard.as_mut() else {
            let err = UploadError::InvariantViolation("finalize without an upload session".into());
            return Err(self.fail_with(None, err).await);
        };
        let session = pipeline.session.clone();

        if let Flushed::Ready(segment) = pipeline.assembler.flush_partial() {
            match self.ship_segment(&session, segment).await {
                Ok(receipt) => pipeline.receipts.push(receipt),
                Err(err) => return Err(self.fail_with(Some(&session), err).await),
            }
        }

        let receipts = mem::take(&mut pipeline.receipts);
        let parts = receipts.len() as u32;
        let issued = pipeline.assembler.emitted();
        if parts != issued {
            let err = UploadError::InvariantViolation(format!(
                "{} receipts for {} issued parts",
                parts, issued
            ));
            return Err(self.fail_with(Some(&session), err).await);
        }
        let completed = match self
            .finalizer
            .finalize(&session, receipts, &self.recording.user_id)
            .await
        {
            Ok(completed) => completed,
            Err(err) => return Err(self.fail_with(Some(&session), err).await),
        };

        self.transition(
            "mark uploaded",
            &[RecorderStatus::Finalizing],
            RecorderStatus::Uploaded,
        )?;

        Ok(UploadSummary {
            key: completed.key,
            upload_id: session.upload_id,
            location: completed.location,
            parts,
            bytes: pipeline.bytes,
            fragments: pipeline.fragments,
            side_channel_failures: pipeline.side_channel_failures,
        })
    }

    /// Move to `error` because of something outside the upload path, such
    /// as the capture device. Returns `err` for propagation.
    pub async fn fail(&self, err: UploadError) -> UploadError {
        let session = self
            .pipeline
            .lock()
            .await
            .as_ref()
            .map(|p| p.session.clone());
        self.fail_with(session.as_ref(), err).await
    }

    async fn ship_segment(
        &self,
        session: &UploadSession,
        segment: Segment,
    ) -> UploadResult<SegmentReceipt> {
        let part_number = segment.part_number;
        let target = self
            .backend
            .segment_destination(&session.key, &session.upload_id, part_number)
            .await?;

        let digest = md5::compute(&segment.bytes);
        let len = segment.len();
        let response = self
            .backend
            .write(
                &target,
                WriteRequest {
                    body: segment.bytes,
                    content_type: None,
                    content_md5: Some(general_purpose::STANDARD.encode(digest.0)),
                },
            )
            .await
            .map_err(|e| UploadError::SegmentWrite {
                part_number,
                message: e.to_string(),
            })?;

        if !response.is_success() {
            return Err(UploadError::SegmentWrite {
                part_number,
                message: format!("HTTP {}", response.status),
            });
        }
        let content_hash = response
            .etag
            .filter(|etag| !etag.trim().is_empty())
            .ok_or(UploadError::MissingContentHash { part_number })?;
        debug!(part_number, bytes = len, etag = %content_hash, "segment shipped");

        Ok(SegmentReceipt {
            part_number,
            content_hash,
        })
    }

    fn transition(
        &self,
        action: &'static str,
        from: &[RecorderStatus],
        to: RecorderStatus,
    ) -> UploadResult<()> {
        let mut rejected = None;
        self.state.send_if_modified(|snapshot| {
            if from.contains(&snapshot.status) {
                snapshot.status = to;
                true
            } else {
                rejected = Some(snapshot.status);
                false
            }
        });

        match rejected {
            Some(status) => Err(UploadError::InvalidState { action, status }),
            None => {
                info!(status = %to, "recorder status changed");
                Ok(())
            }
        }
    }

    /// Record `err` as the terminal failure unless the recording already
    /// ended, then try to abort the upload.
    async fn fail_with(&self, session: Option<&UploadSession>, err: UploadError) -> UploadError {
        let message = err.to_string();
        let changed = self.state.send_if_modified(|snapshot| {
            if snapshot.status.is_terminal() {
                return false;
            }
            snapshot.status = RecorderStatus::Error;
            snapshot.error = Some(message);
            true
        });
        if !changed {
            return err;
        }
        error!(error = %err, recording_id = %self.recording.recording_id, "recording failed");

        if let (true, Some(session)) = (self.options.abort_on_failure, session) {
            match self.backend.abort(&session.upload_id, &session.key).await {
                Ok(()) => info!(upload_id = %session.upload_id, "upload aborted"),
                Err(abort_err) => {
                    warn!(upload_id = %session.upload_id, error = %abort_err, "abort failed")
                }
            }
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::fake::FakeBackend;

    fn coordinator(backend: FakeBackend) -> (Arc<FakeBackend>, UploadCoordinator<FakeBackend>) {
        coordinator_with(backend, CoordinatorOptions::default())
    }

    fn coordinator_with(
        backend: FakeBackend,
        options: CoordinatorOptions,
    ) -> (Arc<FakeBackend>, UploadCoordinator<FakeBackend>) {
        let backend = Arc::new(backend);
        let recording = RecordingSession::new("user-1", "videos/demo.webm", "video/webm");
        let coordinator = UploadCoordinator::new(backend.clone(), recording, options);
        (backend, coordinator)
    }

    async fn started(backend: FakeBackend) -> (Arc<FakeBackend>, UploadCoordinator<FakeBackend>) {
        let (backend, coordinator) = coordinator(backend);
        coordinator.begin().await.unwrap();
        coordinator.mark_recording().unwrap();
        (backend, coordinator)
    }

    fn chunk(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    #[tokio::test]
    async fn segments_ship_at_threshold_and_remainder_on_finalize() {
        let (backend, coordinator) = started(FakeBackend::new(1024)).await;

        coordinator.push_chunk(chunk(600, 1)).await.unwrap();
        assert!(backend.segments().is_empty());
        coordinator.push_chunk(chunk(600, 2)).await.unwrap();
        assert_eq!(backend.segments().len(), 1);
        coordinator.push_chunk(chunk(600, 3)).await.unwrap();
        assert_eq!(backend.segments().len(), 1);

        coordinator.request_stop().unwrap();
        let summary = coordinator.stop_and_finalize().await.unwrap();

        let sizes: Vec<(u32, usize)> = backend
            .segments()
            .iter()
            .map(|(n, b)| (*n, b.len()))
            .collect();
        assert_eq!(sizes, vec![(1, 1200), (2, 600)]);
        assert_eq!(summary.parts, 2);
        assert_eq!(summary.bytes, 1800);
        assert_eq!(summary.fragments, 3);
        assert_eq!(summary.key, "videos/demo.webm");
        assert_eq!(coordinator.status(), RecorderStatus::Uploaded);

        let completed = backend.completed().unwrap();
        let numbers: Vec<u32> = completed.parts.iter().map(|p| p.part_number).collect();
        assert_eq!(numbers, vec![1, 2]);
        assert_eq!(completed.user_id, "user-1");
    }

    #[tokio::test]
    async fn fragments_follow_arrival_order() {
        let (backend, coordinator) = started(FakeBackend::new(250)).await;

        for (i, size) in [100, 300, 50, 400, 10].into_iter().enumerate() {
            coordinator.push_chunk(chunk(size, i as u8)).await.unwrap();
        }

        let seqs: Vec<u64> = backend.fragments().iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(backend.fragments()[3].1.len(), 400);
    }

    #[tokio::test]
    async fn shipped_bytes_match_the_chunk_stream() {
        let (backend, coordinator) = started(FakeBackend::new(64)).await;

        let mut input = Vec::new();
        for i in 0..20u8 {
            let c = chunk(7 + (i as usize * 5) % 40, i);
            input.extend_from_slice(&c);
            coordinator.push_chunk(c).await.unwrap();
        }
        coordinator.stop_and_finalize().await.unwrap();

        let joined: Vec<u8> = backend
            .segments()
            .iter()
            .flat_map(|(_, b)| b.to_vec())
            .collect();
        assert_eq!(joined, input);

        let segments = backend.segments();
        let (_, rest) = segments.split_last().unwrap();
        assert!(rest.iter().all(|(_, b)| b.len() >= 64));
    }

    #[tokio::test]
    async fn segment_writes_carry_content_md5() {
        let (backend, coordinator) = started(FakeBackend::new(4)).await;
        coordinator
            .push_chunk(Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let expected = general_purpose::STANDARD.encode(md5::compute(b"hello").0);
        assert_eq!(backend.segment_md5s(), vec![Some(expected)]);
    }

    #[tokio::test]
    async fn small_chunks_finalize_as_a_single_part() {
        let (backend, coordinator) = started(FakeBackend::new(1024)).await;
        for _ in 0..10 {
            coordinator.push_chunk(chunk(100, 9)).await.unwrap();
        }
        assert!(backend.segments().is_empty());

        let summary = coordinator.stop_and_finalize().await.unwrap();

        assert_eq!(summary.parts, 1);
        assert_eq!(backend.segments()[0].0, 1);
        assert_eq!(backend.segments()[0].1.len(), 1000);
    }

    #[tokio::test]
    async fn empty_recording_is_rejected_at_completion() {
        let (backend, coordinator) = started(FakeBackend::new(1024)).await;
        coordinator.request_stop().unwrap();

        let err = coordinator.stop_and_finalize().await.unwrap_err();

        assert!(matches!(err, UploadError::Session { status: Some(400), .. }));
        assert!(backend.segments().is_empty());
        assert_eq!(backend.complete_calls(), 1);
        assert_eq!(coordinator.status(), RecorderStatus::Error);
        assert!(coordinator.error_message().unwrap().contains("parts must not be empty"));
    }

    #[tokio::test]
    async fn failed_segment_write_stops_everything() {
        let (backend, coordinator) = started(FakeBackend::new(100).fail_segment_at(1)).await;

        let err = coordinator.push_chunk(chunk(150, 1)).await.unwrap_err();
        assert!(matches!(err, UploadError::SegmentWrite { part_number: 1, .. }));
        assert_eq!(coordinator.status(), RecorderStatus::Error);

        let fragments_before = backend.fragments().len();
        let again = coordinator.push_chunk(chunk(150, 2)).await.unwrap_err();
        assert!(matches!(again, UploadError::InvalidState { .. }));
        assert_eq!(backend.fragments().len(), fragments_before);

        assert!(coordinator.stop_and_finalize().await.is_err());
        assert_eq!(backend.complete_calls(), 0);
        assert_eq!(
            backend.aborts(),
            vec![("upload-1".to_string(), "videos/demo.webm".to_string())]
        );
    }

    #[tokio::test]
    async fn missing_etag_is_its_own_failure() {
        let (_backend, coordinator) = started(FakeBackend::new(10).strip_etag()).await;

        let err = coordinator.push_chunk(chunk(10, 0)).await.unwrap_err();

        assert!(matches!(err, UploadError::MissingContentHash { part_number: 1 }));
        assert!(coordinator.error_message().unwrap().contains("ETag"));
    }

    #[tokio::test]
    async fn side_channel_failure_is_fatal_by_default() {
        let (backend, coordinator) = started(FakeBackend::new(150).fail_fragment_at(5)).await;

        for i in 0..4 {
            coordinator.push_chunk(chunk(100, i)).await.unwrap();
        }
        assert_eq!(backend.segments().len(), 2);

        let err = coordinator.push_chunk(chunk(100, 4)).await.unwrap_err();
        assert!(matches!(err, UploadError::SideChannel { seq: 5, .. }));
        assert_eq!(coordinator.status(), RecorderStatus::Error);

        assert!(coordinator.stop_and_finalize().await.is_err());
        assert_eq!(backend.complete_calls(), 0);
    }

    #[tokio::test]
    async fn degraded_side_channel_keeps_the_durable_path() {
        let options = CoordinatorOptions {
            side_channel: SideChannelPolicy::Degraded,
            ..CoordinatorOptions::default()
        };
        let (backend, coordinator) =
            coordinator_with(FakeBackend::new(150).fail_fragment_at(2), options);
        coordinator.begin().await.unwrap();
        coordinator.mark_recording().unwrap();

        for i in 0..3 {
            coordinator.push_chunk(chunk(100, i)).await.unwrap();
        }
        let summary = coordinator.stop_and_finalize().await.unwrap();

        assert_eq!(summary.fragments, 2);
        assert_eq!(summary.side_channel_failures, 1);
        assert_eq!(summary.bytes, 300);
        assert_eq!(coordinator.status(), RecorderStatus::Uploaded);
        assert!(backend.aborts().is_empty());
    }

    #[tokio::test]
    async fn open_failure_leaves_nothing_to_abort() {
        let (backend, coordinator) = coordinator(FakeBackend::new(1024).fail_open());

        let err = coordinator.begin().await.unwrap_err();

        assert!(matches!(err, UploadError::Session { operation: "initiate", .. }));
        assert_eq!(coordinator.status(), RecorderStatus::Error);
        assert!(backend.aborts().is_empty());
        assert!(coordinator.mark_recording().is_err());
    }

    #[tokio::test]
    async fn session_is_opened_with_explicit_identity() {
        let (backend, coordinator) = coordinator(FakeBackend::new(1024));
        coordinator.begin().await.unwrap();

        let opened = backend.opened().unwrap();
        assert_eq!(opened.user_id.as_deref(), Some("user-1"));
        assert_eq!(opened.desired_key.as_deref(), Some("videos/demo.webm"));
        assert_eq!(opened.size, 0);
    }

    #[tokio::test]
    async fn empty_chunks_consume_no_seq() {
        let (backend, coordinator) = started(FakeBackend::new(1024)).await;

        coordinator.push_chunk(Bytes::new()).await.unwrap();
        coordinator.push_chunk(chunk(5, 1)).await.unwrap();

        let seqs: Vec<u64> = backend.fragments().iter().map(|(s, _)| *s).collect();
        assert_eq!(seqs, vec![1]);
    }

    #[tokio::test]
    async fn calls_out_of_order_are_rejected() {
        let (_backend, coordinator) = coordinator(FakeBackend::new(1024));

        assert!(matches!(
            coordinator.push_chunk(chunk(1, 0)).await,
            Err(UploadError::InvalidState {
                status: RecorderStatus::Idle,
                ..
            })
        ));
        assert!(coordinator.request_stop().is_err());
        assert!(coordinator.stop_and_finalize().await.is_err());
        assert_eq!(coordinator.status(), RecorderStatus::Idle);
    }

    #[tokio::test]
    async fn finalize_happens_once() {
        let (backend, coordinator) = started(FakeBackend::new(8)).await;
        coordinator.push_chunk(chunk(3, 0)).await.unwrap();
        coordinator.stop_and_finalize().await.unwrap();

        let again = coordinator.stop_and_finalize().await.unwrap_err();

        assert!(matches!(
            again,
            UploadError::InvalidState {
                status: RecorderStatus::Uploaded,
                ..
            }
        ));
        assert_eq!(backend.complete_calls(), 1);
    }

    #[tokio::test]
    async fn subscribers_see_every_transition() {
        let (_backend, coordinator) = coordinator(FakeBackend::new(8));
        let mut rx = coordinator.subscribe();

        coordinator.begin().await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().status, RecorderStatus::Starting);

        coordinator.mark_recording().unwrap();
        coordinator.push_chunk(chunk(3, 0)).await.unwrap();
        coordinator.request_stop().unwrap();
        assert_eq!(rx.borrow_and_update().status, RecorderStatus::Stopping);

        coordinator.stop_and_finalize().await.unwrap();
        assert_eq!(
            coordinator.snapshot(),
            RecorderSnapshot {
                status: RecorderStatus::Uploaded,
                error: None,
            }
        );
    }

    #[tokio::test]
    async fn finalize_from_recording_passes_through_stopping() {
        let (_backend, coordinator) = started(FakeBackend::new(8)).await;
        coordinator.push_chunk(chunk(3, 0)).await.unwrap();
        let mut rx = coordinator.subscribe();
        rx.borrow_and_update();

        // hold the pipeline so finalization parks right after the stop
        let held = coordinator.pipeline.lock().await;
        let (finalized, seen) = tokio::join!(coordinator.stop_and_finalize(), async move {
            rx.changed().await.unwrap();
            let seen = rx.borrow_and_update().status;
            drop(held);
            seen
        });

        assert_eq!(seen, RecorderStatus::Stopping);
        assert_eq!(finalized.unwrap().parts, 1);
        assert_eq!(coordinator.status(), RecorderStatus::Uploaded);
    }

    #[tokio::test]
    async fn refused_part_signature_is_fatal() {
        let (backend, coordinator) = started(FakeBackend::new(100).fail_sign_part_at(2)).await;

        coordinator.push_chunk(chunk(100, 1)).await.unwrap();
        let err = coordinator.push_chunk(chunk(100, 2)).await.unwrap_err();

        assert!(matches!(
            err,
            UploadError::Session {
                operation: "sign-part",
                status: Some(500),
                ..
            }
        ));
        assert_eq!(coordinator.status(), RecorderStatus::Error);

        let fragments_before = backend.fragments().len();
        let segments_before = backend.segments().len();
        assert!(matches!(
            coordinator.push_chunk(chunk(100, 3)).await,
            Err(UploadError::InvalidState {
                status: RecorderStatus::Error,
                ..
            })
        ));
        assert_eq!(backend.fragments().len(), fragments_before);
        assert_eq!(backend.segments().len(), segments_before);

        assert!(coordinator.stop_and_finalize().await.is_err());
        assert_eq!(backend.complete_calls(), 0);
        assert_eq!(
            backend.aborts(),
            vec![("upload-1".to_string(), "videos/demo.webm".to_string())]
        );
    }

    #[tokio::test]
    async fn lost_receipt_fails_instead_of_completing_short() {
        let (backend, coordinator) = started(FakeBackend::new(10)).await;
        for i in 0..3 {
            coordinator.push_chunk(chunk(10, i)).await.unwrap();
        }
        coordinator
            .pipeline
            .lock()
            .await
            .as_mut()
            .unwrap()
            .receipts
            .pop();

        let err = coordinator.stop_and_finalize().await.unwrap_err();

        assert!(matches!(err, UploadError::InvariantViolation(_)));
        assert_eq!(coordinator.status(), RecorderStatus::Error);
        assert_eq!(backend.complete_calls(), 0);
        assert_eq!(backend.aborts().len(), 1);
    }

    #[test]
    fn side_channel_policy_parses_case_insensitively() {
        assert_eq!("Degraded".parse::<SideChannelPolicy>(), Ok(SideChannelPolicy::Degraded));
        assert_eq!("fatal".parse::<SideChannelPolicy>(), Ok(SideChannelPolicy::Fatal));
        assert!("sometimes".parse::<SideChannelPolicy>().is_err());
    }
}
