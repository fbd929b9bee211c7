//! Finalizer
//!
//! Closes the multipart upload with the receipts in part-number order. At
//! most one completion request ever leaves a finalizer.

use super::client::UploadBackend;
use super::error::{UploadError, UploadResult};
use super::types::{SegmentReceipt, UploadSession};
use crate::models::upload::{CompleteUploadRequest, CompleteUploadResponse};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

pub struct Finalizer<B> {
    backend: Arc<B>,
    submitted: AtomicBool,
}

impl<B: UploadBackend> Finalizer<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            submitted: AtomicBool::new(false),
        }
    }

    pub fn is_submitted(&self) -> bool {
        self.submitted.load(Ordering::SeqCst)
    }

    /// Submit `receipts`, which must number exactly `1..=N` in order. A
    /// second call, or a gap or duplicate, is an
    /// [`UploadError::InvariantViolation`] and sends nothing.
    pub async fn finalize(
        &self,
        session: &UploadSession,
        receipts: Vec<SegmentReceipt>,
        user_id: &str,
    ) -> UploadResult<CompleteUploadResponse> {
        check_sequence(&receipts)?;

        if self.submitted.swap(true, Ordering::SeqCst) {
            return Err(UploadError::InvariantViolation(format!(
                "upload {} finalized twice",
                session.upload_id
            )));
        }

        let parts = receipts.len();
        let resp = self
            .backend
            .complete(CompleteUploadRequest {
                key: session.key.clone(),
                upload_id: session.upload_id.clone(),
                parts: receipts.into_iter().map(Into::into).collect(),
                user_id: user_id.to_string(),
            })
            .await?;
        info!(key = %resp.key, upload_id = %session.upload_id, parts, "upload completed");

        Ok(resp)
    }
}

fn check_sequence(receipts: &[SegmentReceipt]) -> UploadResult<()> {
    for (index, receipt) in receipts.iter().enumerate() {
        let expected = index as u32 + 1;
        if receipt.part_number != expected {
            return Err(UploadError::InvariantViolation(format!(
                "receipt {} carries part number {}, expected {}",
                index, receipt.part_number, expected
            )));
        }
    }
    Ok(())
}
