use super::device::{CaptureDevice, CaptureEvent};
use crate::uploader::{
    UploadBackend, UploadCoordinator, UploadError, UploadResult, UploadSummary,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Run one recording from session open to completed upload.
///
/// Chunks are handled one at a time in arrival order. Cancelling `stop`
/// requests the stop; the device then drains and the upload is finalized
/// once it reports `Stopped`. A source that runs dry ends the recording
/// the same way.
pub async fn record<B, D>(
    coordinator: &UploadCoordinator<B>,
    device: &mut D,
    stop: CancellationToken,
) -> UploadResult<UploadSummary>
where
    B: UploadBackend,
    D: CaptureDevice,
{
    coordinator.begin().await?;

    let mut events = match device.start().await {
        Ok(events) => events,
        Err(err) => return Err(coordinator.fail(err).await),
    };
    coordinator.mark_recording()?;

    let mut stop_requested = false;
    loop {
        let event = if stop_requested {
            events.recv().await
        } else {
            tokio::select! {
                _ = stop.cancelled() => {
                    stop_requested = true;
                    info!("stop requested");
                    coordinator.request_stop()?;
                    if let Err(err) = device.stop().await {
                        return Err(coordinator.fail(err).await);
                    }
                    continue;
                }
                event = events.recv() => event,
            }
        };

        match event {
            Some(CaptureEvent::Data(chunk)) => {
                if let Err(err) = coordinator.push_chunk(chunk).await {
                    halt(device).await;
                    return Err(err);
                }
            }
            Some(CaptureEvent::Failed(message)) => {
                halt(device).await;
                return Err(coordinator.fail(UploadError::DeviceCapture(message)).await);
            }
            Some(CaptureEvent::Stopped) => break,
            None => {
                let err = UploadError::DeviceCapture("device went away without stopping".into());
                return Err(coordinator.fail(err).await);
            }
        }
    }

    if !stop_requested {
        info!("capture source exhausted");
        coordinator.request_stop()?;
    }
    coordinator.stop_and_finalize().await
}

async fn halt<D: CaptureDevice>(device: &mut D) {
    if let Err(err) = device.stop().await {
        warn!(error = %err, "device did not stop cleanly");
    }
}
