use crate::uploader::{UploadError, UploadResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::{path::PathBuf, time::Duration};
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt},
    sync::mpsc,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const EVENT_BUFFER: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// One timeslice worth of media.
    Data(Bytes),
    /// The device broke; no more events follow.
    Failed(String),
    /// Capture fully stopped; no more events follow.
    Stopped,
}

/// A source of media chunks. After [`stop`](CaptureDevice::stop) the device
/// may still deliver buffered data, always followed by `Stopped`.
#[async_trait]
pub trait CaptureDevice: Send {
    async fn start(&mut self) -> UploadResult<mpsc::Receiver<CaptureEvent>>;

    async fn stop(&mut self) -> UploadResult<()>;
}

enum Source {
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    File(PathBuf),
}

/// Replays any byte source as a capture device: up to `chunk_size` bytes
/// per `timeslice` until stopped or the source is exhausted.
pub struct ReaderCapture {
    source: Option<Source>,
    chunk_size: usize,
    timeslice: Duration,
    cancel: CancellationToken,
}

impl ReaderCapture {
    pub fn new<R>(reader: R, chunk_size: usize, timeslice: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self::with_source(Source::Reader(Box::new(reader)), chunk_size, timeslice)
    }

    /// The file is opened on `start`, so a missing file is a start failure.
    pub fn open_file(path: impl Into<PathBuf>, chunk_size: usize, timeslice: Duration) -> Self {
        Self::with_source(Source::File(path.into()), chunk_size, timeslice)
    }

    fn with_source(source: Source, chunk_size: usize, timeslice: Duration) -> Self {
        Self {
            source: Some(source),
            chunk_size,
            timeslice,
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl CaptureDevice for ReaderCapture {
    async fn start(&mut self) -> UploadResult<mpsc::Receiver<CaptureEvent>> {
        if self.chunk_size == 0 {
            return Err(UploadError::DeviceCapture("chunk size must be positive".into()));
        }
        if self.timeslice.is_zero() {
            return Err(UploadError::DeviceCapture("timeslice must be positive".into()));
        }
        let reader: Box<dyn AsyncRead + Send + Unpin> = match self.source.take() {
            None => return Err(UploadError::DeviceCapture("device already started".into())),
            Some(Source::Reader(reader)) => reader,
            Some(Source::File(path)) => {
                let file = File::open(&path).await.map_err(|e| {
                    UploadError::DeviceCapture(format!("cannot open {}: {}", path.display(), e))
                })?;
                Box::new(file)
            }
        };

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(pump(
            reader,
            self.chunk_size,
            self.timeslice,
            tx,
            self.cancel.clone(),
        ));
        debug!(
            chunk_size = self.chunk_size,
            timeslice_ms = self.timeslice.as_millis() as u64,
            "capture started"
        );
        Ok(rx)
    }

    async fn stop(&mut self) -> UploadResult<()> {
        self.cancel.cancel();
        Ok(())
    }
}

async fn pump(
    mut reader: Box<dyn AsyncRead + Send + Unpin>,
    chunk_size: usize,
    timeslice: Duration,
    tx: mpsc::Sender<CaptureEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = time::interval(timeslice);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick fires immediately
    ticker.tick().await;

    let mut buf = vec![0u8; chunk_size];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match fill(&mut reader, &mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                if tx.send(CaptureEvent::Data(chunk)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(error = %e, "capture source failed");
                let _ = tx.send(CaptureEvent::Failed(e.to_string())).await;
                return;
            }
        }
    }

    let _ = tx.send(CaptureEvent::Stopped).await;
}

/// Read until `buf` is full or the source ends.
async fn fill<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
