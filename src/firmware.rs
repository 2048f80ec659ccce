//! Firmware image upload with staged atomic commit.
//!
//! The image streams in as ordered frames, validated on the very first byte
//! and staged into a temp file next to the configured target. Only a fully
//! received image is renamed into place; any failure leaves the previous
//! image untouched and records a sticky error that the final response
//! surfaces exactly once. A successful commit schedules the delayed restart.

use axum::body::Body;
use axum::extract::Extension;
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use serde_json::json;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::frames::{Frame, FrameCursor, FrameError};
use crate::state::AppState;

/// First byte of every valid image header.
pub const FIRMWARE_MAGIC: u8 = 0xE9;

/// Destination for image bytes.
pub trait FlashSink: Send {
    fn write(&mut self, bytes: &[u8]) -> impl Future<Output = io::Result<()>> + Send;
    fn commit(&mut self) -> impl Future<Output = io::Result<()>> + Send;
    fn abort(&mut self) -> impl Future<Output = ()> + Send;
}

/// Stages bytes into a sibling temp file and renames over the target on
/// commit, so the active image is replaced atomically or not at all. The
/// staging file is created lazily on the first write.
pub struct FileFlashSink {
    staging: PathBuf,
    target: PathBuf,
    file: Option<File>,
}

impl FileFlashSink {
    pub fn new(target: &Path) -> Self {
        let staging = target.with_extension(format!("staging-{}", Uuid::new_v4()));
        Self {
            staging,
            target: target.to_path_buf(),
            file: None,
        }
    }

    async fn ensure_open(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            if let Some(parent) = self.target.parent() {
                fs::create_dir_all(parent).await?;
            }
            self.file = Some(File::create(&self.staging).await?);
        }
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("sink closed"))
    }
}

impl FlashSink for FileFlashSink {
    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.ensure_open().await?.write_all(bytes).await
    }

    async fn commit(&mut self) -> io::Result<()> {
        self.ensure_open().await?;
        let file = self
            .file
            .take()
            .ok_or_else(|| io::Error::other("sink closed"))?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&self.staging, &self.target).await?;
        if let Some(parent) = self.target.parent() {
            sync_dir(parent).await?;
        }
        Ok(())
    }

    async fn abort(&mut self) {
        if self.file.take().is_some() {
            if let Err(err) = fs::remove_file(&self.staging).await {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(error = %err, "failed to remove staging image");
                }
            }
        }
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(path)?;
        dir.sync_all()
    })
    .await
    .map_err(|err| io::Error::other(err.to_string()))?
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Receiving,
    Done,
    Aborted,
}

#[derive(Debug)]
pub enum UpdateError {
    Frame(FrameError),
    InvalidMagic,
    EmptyImage,
    Finished,
    Io(String),
}

impl std::fmt::Display for UpdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateError::Frame(err) => write!(f, "{err}"),
            UpdateError::InvalidMagic => write!(f, "invalid firmware image header"),
            UpdateError::EmptyImage => write!(f, "firmware image is empty"),
            UpdateError::Finished => write!(f, "update session already finished"),
            UpdateError::Io(err) => write!(f, "firmware write failed: {err}"),
        }
    }
}

impl From<&UpdateError> for ApiError {
    fn from(err: &UpdateError) -> Self {
        match err {
            UpdateError::Io(_) => ApiError::Internal(err.to_string()),
            _ => ApiError::BadRequest(err.to_string()),
        }
    }
}

/// One update attempt. The sink opens lazily after the header byte checks
/// out, so a bad image never disturbs the staging area.
pub struct FirmwareUpdateSession<S: FlashSink> {
    cursor: FrameCursor,
    sink: Option<S>,
    open_sink: Box<dyn FnMut() -> io::Result<S> + Send>,
    phase: SessionPhase,
    error: Option<UpdateError>,
}

impl<S: FlashSink> FirmwareUpdateSession<S> {
    pub fn new<F>(open_sink: F) -> Self
    where
        F: FnMut() -> io::Result<S> + Send + 'static,
    {
        Self {
            cursor: FrameCursor::default(),
            sink: None,
            open_sink: Box::new(open_sink),
            phase: SessionPhase::Idle,
            error: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn received(&self) -> u64 {
        self.cursor.received()
    }

    /// The sticky failure, surfaced once. A second read returns `None`.
    pub fn take_error(&mut self) -> Option<UpdateError> {
        self.error.take()
    }

    pub async fn push(&mut self, frame: Frame) -> Result<SessionPhase, &UpdateError> {
        if matches!(self.phase, SessionPhase::Done | SessionPhase::Aborted) {
            return Err(self.fail(UpdateError::Finished).await);
        }
        if let Err(err) = self.cursor.accept(&frame) {
            return Err(self.fail(UpdateError::Frame(err)).await);
        }

        if self.phase == SessionPhase::Idle && !frame.bytes.is_empty() {
            if frame.bytes[0] != FIRMWARE_MAGIC {
                return Err(self.fail(UpdateError::InvalidMagic).await);
            }
            match (self.open_sink)() {
                Ok(sink) => self.sink = Some(sink),
                Err(err) => return Err(self.fail(UpdateError::Io(err.to_string())).await),
            }
            self.phase = SessionPhase::Receiving;
        }

        if !frame.bytes.is_empty() {
            if let Some(sink) = self.sink.as_mut() {
                if let Err(err) = sink.write(&frame.bytes).await {
                    return Err(self.fail(UpdateError::Io(err.to_string())).await);
                }
            }
        }

        if frame.is_final {
            let Some(mut sink) = self.sink.take() else {
                return Err(self.fail(UpdateError::EmptyImage).await);
            };
            if let Err(err) = sink.commit().await {
                sink.abort().await;
                return Err(self.fail(UpdateError::Io(err.to_string())).await);
            }
            self.phase = SessionPhase::Done;
            info!(bytes = self.cursor.received(), "firmware image committed");
        }
        Ok(self.phase)
    }

    /// Drops the transfer, releasing the sink and its staging file.
    pub async fn cancel(&mut self) {
        if let Some(mut sink) = self.sink.take() {
            sink.abort().await;
        }
        self.phase = SessionPhase::Aborted;
    }

    async fn fail(&mut self, error: UpdateError) -> &UpdateError {
        if let Some(mut sink) = self.sink.take() {
            sink.abort().await;
        }
        self.phase = SessionPhase::Aborted;
        warn!(error = %error, "firmware update aborted");
        self.error.insert(error)
    }
}

/// `POST /api/firmware/upload` — raw binary image body.
pub async fn post_upload(
    Extension(state): Extension<Arc<AppState>>,
    body: Body,
) -> Result<Response, ApiError> {
    // Only one flash session at a time; a concurrent attempt is rejected
    // rather than interleaved into the staging file.
    let _gate = state
        .ota_gate
        .try_lock()
        .map_err(|_| ApiError::Conflict("a firmware update is already in progress".into()))?;

    let target = state.firmware_image.clone();
    let mut session = FirmwareUpdateSession::new(move || Ok(FileFlashSink::new(&target)));

    let mut stream = BodyExt::into_data_stream(body);
    let mut offset = 0u64;
    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(err) => {
                session.cancel().await;
                return Err(ApiError::BadRequest(err.to_string()));
            }
        };
        let len = bytes.len() as u64;
        let result = session
            .push(Frame {
                offset,
                bytes,
                is_final: false,
            })
            .await;
        if result.is_err() {
            break;
        }
        offset += len;
    }

    if session.phase() == SessionPhase::Receiving {
        let _ = session
            .push(Frame {
                offset,
                bytes: axum::body::Bytes::new(),
                is_final: true,
            })
            .await;
    }

    if let Some(error) = session.take_error() {
        return Err(ApiError::from(&error));
    }
    if session.phase() != SessionPhase::Done {
        return Err(ApiError::BadRequest("firmware image is empty".into()));
    }

    let size = session.received();
    info!(size, "firmware update accepted, scheduling restart");
    state
        .restart
        .schedule(Duration::from_secs(state.restart_grace_secs));

    Ok(JsonResponse(json!({
        "status": "ok",
        "message": "Firmware updated, device restarting",
        "size": size,
    }))
    .into_response())
}
