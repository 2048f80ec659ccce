//! File-manager HTTP surface over the sandboxed storage root.
//!
//! Every client-supplied path goes through [`Storage::resolve`], which
//! re-validates it and refuses symlinks, before the filesystem is touched.
//! Mutations additionally hold the per-path lock for their duration.

use axum::body::Body;
use axum::extract::{Extension, Query};
use axum::http::header;
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::info;

use crate::atomic::AtomicFile;
use crate::config::{DEFAULT_LOCK_WAIT_TIMEOUT_SECS, MAX_FILE_READ_BYTES};
use crate::error::ApiError;
use crate::frames::{Frame, FrameCursor, read_bounded_json};
use crate::state::AppState;
use crate::storage::Storage;

fn lock_wait() -> Duration {
    Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS)
}

#[derive(Deserialize)]
pub(crate) struct DirQuery {
    dir: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct FileQuery {
    file: String,
}

#[derive(Deserialize)]
pub(crate) struct UploadQuery {
    dir: Option<String>,
    name: String,
}

pub async fn list(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<DirQuery>,
) -> Result<Response, ApiError> {
    let dir = query.dir.unwrap_or_else(|| "/".to_string());
    let entries = state.storage.list_dir(&dir).await?;
    Ok(JsonResponse(json!({ "path": dir, "files": entries })).into_response())
}

pub async fn download(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    serve_file(&state.storage, &query.file, true).await
}

pub async fn view(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    serve_file(&state.storage, &query.file, false).await
}

async fn serve_file(
    storage: &Storage,
    device_path: &str,
    attachment: bool,
) -> Result<Response, ApiError> {
    let target = storage.resolve(device_path, false).await?;
    let file = tokio::fs::File::open(&target)
        .await
        .map_err(|_| ApiError::NotFound(format!("{device_path} not found")))?;
    let metadata = file
        .metadata()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    if metadata.is_dir() {
        return Err(ApiError::BadRequest(format!("{device_path} is a directory")));
    }

    let name = device_path.rsplit('/').next().unwrap_or(device_path);
    let mut builder = Response::builder()
        .header(header::CONTENT_LENGTH, metadata.len())
        .header(header::CONTENT_TYPE, content_type(device_path, attachment));
    if attachment {
        builder = builder.header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{name}\""),
        );
    }
    if let Ok(modified) = metadata.modified() {
        builder = builder.header(header::LAST_MODIFIED, httpdate::fmt_http_date(modified));
    }

    builder
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|err| ApiError::Internal(err.to_string()))
}

fn content_type(device_path: &str, attachment: bool) -> String {
    if attachment {
        mime_guess::mime::APPLICATION_OCTET_STREAM.to_string()
    } else {
        mime_guess::from_path(device_path)
            .first_or_octet_stream()
            .to_string()
    }
}

/// Inline read for the UI editor, capped so large binaries do not flood the
/// page.
pub async fn read(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<FileQuery>,
) -> Result<Response, ApiError> {
    let bytes = state.storage.read_file(&query.file).await?;
    let truncated = bytes.len() as u64 > MAX_FILE_READ_BYTES;
    let shown = if truncated {
        &bytes[..MAX_FILE_READ_BYTES as usize]
    } else {
        &bytes[..]
    };

    Ok(JsonResponse(json!({
        "status": "ok",
        "content": String::from_utf8_lossy(shown),
        "size": bytes.len(),
        "truncated": truncated,
    }))
    .into_response())
}

#[derive(Deserialize)]
pub(crate) struct WriteRequest {
    file: String,
    #[serde(default)]
    content: String,
}

pub async fn write(
    Extension(state): Extension<Arc<AppState>>,
    body: Body,
) -> Result<Response, ApiError> {
    let request: WriteRequest = read_bounded_json(body).await?;
    let _guard = state.locks.lock_path(&request.file, lock_wait()).await?;
    let target = state.storage.resolve(&request.file, true).await?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
    }

    let mut atomic = AtomicFile::new(&target).await?;
    if let Err(err) = atomic.file_mut().write_all(request.content.as_bytes()).await {
        atomic.cleanup().await;
        return Err(ApiError::Internal(err.to_string()));
    }
    atomic.finalize().await?;

    Ok(JsonResponse(json!({
        "status": "ok",
        "file": request.file,
        "size": request.content.len(),
    }))
    .into_response())
}

pub async fn delete(
    Extension(state): Extension<Arc<AppState>>,
    body: Body,
) -> Result<Response, ApiError> {
    let request: FileBody = read_bounded_json(body).await?;
    if request.file == "/" {
        return Err(ApiError::BadRequest("refusing to delete the root".into()));
    }
    let _guard = state.locks.lock_path(&request.file, lock_wait()).await?;
    state.storage.delete(&request.file).await?;
    info!(file = %request.file, "deleted");
    Ok(JsonResponse(json!({ "status": "ok", "file": request.file })).into_response())
}

#[derive(Deserialize)]
pub(crate) struct FileBody {
    file: String,
}

#[derive(Deserialize)]
pub(crate) struct DirBody {
    dir: String,
}

pub async fn mkdir(
    Extension(state): Extension<Arc<AppState>>,
    body: Body,
) -> Result<Response, ApiError> {
    let request: DirBody = read_bounded_json(body).await?;
    let _guard = state.locks.lock_path(&request.dir, lock_wait()).await?;
    state.storage.create_dir(&request.dir).await?;
    Ok(JsonResponse(json!({ "status": "ok", "dir": request.dir })).into_response())
}

/// Streaming upload. The body lands in a temp file that only replaces the
/// destination when every frame has arrived in order.
pub async fn upload(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<UploadQuery>,
    body: Body,
) -> Result<Response, ApiError> {
    if query.name.is_empty() || query.name.contains('/') || query.name.contains('\\') {
        return Err(ApiError::BadRequest("invalid file name".into()));
    }
    let dir = query.dir.unwrap_or_else(|| "/".to_string());
    let device_path = if dir.ends_with('/') {
        format!("{dir}{}", query.name)
    } else {
        format!("{dir}/{}", query.name)
    };

    let _guard = state.locks.lock_path(&device_path, lock_wait()).await?;
    let target = state.storage.resolve(&device_path, true).await?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
    }

    let mut atomic = AtomicFile::new(&target).await?;
    let mut cursor = FrameCursor::default();
    let mut stream = BodyExt::into_data_stream(body);
    let mut offset = 0u64;

    while let Some(chunk) = stream.next().await {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(err) => {
                atomic.cleanup().await;
                return Err(ApiError::BadRequest(err.to_string()));
            }
        };
        let frame = Frame {
            offset,
            bytes,
            is_final: false,
        };
        if let Err(err) = cursor.accept(&frame) {
            atomic.cleanup().await;
            return Err(err.into());
        }
        if let Err(err) = atomic.file_mut().write_all(&frame.bytes).await {
            atomic.cleanup().await;
            return Err(ApiError::Internal(err.to_string()));
        }
        offset += frame.bytes.len() as u64;
    }
    atomic.finalize().await?;

    info!(file = %device_path, size = offset, "upload stored");
    Ok(JsonResponse(json!({
        "status": "ok",
        "file": device_path,
        "size": offset,
    }))
    .into_response())
}
