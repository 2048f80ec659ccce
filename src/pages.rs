//! Management UI delivery.
//!
//! Pages and assets live under `/web` in the storage root, uploaded through
//! the file manager like any other content. Extensionless request paths are
//! page aliases (`/stepper` -> `stepper.html`).

use axum::extract::{Extension, Path};
use axum::http::header;
use axum::response::Response;
use axum::body::Body;
use std::sync::Arc;

use crate::config::WEB_ASSET_ROOT;
use crate::error::ApiError;
use crate::state::AppState;
use crate::storage::StorageError;

pub async fn index(Extension(state): Extension<Arc<AppState>>) -> Result<Response, ApiError> {
    serve(&state, "index.html").await
}

pub async fn asset(
    Extension(state): Extension<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<Response, ApiError> {
    let rel = if path.rsplit('/').next().is_some_and(|leaf| leaf.contains('.')) {
        path
    } else {
        format!("{path}.html")
    };
    serve(&state, &rel).await
}

async fn serve(state: &AppState, rel: &str) -> Result<Response, ApiError> {
    let root_ok = tokio::fs::try_exists(state.storage.root_path())
        .await
        .unwrap_or(false);
    if !root_ok {
        return Err(ApiError::ServiceUnavailable("storage is unavailable".into()));
    }

    let device_path = format!("{WEB_ASSET_ROOT}/{rel}");
    let bytes = state.storage.read_file(&device_path).await.map_err(|err| {
        match err {
            StorageError::InvalidPath => ApiError::BadRequest("invalid path".into()),
            StorageError::Io(_) => ApiError::NotFound(format!("{rel} not found")),
        }
    })?;

    let mime = mime_guess::from_path(rel).first_or_octet_stream();
    let mut builder = Response::builder().header(header::CONTENT_TYPE, mime.to_string());
    if rel.ends_with(".js") || rel.ends_with(".css") {
        builder = builder.header(header::CACHE_CONTROL, "public, max-age=3600");
    }

    builder
        .body(Body::from(bytes))
        .map_err(|err| ApiError::Internal(err.to_string()))
}
