//! Time synchronization, backed by the host clock.
//!
//! The device build syncs against an NTP server; on the host the clock is
//! already disciplined, so the poll task only flips the `synced` flag on the
//! configured cadence. The offset is the operator's display timezone.

use axum::body::Body;
use axum::extract::Extension;
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

use crate::config::NtpConfig;
use crate::error::ApiError;
use crate::frames::read_bounded_json;
use crate::state::AppState;

#[derive(Default)]
pub struct TimeSync {
    synced: AtomicBool,
}

impl TimeSync {
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Relaxed)
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.synced.store(false, Ordering::Relaxed);
    }

    /// Local time string with the configured offset applied.
    pub fn formatted_time(&self, config: &NtpConfig) -> String {
        if !config.enabled {
            return "NTP Disabled".to_string();
        }
        let local = Utc::now() + ChronoDuration::seconds(config.offset);
        local.format("%Y-%m-%d %H:%M:%S").to_string()
    }

    pub fn epoch_time(&self, config: &NtpConfig) -> i64 {
        if !config.enabled {
            return 0;
        }
        Utc::now().timestamp() + config.offset
    }

    /// One poll tick. The host clock is authoritative, so a tick just
    /// confirms sync.
    pub fn poll(&self, config: &NtpConfig) {
        if config.enabled {
            self.mark_synced();
            debug!(server = %config.server, "time sync poll");
        } else {
            self.clear();
        }
    }
}

pub async fn get_config(Extension(state): Extension<Arc<AppState>>) -> Response {
    JsonResponse(state.config.snapshot().await.ntp).into_response()
}

pub async fn post_config(
    Extension(state): Extension<Arc<AppState>>,
    body: Body,
) -> Result<Response, ApiError> {
    let config: NtpConfig = read_bounded_json(body).await?;
    if config.server.trim().is_empty() {
        return Err(ApiError::BadRequest("server must not be empty".into()));
    }
    if config.interval == 0 {
        return Err(ApiError::BadRequest("interval must be positive".into()));
    }

    state
        .config
        .update(|doc| doc.ntp = config.clone())
        .await?;
    state.timesync.poll(&config);

    Ok(JsonResponse(json!({
        "status": "ok",
        "message": "Configuration saved",
    }))
    .into_response())
}

pub async fn get_time(Extension(state): Extension<Arc<AppState>>) -> Response {
    let config = state.config.snapshot().await.ntp;
    JsonResponse(json!({
        "time": state.timesync.formatted_time(&config),
        "epoch": state.timesync.epoch_time(&config),
        "enabled": config.enabled,
        "synced": state.timesync.is_synced(),
    }))
    .into_response()
}
