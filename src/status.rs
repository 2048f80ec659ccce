//! Device status endpoint for the dashboard.

use axum::extract::Extension;
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::build;
use crate::state::AppState;

/// `Xd Xh Xm Xs` rendering of an uptime.
pub fn format_uptime(uptime: Duration) -> String {
    let total = uptime.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    format!("{days}d {hours}h {minutes}m {seconds}s")
}

pub async fn get_status(Extension(state): Extension<Arc<AppState>>) -> Response {
    let uptime = state.started_at.elapsed();
    let config = state.config.snapshot().await;

    let (used, storage_ready) = match state.storage.used_bytes().await {
        Ok(used) => (used, true),
        Err(err) => {
            warn!(error = %err, "storage usage walk failed");
            (0, false)
        }
    };
    let total = state.storage_capacity;
    let free = total.saturating_sub(used);
    let percent = if total > 0 {
        (used as f64 / total as f64 * 100.0).round()
    } else {
        0.0
    };

    let motion = state.motion.status();

    JsonResponse(json!({
        "status": if storage_ready { "healthy" } else { "degraded" },
        "uptime_ms": uptime.as_millis() as u64,
        "uptime": format_uptime(uptime),
        "storage": {
            "ready": storage_ready,
            "total": total,
            "used": used,
            "free": free,
            "percent": percent,
        },
        "network": state.network.status(&config.wifi),
        "ntp": {
            "enabled": config.ntp.enabled,
            "synced": state.timesync.is_synced(),
            "time": state.timesync.formatted_time(&config.ntp),
        },
        "stepper": motion,
        "build": {
            "version": build::PKG_VERSION,
            "commit": build::SHORT_COMMIT,
            "built_at": build::BUILD_TIME,
        },
    }))
    .into_response()
}
