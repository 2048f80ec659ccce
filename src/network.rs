//! WiFi collaborator.
//!
//! The daemon persists radio credentials and reports link status; actually
//! joining a network is the platform layer's job, reached through
//! [`NetworkControl`]. The host implementation is a stub that reports the
//! configured state, which keeps the HTTP surface and persistence testable
//! off-device.

use axum::body::Body;
use axum::extract::Extension;
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::WifiConfig;
use crate::error::ApiError;
use crate::frames::read_bounded_json;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
pub struct NetworkInfo {
    pub ssid: String,
    pub rssi: i32,
    pub secure: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkStatus {
    pub connected: bool,
    pub ssid: String,
    pub ap_mode: bool,
}

pub trait NetworkControl {
    fn scan(&self) -> Vec<NetworkInfo>;
    fn status(&self, config: &WifiConfig) -> NetworkStatus;
}

/// Host stub: no radio, so scans are empty and status mirrors the stored
/// configuration.
pub struct HostNetwork;

impl NetworkControl for HostNetwork {
    fn scan(&self) -> Vec<NetworkInfo> {
        Vec::new()
    }

    fn status(&self, config: &WifiConfig) -> NetworkStatus {
        NetworkStatus {
            connected: !config.ap_mode,
            ssid: config.ssid.clone(),
            ap_mode: config.ap_mode,
        }
    }
}

pub async fn get_scan(Extension(state): Extension<Arc<AppState>>) -> Response {
    JsonResponse(json!({ "networks": state.network.scan() })).into_response()
}

pub async fn get_status(Extension(state): Extension<Arc<AppState>>) -> Response {
    let wifi = state.config.snapshot().await.wifi;
    JsonResponse(state.network.status(&wifi)).into_response()
}

#[derive(Deserialize)]
pub(crate) struct ConnectRequest {
    #[serde(default)]
    ssid: String,
    #[serde(default)]
    password: String,
}

/// Stores station credentials and schedules the restart that applies them.
pub async fn post_connect(
    Extension(state): Extension<Arc<AppState>>,
    body: Body,
) -> Result<Response, ApiError> {
    let request: ConnectRequest = read_bounded_json(body).await?;
    if request.ssid.trim().is_empty() {
        return Err(ApiError::BadRequest("ssid must not be empty".into()));
    }

    state
        .config
        .update(|doc| {
            doc.wifi.ssid = request.ssid.clone();
            doc.wifi.password = request.password.clone();
            doc.wifi.ap_mode = false;
        })
        .await?;

    info!(ssid = %request.ssid, "wifi credentials stored, scheduling restart");
    state
        .restart
        .schedule(Duration::from_secs(state.restart_grace_secs));

    Ok(JsonResponse(json!({
        "status": "ok",
        "message": "Credentials saved, device restarting",
    }))
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_stub_reports_configured_state() {
        let network = HostNetwork;
        assert!(network.scan().is_empty());

        let status = network.status(&WifiConfig::default());
        assert!(status.ap_mode);
        assert!(!status.connected);
        assert_eq!(status.ssid, "Dispenser-AP");

        let station = network.status(&WifiConfig {
            ap_mode: false,
            ssid: "lab".into(),
            ..WifiConfig::default()
        });
        assert!(station.connected);
    }

    #[tokio::test]
    async fn connect_persists_station_credentials() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = crate::state::testing::app_state(temp.path()).await;

        let body = Body::from(r#"{"ssid": "lab", "password": "hunter22"}"#);
        post_connect(Extension(state.clone()), body)
            .await
            .expect("connect");

        let doc = state.config.snapshot().await;
        assert_eq!(doc.wifi.ssid, "lab");
        assert_eq!(doc.wifi.password, "hunter22");
        assert!(!doc.wifi.ap_mode);
    }

    #[tokio::test]
    async fn connect_requires_an_ssid() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = crate::state::testing::app_state(temp.path()).await;

        let result = post_connect(Extension(state), Body::from(r#"{"ssid": "  "}"#)).await;
        assert!(matches!(result, Err(crate::error::ApiError::BadRequest(_))));
    }
}
