//! Dispenser management daemon.
//!
//! This crate is the management plane of one motorized dispenser unit: a
//! Basic-Auth gated HTTP API for motion control, configuration, the file
//! manager behind the management UI, firmware updates, and device status.
//! The main entry point builds the Axum router and starts the listener.

mod atomic;
mod auth;
mod background;
mod config;
mod error;
mod files;
mod firmware;
mod frames;
mod gpio;
mod http;
mod locking;
mod logging;
mod network;
mod ntp;
mod pages;
mod pathcheck;
mod reboot;
mod state;
mod status;
mod stepper;
mod storage;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::Mutex;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::auth::{CredentialStore, Credentials};
use crate::background::spawn_background_tasks;
use crate::config::{Args, ConfigStore};
use crate::gpio::{OutputPin, SimulatedPin};
use crate::http::build_cors_layer;
use crate::locking::LockManager;
use crate::network::HostNetwork;
use crate::ntp::TimeSync;
use crate::reboot::RestartHandle;
use crate::state::AppState;
use crate::stepper::MotionController;
use crate::storage::Storage;

shadow!(build);

/// Starts the daemon and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage = Arc::new(Storage::new(PathBuf::from(&args.storage_dir)));
    storage.ensure_root().await?;

    let config = ConfigStore::load(storage.clone()).await;
    let doc = config.snapshot().await;
    let credentials = CredentialStore::new(Credentials::from(&doc.web));
    let motion = MotionController::spawn(
        doc.stepper.clone(),
        Arc::new(|pin| Box::new(SimulatedPin::new(pin)) as Box<dyn OutputPin>),
    );

    let handle = Handle::new();
    let state = Arc::new(AppState {
        storage,
        config,
        credentials,
        motion,
        locks: LockManager::new(),
        timesync: TimeSync::default(),
        network: Box::new(HostNetwork),
        restart: RestartHandle::new(handle.clone()),
        firmware_image: PathBuf::from(&args.firmware_image),
        storage_capacity: args.storage_capacity,
        restart_grace_secs: args.restart_grace_secs,
        ota_gate: Mutex::new(()),
        started_at: Instant::now(),
    });

    let mut app = Router::new()
        .route("/api/status", get(status::get_status))
        .route("/api/auth/status", get(auth::auth_status))
        .route("/api/auth/change-password", post(auth::change_password))
        .route("/api/files/list", get(files::list))
        .route("/api/files/download", get(files::download))
        .route("/api/files/view", get(files::view))
        .route("/api/files/read", get(files::read))
        .route("/api/files/write", post(files::write))
        .route("/api/files/delete", post(files::delete))
        .route("/api/files/mkdir", post(files::mkdir))
        .route(
            "/api/files/upload",
            post(files::upload).layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/api/firmware/upload",
            post(firmware::post_upload).layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/api/stepper/config",
            get(stepper::get_config).post(stepper::post_config),
        )
        .route("/api/stepper/status", get(stepper::get_status))
        .route("/api/stepper/move", post(stepper::post_move))
        .route("/api/stepper/step", post(stepper::post_step))
        .route("/api/stepper/stop", post(stepper::post_stop))
        .route("/api/stepper/reset", post(stepper::post_reset))
        .route(
            "/api/ntp/config",
            get(ntp::get_config).post(ntp::post_config),
        )
        .route("/api/ntp/time", get(ntp::get_time))
        .route("/api/wifi/scan", get(network::get_scan))
        .route("/api/wifi/status", get(network::get_status))
        .route("/api/wifi/connect", post(network::post_connect))
        .route("/", get(pages::index))
        .route("/{*path}", get(pages::asset))
        .layer(middleware::from_fn(auth::auth_middleware))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let forwarded_ip = request
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.split(',').next().unwrap_or("").trim().to_string());
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.to_string());
                    let client_ip = forwarded_ip
                        .or(connect_ip)
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(state.clone()));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.http_port);

    info!("starting management server at {}", addr);
    spawn_background_tasks(state);

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
