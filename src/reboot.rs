//! Scheduled restart.
//!
//! On the device a restart is a reboot; here it is a graceful shutdown that
//! the process supervisor answers by relaunching the daemon. The grace
//! period lets the triggering HTTP response reach the client first.

use axum_server::Handle;
use std::time::Duration;
use tracing::info;

#[derive(Clone)]
pub struct RestartHandle {
    handle: Handle,
}

impl RestartHandle {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Shuts the listener down after `grace`, draining in-flight requests.
    pub fn schedule(&self, grace: Duration) {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            info!("restart scheduled, shutting down for relaunch");
            handle.graceful_shutdown(Some(Duration::from_secs(10)));
        });
    }
}
