//! Periodic background tasks: time-sync polling and lock table pruning.

use std::sync::Arc;
use std::time::Duration;

use crate::config::LOCK_PRUNE_INTERVAL_SECS;
use crate::state::AppState;

pub fn spawn_background_tasks(state: Arc<AppState>) {
    let sync_state = state.clone();
    tokio::spawn(async move {
        loop {
            let config = sync_state.config.snapshot().await.ntp;
            sync_state.timesync.poll(&config);
            let interval = Duration::from_millis(config.interval.max(1_000));
            tokio::time::sleep(interval).await;
        }
    });

    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(LOCK_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            state.locks.prune().await;
        }
    });
}
