//! Shared application state handed to every handler via `Extension`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use crate::auth::CredentialStore;
use crate::config::ConfigStore;
use crate::locking::LockManager;
use crate::network::NetworkControl;
use crate::ntp::TimeSync;
use crate::reboot::RestartHandle;
use crate::stepper::MotionController;
use crate::storage::Storage;


pub struct AppState {
    pub storage: Arc<Storage>,
    pub config: ConfigStore,
    pub credentials: CredentialStore,
    pub motion: MotionController,
    pub locks: LockManager,
    pub timesync: TimeSync,
    pub network: Box<dyn NetworkControl + Send + Sync>,
    pub restart: RestartHandle,
    /// Host path receiving committed firmware images.
    pub firmware_image: PathBuf,
    /// Reported storage capacity in bytes.
    pub storage_capacity: u64,
    pub restart_grace_secs: u64,
    /// Held for the duration of a firmware upload; `try_lock` failure means
    /// another flash session is in flight.
    pub ota_gate: Mutex<()>,
    pub started_at: Instant,
}
