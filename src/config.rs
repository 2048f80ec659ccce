//! CLI arguments, server defaults, and the persisted device configuration.

use clap::Parser;
use serde::{Deserialize, Serialize};
use shadow_rs::formatcp;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::atomic::AtomicFile;
use crate::build;
use crate::error::ApiError;
use crate::storage::Storage;

const VERSION_INFO: &str = formatcp!(
    r#"{}
commit_hash: {}
build_time: {}
build_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const CONFIG_DEVICE_PATH: &str = "/config.json";
pub const WEB_ASSET_ROOT: &str = "/web";
pub const MAX_JSON_BODY_BYTES: usize = 16 * 1024;
pub const MAX_CREDENTIAL_BYTES: usize = 256;
pub const MAX_FILE_READ_BYTES: u64 = 50 * 1024;
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 5;
pub const LOCK_PRUNE_INTERVAL_SECS: u64 = 300;

pub const DEFAULT_USERNAME: &str = "admin";
/// SHA-256 of the factory default password ("admin").
pub const DEFAULT_PASSWORD_HASH: &str =
    "8c6976e5b5410415bde908bd4dee15dfb167a9c873fc4bb8a81f6f2ab448a918";

/// CLI arguments and environment configuration for the daemon.
#[derive(Parser, Debug)]
#[command(name = "dispenserd", version = VERSION_INFO, about = "Dispenser management daemon")]
pub struct Args {
    #[arg(
        short = 's',
        long,
        env = "DISPENSER_STORAGE_DIR",
        default_value = ".dispenser/storage",
        help = "Host directory backing the device filesystem"
    )]
    pub storage_dir: String,
    #[arg(
        long,
        env = "DISPENSER_STORAGE_CAPACITY",
        default_value_t = 16 * 1024 * 1024,
        help = "Reported storage capacity in bytes"
    )]
    pub storage_capacity: u64,
    #[arg(
        long,
        env = "DISPENSER_FIRMWARE_IMAGE",
        default_value = ".dispenser/firmware.bin",
        help = "Host path receiving committed firmware images"
    )]
    pub firmware_image: String,
    #[arg(
        short = 'b',
        long,
        env = "DISPENSER_BIND",
        default_value = "0.0.0.0",
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "DISPENSER_HTTP_PORT",
        default_value_t = 8080,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        long,
        env = "DISPENSER_CORS_ORIGINS",
        help = "Comma separated CORS origins"
    )]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "DISPENSER_RESTART_GRACE_SECS",
        default_value_t = 2,
        help = "Grace period before a scheduled restart"
    )]
    pub restart_grace_secs: u64,
}

/// The persisted configuration document, one JSON object with a section per
/// subsystem. Every field carries a default so a partial or missing document
/// loads cleanly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub wifi: WifiConfig,
    pub ntp: NtpConfig,
    pub stepper: StepperConfig,
    pub web: WebConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiConfig {
    pub ssid: String,
    pub password: String,
    pub ap_mode: bool,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            ssid: "Dispenser-AP".to_string(),
            password: "12345678".to_string(),
            ap_mode: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NtpConfig {
    pub server: String,
    /// UTC offset in seconds.
    pub offset: i64,
    /// Poll interval in milliseconds.
    pub interval: u64,
    pub enabled: bool,
}

impl Default for NtpConfig {
    fn default() -> Self {
        Self {
            server: "pool.ntp.org".to_string(),
            offset: -10800,
            interval: 60_000,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StepperConfig {
    pub pin1: u8,
    pub pin2: u8,
    pub pin3: u8,
    pub pin4: u8,
    /// Rotation speed in RPM, clamped into the motor's supported band.
    pub speed: u32,
    pub steps_per_rev: u32,
    pub enabled: bool,
}

impl Default for StepperConfig {
    fn default() -> Self {
        Self {
            pin1: 25,
            pin2: 26,
            pin3: 27,
            pin4: 14,
            speed: 10,
            steps_per_rev: 2048,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub username: String,
    pub password_hash: String,
    pub first_login: bool,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            username: DEFAULT_USERNAME.to_string(),
            password_hash: DEFAULT_PASSWORD_HASH.to_string(),
            first_login: true,
        }
    }
}

/// Owner of the persisted document. Section updates go through [`update`]
/// which writes the whole document atomically before returning.
///
/// [`update`]: ConfigStore::update
pub struct ConfigStore {
    storage: Arc<Storage>,
    doc: Mutex<DeviceConfig>,
}

impl ConfigStore {
    pub async fn load(storage: Arc<Storage>) -> Self {
        let doc = match storage.read_file(CONFIG_DEVICE_PATH).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(doc) => doc,
                Err(err) => {
                    warn!(error = %err, "stored configuration is malformed, using defaults");
                    DeviceConfig::default()
                }
            },
            Err(_) => {
                info!("no stored configuration, using defaults");
                DeviceConfig::default()
            }
        };

        Self {
            storage,
            doc: Mutex::new(doc),
        }
    }

    pub async fn snapshot(&self) -> DeviceConfig {
        self.doc.lock().await.clone()
    }

    /// Applies a mutation to the document and persists it. The in-memory
    /// document is only updated once the write succeeds.
    pub async fn update<F>(&self, apply: F) -> Result<(), ApiError>
    where
        F: FnOnce(&mut DeviceConfig),
    {
        let mut doc = self.doc.lock().await;
        let mut updated = doc.clone();
        apply(&mut updated);
        self.persist(&updated).await?;
        *doc = updated;
        Ok(())
    }

    async fn persist(&self, doc: &DeviceConfig) -> Result<(), ApiError> {
        let target = self.storage.resolve(CONFIG_DEVICE_PATH, true).await?;
        let bytes = serde_json::to_vec_pretty(doc)
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        let mut atomic = AtomicFile::new(&target).await?;
        if let Err(err) = atomic.file_mut().write_all(&bytes).await {
            atomic.cleanup().await;
            return Err(ApiError::Internal(err.to_string()));
        }
        atomic.finalize().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_storage() -> (tempfile::TempDir, Arc<Storage>) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("root");
        std::fs::create_dir_all(&root).expect("create root");
        (temp, Arc::new(Storage::new(root)))
    }

    #[tokio::test]
    async fn load_defaults_when_document_missing() {
        let (_temp, storage) = make_storage();
        let store = ConfigStore::load(storage).await;
        let doc = store.snapshot().await;
        assert_eq!(doc.web.username, "admin");
        assert!(doc.web.first_login);
        assert_eq!(doc.stepper.steps_per_rev, 2048);
    }

    #[tokio::test]
    async fn partial_document_fills_missing_fields() {
        let (_temp, storage) = make_storage();
        std::fs::write(
            storage.root_path().join("config.json"),
            br#"{"stepper": {"speed": 12}, "ntp": {"enabled": false}}"#,
        )
        .expect("seed config");

        let store = ConfigStore::load(storage).await;
        let doc = store.snapshot().await;
        assert_eq!(doc.stepper.speed, 12);
        assert_eq!(doc.stepper.pin1, 25);
        assert!(!doc.ntp.enabled);
        assert_eq!(doc.ntp.server, "pool.ntp.org");
    }

    #[tokio::test]
    async fn update_persists_before_returning() {
        let (_temp, storage) = make_storage();
        let store = ConfigStore::load(storage.clone()).await;
        store
            .update(|doc| doc.wifi.ap_mode = false)
            .await
            .expect("update");

        let bytes = storage.read_file(CONFIG_DEVICE_PATH).await.expect("read");
        let reloaded: DeviceConfig = serde_json::from_slice(&bytes).expect("parse");
        assert!(!reloaded.wifi.ap_mode);
    }
}
