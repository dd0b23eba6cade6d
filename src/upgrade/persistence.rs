use async_trait::async_trait;
use chrono::Utc;
use fd_lock::RwLock;
use rand::Rng;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::errors::UpgradeError;
use super::state::{UpgradeState, STATE_SCHEMA_VERSION};

pub const STATE_FILE_NAME: &str = "upgrade-state.json";
pub const LOCK_FILE_NAME: &str = "upgrade.lock";

/// Durable storage for the upgrade state of one devnet
#[async_trait]
pub trait StateManager: Send + Sync {
    /// `Ok(None)` when no upgrade has been saved
    async fn load_state(&self) -> Result<Option<UpgradeState>, UpgradeError>;

    /// Recomputes `state.checksum` and atomically replaces the saved document
    async fn save_state(&self, state: &mut UpgradeState) -> Result<(), UpgradeError>;

    /// Removing an absent state is not an error
    async fn delete_state(&self) -> Result<(), UpgradeError>;

    /// Exclusive per-devnet lock; fails with `UpgradeInProgress` while held
    async fn acquire_lock(&self) -> Result<(), UpgradeError>;

    async fn release_lock(&self) -> Result<(), UpgradeError>;

    /// Schema and checksum verification, independent of loading
    fn validate_state(&self, state: &UpgradeState) -> Result<(), UpgradeError>;

    fn state_path(&self) -> &Path;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LockOwner {
    pid: u32,
    hostname: String,
    acquired_at: chrono::DateTime<Utc>,
}

/// File system implementation keeping state and lock under the devnet home
pub struct FileStateManager {
    state_path: PathBuf,
    lock_path: PathBuf,
    held_lock: Mutex<Option<RwLock<File>>>,
}

impl FileStateManager {
    pub fn new(devnet_home: impl AsRef<Path>) -> Self {
        let home = devnet_home.as_ref();
        Self {
            state_path: home.join(STATE_FILE_NAME),
            lock_path: home.join(LOCK_FILE_NAME),
            held_lock: Mutex::new(None),
        }
    }

    fn corruption(&self, reason: impl Into<String>) -> UpgradeError {
        UpgradeError::StateCorruption {
            path: self.state_path.clone(),
            reason: reason.into(),
        }
    }

    /// `Ok(false)` when another holder (process or handle) owns the lock
    fn try_lock_file(&self) -> Result<bool, UpgradeError> {
        let mut held = self.held_lock.lock().map_err(|_| UpgradeError::LockError {
            reason: "lock bookkeeping poisoned".to_string(),
        })?;
        if held.is_some() {
            return Ok(false);
        }

        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;
        let mut lock = RwLock::new(file);

        match lock.try_write() {
            Ok(mut guard) => {
                let owner = LockOwner {
                    pid: std::process::id(),
                    hostname: hostname::get()
                        .unwrap_or_default()
                        .to_string_lossy()
                        .to_string(),
                    acquired_at: Utc::now(),
                };
                guard.set_len(0)?;
                guard.write_all(serde_json::to_string(&owner)?.as_bytes())?;
                // Closing the descriptor in release_lock drops the OS lock
                std::mem::forget(guard);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        *held = Some(lock);
        Ok(true)
    }

    async fn in_progress_error(&self) -> UpgradeError {
        let (upgrade_name, stage) = match self.load_state().await {
            Ok(Some(state)) => (state.upgrade_name, state.stage.to_string()),
            _ => ("unknown".to_string(), "unknown".to_string()),
        };
        UpgradeError::UpgradeInProgress { upgrade_name, stage }
    }

    fn temp_path(&self) -> PathBuf {
        let suffix: u32 = rand::rng().random();
        self.state_path
            .with_extension(format!("json.{:08x}.tmp", suffix))
    }
}

#[async_trait]
impl StateManager for FileStateManager {
    async fn load_state(&self) -> Result<Option<UpgradeState>, UpgradeError> {
        let contents = match fs::read_to_string(&self.state_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(file = ?self.state_path, "No saved upgrade state");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let state: UpgradeState = serde_json::from_str(&contents)
            .map_err(|e| self.corruption(format!("unreadable state document: {e}")))?;
        self.validate_state(&state)?;

        info!(
            upgrade = %state.upgrade_name,
            stage = %state.stage,
            updated_at = %state.updated_at,
            "Loaded saved upgrade state"
        );

        Ok(Some(state))
    }

    async fn save_state(&self, state: &mut UpgradeState) -> Result<(), UpgradeError> {
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        state.schema_version = STATE_SCHEMA_VERSION;
        state.checksum = state.compute_checksum()?;
        let serialized = serde_json::to_string_pretty(state)?;

        // Write to temporary file first, then rename (atomic operation)
        let temp_path = self.temp_path();
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(serialized.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &self.state_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        debug!(
            upgrade = %state.upgrade_name,
            stage = %state.stage,
            file = ?self.state_path,
            "Upgrade state saved"
        );

        Ok(())
    }

    async fn delete_state(&self) -> Result<(), UpgradeError> {
        match fs::remove_file(&self.state_path).await {
            Ok(()) => {
                info!(file = ?self.state_path, "Deleted upgrade state");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn acquire_lock(&self) -> Result<(), UpgradeError> {
        if self.try_lock_file()? {
            debug!(file = ?self.lock_path, "Acquired upgrade lock");
            Ok(())
        } else {
            let err = self.in_progress_error().await;
            warn!(file = ?self.lock_path, error = %err, "Upgrade lock is held");
            Err(err)
        }
    }

    async fn release_lock(&self) -> Result<(), UpgradeError> {
        let released = self
            .held_lock
            .lock()
            .map_err(|_| UpgradeError::LockError {
                reason: "lock bookkeeping poisoned".to_string(),
            })?
            .take();

        if released.is_some() {
            debug!(file = ?self.lock_path, "Released upgrade lock");
        }
        Ok(())
    }

    fn validate_state(&self, state: &UpgradeState) -> Result<(), UpgradeError> {
        if state.schema_version != STATE_SCHEMA_VERSION {
            return Err(self.corruption(format!(
                "unsupported schema version {} (expected {})",
                state.schema_version, STATE_SCHEMA_VERSION
            )));
        }

        if state.checksum.is_empty() {
            return Err(self.corruption("missing checksum"));
        }

        let actual = state.compute_checksum()?;
        if actual != state.checksum {
            warn!(
                upgrade = %state.upgrade_name,
                expected = %state.checksum,
                actual = %actual,
                "Upgrade state checksum mismatch"
            );
            return Err(self.corruption("checksum mismatch"));
        }

        if let Some(last) = state.stage_history.last() {
            if last.to != state.stage {
                return Err(self.corruption(format!(
                    "stage {} does not match last recorded transition to {}",
                    state.stage, last.to
                )));
            }
        }

        Ok(())
    }

    fn state_path(&self) -> &Path {
        &self.state_path
    }
}
