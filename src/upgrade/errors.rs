use std::path::PathBuf;
use thiserror::Error;

use super::state::ResumableStage;

/// Errors surfaced by the upgrade orchestrator and its state handling
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("upgrade state at {path} is corrupted: {reason}. Run with --clear-state to discard it")]
    StateCorruption { path: PathBuf, reason: String },

    #[error("upgrade '{upgrade_name}' is already in progress (stage: {stage})")]
    UpgradeInProgress { upgrade_name: String, stage: String },

    #[error("invalid stage transition: {from} -> {to}")]
    InvalidTransition {
        from: ResumableStage,
        to: ResumableStage,
    },

    #[error("upgrade cancelled during {stage}; progress up to the last completed stage is saved")]
    Cancelled { stage: ResumableStage },

    #[error("upgrade failed during {stage}: {reason}")]
    StageFailed {
        stage: ResumableStage,
        reason: String,
    },

    #[error("upgrade proposal for '{upgrade_name}' was rejected on-chain")]
    ProposalRejected { upgrade_name: String },

    #[error("pre-upgrade state export failed: {reason}")]
    ExportFailed { reason: String },

    #[error("an upgrade request (name and version) is required to {action}")]
    MissingRequest { action: &'static str },

    #[error("Lock error: {reason}")]
    LockError { reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl UpgradeError {
    /// Corruption needs `--clear-state`, not a retry
    pub fn is_corruption(&self) -> bool {
        matches!(self, UpgradeError::StateCorruption { .. })
    }
}
