// devnet-builder library
// Exposes the upgrade orchestrator and its adapters for the binary and for tests

pub mod cli;
pub mod config;
pub mod external;
pub mod shutdown;
pub mod telemetry;
pub mod upgrade;

// Re-export key types for easy access
pub use config::{config, DevnetBuilderConfig};
pub use shutdown::{CancelSignal, ShutdownCoordinator};
pub use telemetry::{create_upgrade_span, generate_correlation_id, init_telemetry};
pub use upgrade::{
    FileStateManager, ResumableOrchestrator, ResumableStage, ResumeController, ResumeOptions,
    StateManager, UpgradeError, UpgradeOutcome, UpgradeRequest, UpgradeState,
};
