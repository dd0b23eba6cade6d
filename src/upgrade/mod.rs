// Resumable chain software upgrades for a devnet

pub mod detector;
pub mod errors;
pub mod orchestrator;
pub mod persistence;
pub mod resume;
pub mod state;
pub mod traits;
pub mod transitions;

#[cfg(test)]
pub mod mocks;


pub use detector::{ChainStateDetector, ChainStatus, ProposalStatus, StateDetector};
pub use errors::UpgradeError;
pub use orchestrator::{ResumableOrchestrator, UpgradeCollaborators, UpgradeOutcome, UpgradeTimings};
pub use persistence::{FileStateManager, StateManager, LOCK_FILE_NAME, STATE_FILE_NAME};
pub use resume::{Reconciliation, ResumeAction, ResumeController, ResumeOptions, ResumeReport};
pub use state::{
    ExecutionMode, NodeSwitch, ResumableStage, StageTransitionRecord, UpgradeRequest, UpgradeState,
    ValidatorVote,
};
pub use traits::{
    CastVote, ChainRpc, DevnetRecorder, ExportPhase, ExportStep, HeightProgress, LogProgress,
    NodeRestart, ProgressSink, ProposalOutcome, ProposeStep, SwitchBinaryStep, SwitchOutcome,
    VoteOutcome, VoteStep,
};
pub use transitions::{StageTransitioner, StateTransitioner};
