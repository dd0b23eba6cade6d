// Upgrade stage detection - re-derives where an upgrade really is from the
// chain when the saved stage may be stale

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::state::{ResumableStage, UpgradeState};
use super::traits::ChainRpc;
use crate::shutdown::CancelSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    Running,
    Halted,
    Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Voting,
    Passed,
    Rejected,
    Failed,
    Unknown,
}

impl ProposalStatus {
    /// Map a gov module status (`PROPOSAL_STATUS_VOTING_PERIOD`, `voting_period`, ...)
    pub fn from_chain(raw: &str) -> Self {
        let normalized = raw.trim().to_ascii_uppercase();
        let normalized = normalized
            .strip_prefix("PROPOSAL_STATUS_")
            .unwrap_or(&normalized);

        match normalized {
            "DEPOSIT_PERIOD" => ProposalStatus::Pending,
            "VOTING_PERIOD" => ProposalStatus::Voting,
            "PASSED" => ProposalStatus::Passed,
            "REJECTED" => ProposalStatus::Rejected,
            "FAILED" => ProposalStatus::Failed,
            _ => ProposalStatus::Unknown,
        }
    }
}

/// Reconciles saved upgrade state against chain reality
#[async_trait]
pub trait StateDetector: Send + Sync {
    async fn detect_chain_status(&self) -> ChainStatus;

    async fn detect_proposal_status(&self, proposal_id: u64) -> Result<ProposalStatus>;

    /// Best guess of the real stage; the saved stage when detection fails
    async fn detect_current_stage(&self, state: &UpgradeState) -> ResumableStage;
}

/// Detector backed by live RPC queries
pub struct ChainStateDetector {
    rpc: Arc<dyn ChainRpc>,
    sample_window: Duration,
    rpc_timeout: Duration,
    cancel: CancelSignal,
}

impl ChainStateDetector {
    pub fn new(rpc: Arc<dyn ChainRpc>, sample_window: Duration, rpc_timeout: Duration) -> Self {
        Self {
            rpc,
            sample_window,
            rpc_timeout,
            cancel: CancelSignal::never(),
        }
    }

    /// Abort sampling (and treat the chain as unobservable) once `cancel` fires
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    async fn height(&self) -> Result<u64> {
        tokio::select! {
            _ = self.cancel.cancelled() => bail!("chain detection cancelled"),
            result = tokio::time::timeout(self.rpc_timeout, self.rpc.block_height()) => result
                .map_err(|_| anyhow!("block height query timed out after {:?}", self.rpc_timeout))?,
        }
    }

    async fn detect_skip_governance(&self, state: &UpgradeState) -> Result<ResumableStage> {
        if state.node_switches.is_empty() {
            return Ok(ResumableStage::Initialized);
        }
        if !state.all_nodes_switched() {
            return Ok(ResumableStage::SwitchingBinary);
        }

        match self.detect_chain_status().await {
            ChainStatus::Running => Ok(ResumableStage::VerifyingResume),
            _ => Ok(ResumableStage::SwitchingBinary),
        }
    }

    async fn detect_governance(&self, state: &UpgradeState) -> Result<ResumableStage> {
        let Some(proposal_id) = state.proposal_id else {
            return Ok(ResumableStage::Initialized);
        };

        match self.detect_proposal_status(proposal_id).await? {
            ProposalStatus::Pending => Ok(ResumableStage::ProposalSubmitted),
            ProposalStatus::Voting => Ok(ResumableStage::Voting),
            ProposalStatus::Rejected => Ok(ResumableStage::ProposalRejected),
            ProposalStatus::Failed => Ok(ResumableStage::Failed),
            ProposalStatus::Passed => self.detect_after_passing(state).await,
            ProposalStatus::Unknown => bail!("proposal {proposal_id} has an unrecognised status"),
        }
    }

    async fn detect_after_passing(&self, state: &UpgradeState) -> Result<ResumableStage> {
        let upgrade_height = state
            .upgrade_height
            .ok_or_else(|| anyhow!("proposal passed but no upgrade height is recorded"))?;

        if self.height().await? < upgrade_height {
            return Ok(ResumableStage::WaitingForHeight);
        }

        match self.detect_chain_status().await {
            ChainStatus::Halted => Ok(ResumableStage::ChainHalted),
            ChainStatus::Running if state.all_nodes_switched() => Ok(ResumableStage::VerifyingResume),
            ChainStatus::Running => Ok(ResumableStage::SwitchingBinary),
            ChainStatus::Unreachable => bail!("chain is unreachable"),
        }
    }
}

#[async_trait]
impl StateDetector for ChainStateDetector {
    async fn detect_chain_status(&self) -> ChainStatus {
        let first = match self.height().await {
            Ok(height) => height,
            Err(e) => {
                debug!(error = %e, "Chain status sample failed");
                return ChainStatus::Unreachable;
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!("Chain status sampling cancelled");
                return ChainStatus::Unreachable;
            }
            _ = tokio::time::sleep(self.sample_window) => {}
        }

        match self.height().await {
            Ok(second) if second > first => ChainStatus::Running,
            Ok(_) => ChainStatus::Halted,
            Err(e) => {
                debug!(error = %e, "Chain status sample failed");
                ChainStatus::Unreachable
            }
        }
    }

    async fn detect_proposal_status(&self, proposal_id: u64) -> Result<ProposalStatus> {
        let raw = tokio::time::timeout(self.rpc_timeout, self.rpc.proposal_status(proposal_id))
            .await
            .map_err(|_| anyhow!("proposal status query timed out after {:?}", self.rpc_timeout))??;
        Ok(ProposalStatus::from_chain(&raw))
    }

    async fn detect_current_stage(&self, state: &UpgradeState) -> ResumableStage {
        let detected = if state.skip_governance {
            self.detect_skip_governance(state).await
        } else {
            self.detect_governance(state).await
        };

        match detected {
            Ok(stage) => {
                if stage != state.stage {
                    info!(
                        upgrade = %state.upgrade_name,
                        saved = %state.stage,
                        detected = %stage,
                        "Saved stage differs from chain state"
                    );
                }
                stage
            }
            Err(e) => {
                warn!(
                    upgrade = %state.upgrade_name,
                    saved = %state.stage,
                    error = %e,
                    "Stage detection failed, keeping saved stage"
                );
                state.stage
            }
        }
    }
}
