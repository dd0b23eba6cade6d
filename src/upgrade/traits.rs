// Collaborator interfaces - the orchestrator only talks to the chain and the
// devnet through these, so tests can swap in in-memory fakes

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use super::state::UpgradeState;

/// Read-only chain queries
#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Latest committed block height
    async fn block_height(&self) -> Result<u64>;

    /// Raw on-chain status string for a governance proposal
    async fn proposal_status(&self, proposal_id: u64) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalOutcome {
    #[serde(rename = "proposalID")]
    pub proposal_id: u64,
    pub upgrade_height: u64,
}

/// Submits the software-upgrade proposal
#[async_trait]
pub trait ProposeStep: Send + Sync {
    async fn submit_proposal(&self, state: &UpgradeState) -> Result<ProposalOutcome>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CastVote {
    pub address: String,
    #[serde(default)]
    pub moniker: String,
    pub tx_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteOutcome {
    pub votes_cast: u32,
    pub total_voters: u32,
    #[serde(default)]
    pub tx_hashes: Vec<String>,
    #[serde(default)]
    pub votes: Vec<CastVote>,
}

/// Casts "yes" votes from the devnet's validators
#[async_trait]
pub trait VoteStep: Send + Sync {
    /// Validators in `skip_addresses` already have a recorded vote
    async fn cast_votes(&self, proposal_id: u64, skip_addresses: &[String]) -> Result<VoteOutcome>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRestart {
    pub node_name: String,
    pub stopped: bool,
    pub started: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchOutcome {
    pub old_binary: String,
    pub new_binary: String,
    pub nodes_restarted: u32,
    #[serde(default)]
    pub nodes: Vec<NodeRestart>,
}

/// Stops every node, swaps its binary or image and starts it again
#[async_trait]
pub trait SwitchBinaryStep: Send + Sync {
    /// Nodes in `skip_nodes` are already running the new binary
    async fn switch_binary(&self, state: &UpgradeState, skip_nodes: &[String]) -> Result<SwitchOutcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportPhase {
    PreUpgrade,
    PostUpgrade,
}

impl std::fmt::Display for ExportPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportPhase::PreUpgrade => f.write_str("pre_upgrade"),
            ExportPhase::PostUpgrade => f.write_str("post_upgrade"),
        }
    }
}

/// Optional chain state export around the upgrade
#[async_trait]
pub trait ExportStep: Send + Sync {
    /// Returns the path of the produced export
    async fn export_state(&self, state: &UpgradeState, phase: ExportPhase) -> Result<String>;
}

/// Records the upgraded version in the devnet's own metadata
#[async_trait]
pub trait DevnetRecorder: Send + Sync {
    async fn record_version(&self, state: &UpgradeState) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeightProgress {
    pub current: u64,
    pub target: u64,
    pub blocks_per_second: Option<f64>,
    pub eta: Option<Duration>,
}

/// Presentation of progress while waiting for the upgrade height
pub trait ProgressSink: Send + Sync {
    fn height_progress(&self, progress: &HeightProgress);
}

/// Default sink: structured log lines
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn height_progress(&self, progress: &HeightProgress) {
        info!(
            current = progress.current,
            target = progress.target,
            remaining = progress.target.saturating_sub(progress.current),
            blocks_per_second = ?progress.blocks_per_second,
            eta_secs = ?progress.eta.map(|eta| eta.as_secs()),
            "Waiting for upgrade height"
        );
    }
}
