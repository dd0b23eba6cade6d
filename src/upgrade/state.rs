//! Upgrade state document and the resumable stage graph.
//!
//! `UpgradeState` is the single durable record of an in-flight upgrade. It is
//! persisted after every stage transition, so everything needed to resume the
//! workflow after a crash has to live here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Schema version written into every saved state document
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Named points in the upgrade state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumableStage {
    Initialized,
    ProposalSubmitted,
    Voting,
    WaitingForHeight,
    ChainHalted,
    SwitchingBinary,
    VerifyingResume,
    Completed,
    Failed,
    ProposalRejected,
}

impl ResumableStage {
    pub const ALL: [ResumableStage; 10] = [
        ResumableStage::Initialized,
        ResumableStage::ProposalSubmitted,
        ResumableStage::Voting,
        ResumableStage::WaitingForHeight,
        ResumableStage::ChainHalted,
        ResumableStage::SwitchingBinary,
        ResumableStage::VerifyingResume,
        ResumableStage::Completed,
        ResumableStage::Failed,
        ResumableStage::ProposalRejected,
    ];

    /// Stages reachable from this one in a single transition
    pub fn valid_transitions(self) -> &'static [ResumableStage] {
        use ResumableStage::*;
        match self {
            Initialized => &[ProposalSubmitted, SwitchingBinary, Failed],
            ProposalSubmitted => &[Voting, ProposalRejected, Failed],
            Voting => &[WaitingForHeight, ProposalRejected, Failed],
            WaitingForHeight => &[ChainHalted, Failed],
            ChainHalted => &[SwitchingBinary, Failed],
            SwitchingBinary => &[VerifyingResume, Failed],
            VerifyingResume => &[Completed, Failed],
            Completed | Failed | ProposalRejected => &[],
        }
    }

    pub fn can_transition_to(self, target: ResumableStage) -> bool {
        self.valid_transitions().contains(&target)
    }

    pub fn is_terminal(self) -> bool {
        self.valid_transitions().is_empty()
    }

    /// Stages that only exist on the governance path
    pub fn is_governance_only(self) -> bool {
        matches!(
            self,
            ResumableStage::ProposalSubmitted
                | ResumableStage::Voting
                | ResumableStage::WaitingForHeight
                | ResumableStage::ChainHalted
                | ResumableStage::ProposalRejected
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResumableStage::Initialized => "initialized",
            ResumableStage::ProposalSubmitted => "proposal_submitted",
            ResumableStage::Voting => "voting",
            ResumableStage::WaitingForHeight => "waiting_for_height",
            ResumableStage::ChainHalted => "chain_halted",
            ResumableStage::SwitchingBinary => "switching_binary",
            ResumableStage::VerifyingResume => "verifying_resume",
            ResumableStage::Completed => "completed",
            ResumableStage::Failed => "failed",
            ResumableStage::ProposalRejected => "proposal_rejected",
        }
    }
}

impl fmt::Display for ResumableStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown upgrade stage '{0}'")]
pub struct ParseStageError(pub String);

impl FromStr for ResumableStage {
    type Err = ParseStageError;

    /// Accepts `waiting_for_height`, `waiting-for-height` and `WaitingForHeight`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();

        ResumableStage::ALL
            .into_iter()
            .find(|stage| stage.as_str().replace('_', "") == wanted)
            .ok_or_else(|| ParseStageError(s.to_string()))
    }
}

/// Where the devnet's nodes run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Local,
    Docker,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Local => f.write_str("local"),
            ExecutionMode::Docker => f.write_str("docker"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ValidatorVote {
    pub address: String,
    pub moniker: String,
    pub voted: bool,
    pub tx_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NodeSwitch {
    pub node_name: String,
    pub switched: bool,
    pub stopped: bool,
    pub started: bool,
    pub old_binary: String,
    pub new_binary: String,
    pub timestamp: DateTime<Utc>,
}

/// One entry of the append-only stage audit log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StageTransitionRecord {
    pub from: ResumableStage,
    pub to: ResumableStage,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
}

/// Operator parameters for starting a fresh upgrade
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub upgrade_name: String,
    pub target_version: String,
    pub target_binary: Option<String>,
    pub target_image: Option<String>,
    pub mode: ExecutionMode,
    pub skip_governance: bool,
}

/// Every save writes every field; unknown keys on load are corruption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpgradeState {
    pub schema_version: u32,
    pub checksum: String,
    pub upgrade_name: String,
    pub stage: ResumableStage,
    pub mode: ExecutionMode,
    pub skip_governance: bool,
    #[serde(rename = "proposalID")]
    pub proposal_id: Option<u64>,
    pub upgrade_height: Option<u64>,
    pub target_binary: Option<String>,
    pub target_image: Option<String>,
    pub target_version: String,
    pub validator_votes: Vec<ValidatorVote>,
    pub node_switches: Vec<NodeSwitch>,
    pub error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stage_history: Vec<StageTransitionRecord>,
    pub pre_export_path: Option<String>,
    pub post_export_path: Option<String>,
}

impl UpgradeState {
    pub fn new(request: &UpgradeRequest) -> Self {
        let now = Utc::now();
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            checksum: String::new(),
            upgrade_name: request.upgrade_name.clone(),
            stage: ResumableStage::Initialized,
            mode: request.mode,
            skip_governance: request.skip_governance,
            proposal_id: None,
            upgrade_height: None,
            target_binary: request.target_binary.clone(),
            target_image: request.target_image.clone(),
            target_version: request.target_version.clone(),
            validator_votes: Vec::new(),
            node_switches: Vec::new(),
            error: String::new(),
            created_at: now,
            updated_at: now,
            stage_history: Vec::new(),
            pre_export_path: None,
            post_export_path: None,
        }
    }

    /// True until the first stage transition or pre-upgrade export happens
    pub fn is_fresh(&self) -> bool {
        self.stage == ResumableStage::Initialized
            && self.stage_history.is_empty()
            && self.pre_export_path.is_none()
    }

    /// Binary or image the nodes are being moved to
    pub fn target_artifact(&self) -> &str {
        self.target_binary
            .as_deref()
            .or(self.target_image.as_deref())
            .unwrap_or(&self.target_version)
    }

    /// Insert or replace the vote record for `vote.address`
    pub fn upsert_vote(&mut self, vote: ValidatorVote) {
        match self
            .validator_votes
            .iter_mut()
            .find(|existing| existing.address == vote.address)
        {
            Some(existing) => *existing = vote,
            None => self.validator_votes.push(vote),
        }
        self.updated_at = Utc::now();
    }

    /// Insert or replace the switch record for `switch.node_name`
    pub fn upsert_node_switch(&mut self, switch: NodeSwitch) {
        match self
            .node_switches
            .iter_mut()
            .find(|existing| existing.node_name == switch.node_name)
        {
            Some(existing) => *existing = switch,
            None => self.node_switches.push(switch),
        }
        self.updated_at = Utc::now();
    }

    pub fn voted_addresses(&self) -> Vec<String> {
        self.validator_votes
            .iter()
            .filter(|vote| vote.voted)
            .map(|vote| vote.address.clone())
            .collect()
    }

    pub fn switched_nodes(&self) -> Vec<String> {
        self.node_switches
            .iter()
            .filter(|switch| switch.switched)
            .map(|switch| switch.node_name.clone())
            .collect()
    }

    pub fn all_nodes_switched(&self) -> bool {
        !self.node_switches.is_empty() && self.node_switches.iter().all(|s| s.switched)
    }

    /// `sha256:<hex>` over the compact serialization with `checksum` blanked
    pub fn compute_checksum(&self) -> Result<String, serde_json::Error> {
        let mut canonical = self.clone();
        canonical.checksum = String::new();
        let bytes = serde_json::to_vec(&canonical)?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("sha256:{:x}", hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(skip_governance: bool) -> UpgradeRequest {
        UpgradeRequest {
            upgrade_name: "v2-upgrade".to_string(),
            target_version: "v2.0.0".to_string(),
            target_binary: Some("/opt/bin/stabled-v2".to_string()),
            target_image: None,
            mode: ExecutionMode::Local,
            skip_governance,
        }
    }

    #[test]
    fn test_terminal_stages_have_no_edges() {
        for stage in ResumableStage::ALL {
            let terminal = matches!(
                stage,
                ResumableStage::Completed | ResumableStage::Failed | ResumableStage::ProposalRejected
            );
            assert_eq!(stage.is_terminal(), terminal, "{stage}");
        }
    }

    #[test]
    fn test_every_non_terminal_stage_can_fail() {
        for stage in ResumableStage::ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(stage.can_transition_to(ResumableStage::Failed), "{stage}");
        }
    }

    #[test]
    fn test_stage_parsing_accepts_common_spellings() {
        assert_eq!(
            "waiting_for_height".parse::<ResumableStage>().unwrap(),
            ResumableStage::WaitingForHeight
        );
        assert_eq!(
            "WaitingForHeight".parse::<ResumableStage>().unwrap(),
            ResumableStage::WaitingForHeight
        );
        assert_eq!(
            "chain-halted".parse::<ResumableStage>().unwrap(),
            ResumableStage::ChainHalted
        );
        assert!("halfway".parse::<ResumableStage>().is_err());
    }

    #[test]
    fn test_stage_display_matches_serde_name() {
        for stage in ResumableStage::ALL {
            let json = serde_json::to_string(&stage).unwrap();
            assert_eq!(json, format!("\"{}\"", stage));
        }
    }

    #[test]
    fn test_vote_upsert_replaces_by_address() {
        let mut state = UpgradeState::new(&request(false));
        let vote = |voted: bool, tx: Option<&str>| ValidatorVote {
            address: "stablevaloper1abc".to_string(),
            moniker: "validator-0".to_string(),
            voted,
            tx_hash: tx.map(str::to_string),
            timestamp: Utc::now(),
        };

        state.upsert_vote(vote(false, None));
        state.upsert_vote(vote(true, Some("ABCD")));

        assert_eq!(state.validator_votes.len(), 1);
        assert!(state.validator_votes[0].voted);
        assert_eq!(state.voted_addresses(), vec!["stablevaloper1abc".to_string()]);
    }

    #[test]
    fn test_node_switch_upsert_and_completion() {
        let mut state = UpgradeState::new(&request(true));
        assert!(!state.all_nodes_switched());

        for (name, switched) in [("node0", true), ("node1", false), ("node1", true)] {
            state.upsert_node_switch(NodeSwitch {
                node_name: name.to_string(),
                switched,
                stopped: true,
                started: switched,
                old_binary: "v1".to_string(),
                new_binary: "v2".to_string(),
                timestamp: Utc::now(),
            });
        }

        assert_eq!(state.node_switches.len(), 2);
        assert!(state.all_nodes_switched());
    }

    #[test]
    fn test_checksum_ignores_checksum_field() {
        let mut state = UpgradeState::new(&request(false));
        let first = state.compute_checksum().unwrap();
        state.checksum = first.clone();
        assert_eq!(state.compute_checksum().unwrap(), first);
        assert!(first.starts_with("sha256:"));

        state.upgrade_name.push('x');
        assert_ne!(state.compute_checksum().unwrap(), first);
    }
}
