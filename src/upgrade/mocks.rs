// Mock implementations for testing - no side effects

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::errors::UpgradeError;
use super::persistence::StateManager;
use super::state::{
    ExecutionMode, NodeSwitch, ResumableStage, UpgradeRequest, UpgradeState, STATE_SCHEMA_VERSION,
};
use super::traits::*;

pub fn governance_request() -> UpgradeRequest {
    UpgradeRequest {
        upgrade_name: "v2-upgrade".to_string(),
        target_version: "v2.0.0".to_string(),
        target_binary: Some("/opt/bin/stabled-v2".to_string()),
        target_image: None,
        mode: ExecutionMode::Local,
        skip_governance: false,
    }
}

pub fn skip_governance_request() -> UpgradeRequest {
    UpgradeRequest {
        skip_governance: true,
        ..governance_request()
    }
}

pub fn switch_record(node_name: &str, switched: bool) -> NodeSwitch {
    NodeSwitch {
        node_name: node_name.to_string(),
        switched,
        stopped: true,
        started: switched,
        old_binary: "stabled-v1".to_string(),
        new_binary: "stabled-v2".to_string(),
        timestamp: Utc::now(),
    }
}

/// Chain RPC that replays scripted heights; the last height repeats forever
#[derive(Debug, Default)]
pub struct MockChainRpc {
    heights: Mutex<VecDeque<u64>>,
    last_height: Mutex<Option<u64>>,
    unreachable: bool,
    proposal_statuses: Mutex<HashMap<u64, String>>,
    height_calls: AtomicUsize,
}

impl MockChainRpc {
    pub fn with_heights(heights: Vec<u64>) -> Self {
        Self {
            heights: Mutex::new(heights.into()),
            ..Default::default()
        }
    }

    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Default::default()
        }
    }

    pub fn push_heights(&self, heights: impl IntoIterator<Item = u64>) {
        self.heights.lock().unwrap().extend(heights);
    }

    pub fn set_proposal_status(&self, proposal_id: u64, status: &str) {
        self.proposal_statuses
            .lock()
            .unwrap()
            .insert(proposal_id, status.to_string());
    }

    pub fn height_calls(&self) -> usize {
        self.height_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainRpc for MockChainRpc {
    async fn block_height(&self) -> Result<u64> {
        self.height_calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable {
            return Err(anyhow!("connection refused"));
        }

        let mut last = self.last_height.lock().unwrap();
        if let Some(next) = self.heights.lock().unwrap().pop_front() {
            *last = Some(next);
        }
        last.ok_or_else(|| anyhow!("no height scripted"))
    }

    async fn proposal_status(&self, proposal_id: u64) -> Result<String> {
        if self.unreachable {
            return Err(anyhow!("connection refused"));
        }
        self.proposal_statuses
            .lock()
            .unwrap()
            .get(&proposal_id)
            .cloned()
            .ok_or_else(|| anyhow!("proposal {proposal_id} not found"))
    }
}

#[derive(Debug)]
pub struct MockProposeStep {
    outcome: ProposalOutcome,
    failure: Option<String>,
    calls: AtomicUsize,
}

impl MockProposeStep {
    pub fn new(proposal_id: u64, upgrade_height: u64) -> Self {
        Self {
            outcome: ProposalOutcome {
                proposal_id,
                upgrade_height,
            },
            failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::new(0, 0)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProposeStep for MockProposeStep {
    async fn submit_proposal(&self, _state: &UpgradeState) -> Result<ProposalOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.failure {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(self.outcome.clone()),
        }
    }
}

/// Votes "yes" for every validator except the ones marked as refusing
#[derive(Debug)]
pub struct MockVoteStep {
    validators: Vec<String>,
    refusing: Mutex<Vec<String>>,
    skips_seen: Mutex<Vec<Vec<String>>>,
}

impl MockVoteStep {
    pub fn new(validator_count: usize) -> Self {
        Self {
            validators: (0..validator_count)
                .map(|i| format!("stablevaloper1val{i}"))
                .collect(),
            refusing: Mutex::new(Vec::new()),
            skips_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn refuse(&self, address: &str) {
        self.refusing.lock().unwrap().push(address.to_string());
    }

    pub fn allow_all(&self) {
        self.refusing.lock().unwrap().clear();
    }

    pub fn calls(&self) -> usize {
        self.skips_seen.lock().unwrap().len()
    }

    pub fn skips_seen(&self) -> Vec<Vec<String>> {
        self.skips_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl VoteStep for MockVoteStep {
    async fn cast_votes(&self, _proposal_id: u64, skip_addresses: &[String]) -> Result<VoteOutcome> {
        self.skips_seen.lock().unwrap().push(skip_addresses.to_vec());
        let refusing = self.refusing.lock().unwrap().clone();

        let votes: Vec<CastVote> = self
            .validators
            .iter()
            .enumerate()
            .filter(|(_, address)| !skip_addresses.contains(address) && !refusing.contains(address))
            .map(|(i, address)| CastVote {
                address: address.clone(),
                moniker: format!("validator-{i}"),
                tx_hash: Some(format!("TX{i:04}")),
            })
            .collect();

        Ok(VoteOutcome {
            votes_cast: votes.len() as u32,
            total_voters: self.validators.len() as u32,
            tx_hashes: votes.iter().filter_map(|v| v.tx_hash.clone()).collect(),
            votes,
        })
    }
}

/// Restarts every node except the ones marked as broken
#[derive(Debug)]
pub struct MockSwitchStep {
    nodes: Vec<String>,
    broken: Mutex<Vec<String>>,
    failure: Option<String>,
    skips_seen: Mutex<Vec<Vec<String>>>,
}

impl MockSwitchStep {
    pub fn new(node_count: usize) -> Self {
        Self {
            nodes: (0..node_count).map(|i| format!("node{i}")).collect(),
            broken: Mutex::new(Vec::new()),
            failure: None,
            skips_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::new(0)
        }
    }

    pub fn break_node(&self, node_name: &str) {
        self.broken.lock().unwrap().push(node_name.to_string());
    }

    pub fn repair_all(&self) {
        self.broken.lock().unwrap().clear();
    }

    pub fn calls(&self) -> usize {
        self.skips_seen.lock().unwrap().len()
    }

    pub fn skips_seen(&self) -> Vec<Vec<String>> {
        self.skips_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl SwitchBinaryStep for MockSwitchStep {
    async fn switch_binary(&self, state: &UpgradeState, skip_nodes: &[String]) -> Result<SwitchOutcome> {
        self.skips_seen.lock().unwrap().push(skip_nodes.to_vec());
        if let Some(message) = &self.failure {
            return Err(anyhow!(message.clone()));
        }
        let broken = self.broken.lock().unwrap().clone();

        let nodes: Vec<NodeRestart> = self
            .nodes
            .iter()
            .filter(|node| !skip_nodes.contains(node))
            .map(|node| NodeRestart {
                node_name: node.clone(),
                stopped: true,
                started: !broken.contains(node),
            })
            .collect();

        Ok(SwitchOutcome {
            old_binary: "stabled-v1".to_string(),
            new_binary: state.target_artifact().to_string(),
            nodes_restarted: nodes.iter().filter(|n| n.started).count() as u32,
            nodes,
        })
    }
}

#[derive(Debug, Default)]
pub struct MockExportStep {
    failing_phase: Option<ExportPhase>,
    phases: Mutex<Vec<ExportPhase>>,
}

impl MockExportStep {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(phase: ExportPhase) -> Self {
        Self {
            failing_phase: Some(phase),
            ..Default::default()
        }
    }

    pub fn phases(&self) -> Vec<ExportPhase> {
        self.phases.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExportStep for MockExportStep {
    async fn export_state(&self, _state: &UpgradeState, phase: ExportPhase) -> Result<String> {
        self.phases.lock().unwrap().push(phase);
        if self.failing_phase == Some(phase) {
            return Err(anyhow!("export of {phase} failed: disk full"));
        }
        Ok(format!("/tmp/exports/{phase}.json"))
    }
}

#[derive(Debug, Default)]
pub struct MockRecorder {
    versions: Mutex<Vec<String>>,
}

impl MockRecorder {
    pub fn versions(&self) -> Vec<String> {
        self.versions.lock().unwrap().clone()
    }
}

#[async_trait]
impl DevnetRecorder for MockRecorder {
    async fn record_version(&self, state: &UpgradeState) -> Result<()> {
        self.versions.lock().unwrap().push(state.target_version.clone());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingProgress {
    events: Mutex<Vec<HeightProgress>>,
}

impl RecordingProgress {
    pub fn events(&self) -> Vec<HeightProgress> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingProgress {
    fn height_progress(&self, progress: &HeightProgress) {
        self.events.lock().unwrap().push(progress.clone());
    }
}

/// In-memory state manager that remembers the stage of every save
#[derive(Debug)]
pub struct InMemoryStateManager {
    path: PathBuf,
    saved: Mutex<Option<UpgradeState>>,
    save_log: Mutex<Vec<ResumableStage>>,
    locked: Mutex<bool>,
}

impl Default for InMemoryStateManager {
    fn default() -> Self {
        Self {
            path: PathBuf::from("memory://upgrade-state.json"),
            saved: Mutex::new(None),
            save_log: Mutex::new(Vec::new()),
            locked: Mutex::new(false),
        }
    }
}

impl InMemoryStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a saved state as if a previous process had persisted it
    pub fn seeded(mut state: UpgradeState) -> Self {
        state.checksum = state.compute_checksum().expect("checksum");
        let manager = Self::default();
        *manager.saved.lock().unwrap() = Some(state);
        manager
    }

    pub fn saved(&self) -> Option<UpgradeState> {
        self.saved.lock().unwrap().clone()
    }

    pub fn save_log(&self) -> Vec<ResumableStage> {
        self.save_log.lock().unwrap().clone()
    }

    pub fn is_locked(&self) -> bool {
        *self.locked.lock().unwrap()
    }
}

#[async_trait]
impl StateManager for InMemoryStateManager {
    async fn load_state(&self) -> Result<Option<UpgradeState>, UpgradeError> {
        let saved = self.saved();
        if let Some(state) = &saved {
            self.validate_state(state)?;
        }
        Ok(saved)
    }

    async fn save_state(&self, state: &mut UpgradeState) -> Result<(), UpgradeError> {
        state.schema_version = STATE_SCHEMA_VERSION;
        state.checksum = state.compute_checksum()?;
        self.save_log.lock().unwrap().push(state.stage);
        *self.saved.lock().unwrap() = Some(state.clone());
        Ok(())
    }

    async fn delete_state(&self) -> Result<(), UpgradeError> {
        *self.saved.lock().unwrap() = None;
        Ok(())
    }

    async fn acquire_lock(&self) -> Result<(), UpgradeError> {
        let mut locked = self.locked.lock().unwrap();
        if *locked {
            let (upgrade_name, stage) = self
                .saved()
                .map(|s| (s.upgrade_name, s.stage.to_string()))
                .unwrap_or_else(|| ("unknown".to_string(), "unknown".to_string()));
            return Err(UpgradeError::UpgradeInProgress { upgrade_name, stage });
        }
        *locked = true;
        Ok(())
    }

    async fn release_lock(&self) -> Result<(), UpgradeError> {
        *self.locked.lock().unwrap() = false;
        Ok(())
    }

    fn validate_state(&self, state: &UpgradeState) -> Result<(), UpgradeError> {
        let corrupt = |reason: &str| UpgradeError::StateCorruption {
            path: self.path.clone(),
            reason: reason.to_string(),
        };
        if state.schema_version != STATE_SCHEMA_VERSION {
            return Err(corrupt("unsupported schema version"));
        }
        if state.compute_checksum()? != state.checksum {
            return Err(corrupt("checksum mismatch"));
        }
        Ok(())
    }

    fn state_path(&self) -> &Path {
        &self.path
    }
}
