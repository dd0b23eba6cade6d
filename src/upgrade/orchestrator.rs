//! Resumable upgrade orchestrator.
//!
//! Runs the remaining stages of an upgrade in graph order starting from
//! whatever stage the state is in. Every stage handler performs its side
//! effect once and returns the next stage; the orchestrator records the
//! transition and persists before the next handler runs, so a crash can only
//! ever resume from the last fully completed stage.

use anyhow::Error as AnyError;
use chrono::Utc;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::detector::ProposalStatus;
use super::errors::UpgradeError;
use super::persistence::StateManager;
use super::state::{NodeSwitch, ResumableStage, UpgradeState, ValidatorVote};
use super::traits::*;
use super::transitions::StateTransitioner;
use crate::config::UpgradeConfig;
use crate::shutdown::CancelSignal;

/// Poll cadence and deadlines for the blocking stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeTimings {
    pub poll_interval: Duration,
    pub rpc_timeout: Duration,
    pub halt_timeout: Duration,
    pub halt_samples: u32,
    pub max_blocks_past_height: u64,
    pub resume_timeout: Duration,
    pub resume_advances: u32,
}

impl Default for UpgradeTimings {
    fn default() -> Self {
        Self::from(&UpgradeConfig::default())
    }
}

impl From<&UpgradeConfig> for UpgradeTimings {
    fn from(config: &UpgradeConfig) -> Self {
        Self {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            rpc_timeout: Duration::from_secs(config.rpc_timeout_secs),
            halt_timeout: Duration::from_secs(config.halt_timeout_secs),
            halt_samples: config.halt_samples.max(1),
            max_blocks_past_height: config.max_blocks_past_height,
            resume_timeout: Duration::from_secs(config.resume_timeout_secs),
            resume_advances: config.resume_advances.max(1),
        }
    }
}

/// External steps and queries the orchestrator drives
#[derive(Clone)]
pub struct UpgradeCollaborators {
    pub rpc: Arc<dyn ChainRpc>,
    pub propose: Arc<dyn ProposeStep>,
    pub vote: Arc<dyn VoteStep>,
    pub switch: Arc<dyn SwitchBinaryStep>,
    pub export: Option<Arc<dyn ExportStep>>,
    pub recorder: Arc<dyn DevnetRecorder>,
    pub progress: Arc<dyn ProgressSink>,
}

/// Final (or paused) result of an upgrade run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeOutcome {
    pub success: bool,
    pub upgrade_name: String,
    pub final_stage: ResumableStage,
    pub new_version: String,
    pub summary: String,
}

impl UpgradeOutcome {
    pub fn from_state(state: &UpgradeState) -> Self {
        let summary = match state.stage {
            ResumableStage::Completed => "upgrade completed successfully".to_string(),
            ResumableStage::Failed => format!(
                "upgrade failed: {}; fix the cause and start over with --force-restart or discard the state with --clear-state",
                state.error
            ),
            ResumableStage::ProposalRejected => {
                "upgrade proposal was rejected on-chain; start over with --force-restart".to_string()
            }
            stage => format!("upgrade paused at stage {stage}; run resume to continue"),
        };

        Self {
            success: state.stage == ResumableStage::Completed,
            upgrade_name: state.upgrade_name.clone(),
            final_stage: state.stage,
            new_version: state.target_version.clone(),
            summary,
        }
    }
}

#[derive(Debug)]
enum StageError {
    /// Wait aborted by the cancellation signal; nothing is recorded
    Cancelled,
    /// Fatal to the stage; recorded as `Failed`
    Failed(String),
    /// Persistence or bookkeeping error; propagated untouched
    State(UpgradeError),
}

impl From<UpgradeError> for StageError {
    fn from(err: UpgradeError) -> Self {
        StageError::State(err)
    }
}

fn step_failed(action: &'static str) -> impl FnOnce(AnyError) -> StageError {
    move |e| StageError::Failed(format!("failed to {action}: {e:#}"))
}

struct Advance {
    next: ResumableStage,
    reason: String,
}

impl Advance {
    fn to(next: ResumableStage, reason: impl Into<String>) -> Self {
        Self {
            next,
            reason: reason.into(),
        }
    }
}

pub struct ResumableOrchestrator {
    state_manager: Arc<dyn StateManager>,
    transitioner: Arc<dyn StateTransitioner>,
    collaborators: UpgradeCollaborators,
    timings: UpgradeTimings,
    cancel: CancelSignal,
}

impl ResumableOrchestrator {
    pub fn new(
        state_manager: Arc<dyn StateManager>,
        transitioner: Arc<dyn StateTransitioner>,
        collaborators: UpgradeCollaborators,
        timings: UpgradeTimings,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            state_manager,
            transitioner,
            collaborators,
            timings,
            cancel,
        }
    }

    /// Run every remaining stage of `state`, persisting after each transition
    pub async fn execute(&self, state: &mut UpgradeState) -> Result<UpgradeOutcome, UpgradeError> {
        info!(
            upgrade = %state.upgrade_name,
            stage = %state.stage,
            skip_governance = state.skip_governance,
            mode = %state.mode,
            "Executing upgrade"
        );

        if state.is_fresh() {
            self.run_pre_export(state).await?;
        }

        while !state.stage.is_terminal() {
            let stage = state.stage;
            if self.cancel.is_cancelled() {
                return Err(UpgradeError::Cancelled { stage });
            }

            match self.run_stage(state).await {
                Ok(advance) => {
                    self.transitioner
                        .transition_to(state, advance.next, &advance.reason)?;
                    self.state_manager.save_state(state).await?;
                }
                Err(StageError::Cancelled) => {
                    warn!(upgrade = %state.upgrade_name, stage = %stage, "Upgrade cancelled");
                    return Err(UpgradeError::Cancelled { stage });
                }
                Err(StageError::State(e)) => return Err(e),
                Err(StageError::Failed(reason)) => {
                    error!(
                        upgrade = %state.upgrade_name,
                        stage = %stage,
                        reason = %reason,
                        "Upgrade stage failed"
                    );
                    self.transitioner
                        .transition_to(state, ResumableStage::Failed, &reason)?;
                    self.state_manager.save_state(state).await?;
                    return Err(UpgradeError::StageFailed { stage, reason });
                }
            }
        }

        self.finish(state).await
    }

    async fn finish(&self, state: &mut UpgradeState) -> Result<UpgradeOutcome, UpgradeError> {
        match state.stage {
            ResumableStage::Completed => {
                if let Err(e) = self.collaborators.recorder.record_version(state).await {
                    warn!(
                        upgrade = %state.upgrade_name,
                        error = %e,
                        "Failed to record new version on the devnet"
                    );
                }
                self.state_manager.delete_state().await?;
                info!(
                    upgrade = %state.upgrade_name,
                    version = %state.target_version,
                    "Upgrade completed"
                );
                Ok(UpgradeOutcome::from_state(state))
            }
            ResumableStage::ProposalRejected => Err(UpgradeError::ProposalRejected {
                upgrade_name: state.upgrade_name.clone(),
            }),
            _ => Err(UpgradeError::StageFailed {
                stage: state
                    .stage_history
                    .last()
                    .map(|record| record.from)
                    .unwrap_or(state.stage),
                reason: state.error.clone(),
            }),
        }
    }

    async fn run_pre_export(&self, state: &mut UpgradeState) -> Result<(), UpgradeError> {
        let Some(export) = &self.collaborators.export else {
            return Ok(());
        };

        let path = export
            .export_state(state, ExportPhase::PreUpgrade)
            .await
            .map_err(|e| UpgradeError::ExportFailed {
                reason: format!("{e:#}"),
            })?;

        info!(upgrade = %state.upgrade_name, path = %path, "Pre-upgrade state exported");
        state.pre_export_path = Some(path);
        state.updated_at = Utc::now();
        self.state_manager.save_state(state).await
    }

    async fn run_stage(&self, state: &mut UpgradeState) -> Result<Advance, StageError> {
        if state.skip_governance && state.stage.is_governance_only() {
            return Err(StageError::Failed(format!(
                "stage {} requires governance but this upgrade skips it",
                state.stage
            )));
        }

        match state.stage {
            ResumableStage::Initialized => Ok(self.route_from_initialized(state)),
            ResumableStage::ProposalSubmitted => self.submit_proposal(state).await,
            ResumableStage::Voting => self.cast_votes(state).await,
            ResumableStage::WaitingForHeight => self.await_upgrade_height(state).await,
            ResumableStage::ChainHalted => self.await_chain_halt(state).await,
            ResumableStage::SwitchingBinary => self.switch_binaries(state).await,
            ResumableStage::VerifyingResume => self.verify_resume(state).await,
            terminal => Err(StageError::Failed(format!("stage {terminal} has no handler"))),
        }
    }

    fn route_from_initialized(&self, state: &UpgradeState) -> Advance {
        if state.skip_governance {
            Advance::to(
                ResumableStage::SwitchingBinary,
                "governance skipped, switching binaries directly",
            )
        } else {
            Advance::to(ResumableStage::ProposalSubmitted, "submitting upgrade proposal")
        }
    }

    async fn submit_proposal(&self, state: &mut UpgradeState) -> Result<Advance, StageError> {
        if let Some(proposal_id) = state.proposal_id {
            info!(proposal_id, "Proposal already recorded, not resubmitting");
            return Ok(Advance::to(
                ResumableStage::Voting,
                format!("proposal {proposal_id} already submitted"),
            ));
        }

        let outcome = self
            .collaborators
            .propose
            .submit_proposal(state)
            .await
            .map_err(step_failed("submit upgrade proposal"))?;

        state.proposal_id = Some(outcome.proposal_id);
        state.upgrade_height = Some(outcome.upgrade_height);
        state.updated_at = Utc::now();
        // The proposal exists on-chain now; record it before anything else can fail
        self.state_manager.save_state(state).await?;

        Ok(Advance::to(
            ResumableStage::Voting,
            format!(
                "proposal {} submitted for upgrade height {}",
                outcome.proposal_id, outcome.upgrade_height
            ),
        ))
    }

    async fn cast_votes(&self, state: &mut UpgradeState) -> Result<Advance, StageError> {
        let proposal_id = state
            .proposal_id
            .ok_or_else(|| StageError::Failed("no proposal ID recorded, cannot vote".to_string()))?;

        let status = self
            .rpc_call(self.collaborators.rpc.proposal_status(proposal_id))
            .await?
            .map(|raw| ProposalStatus::from_chain(&raw));
        match status {
            Some(ProposalStatus::Rejected) => {
                return Ok(Advance::to(
                    ResumableStage::ProposalRejected,
                    format!("proposal {proposal_id} was rejected on-chain"),
                ));
            }
            Some(ProposalStatus::Failed) => {
                return Err(StageError::Failed(format!(
                    "proposal {proposal_id} failed on-chain"
                )));
            }
            _ => {}
        }

        let already_voted = state.voted_addresses();
        let outcome = self
            .collaborators
            .vote
            .cast_votes(proposal_id, &already_voted)
            .await
            .map_err(step_failed("cast validator votes"))?;

        let total_voters = outcome.total_voters;
        let cast_now = outcome.votes.len();
        let now = Utc::now();
        for vote in outcome.votes {
            state.upsert_vote(ValidatorVote {
                address: vote.address,
                moniker: vote.moniker,
                voted: true,
                tx_hash: vote.tx_hash,
                timestamp: now,
            });
        }
        if cast_now > 0 {
            self.state_manager.save_state(state).await?;
        }

        let voted = state.voted_addresses().len() as u32;
        info!(
            proposal_id,
            cast_now,
            previously_recorded = already_voted.len(),
            voted,
            total_voters,
            "Validator votes recorded"
        );

        if total_voters == 0 || voted < total_voters {
            return Err(StageError::Failed(format!(
                "only {voted} of {total_voters} validators voted on proposal {proposal_id}"
            )));
        }

        Ok(Advance::to(
            ResumableStage::WaitingForHeight,
            format!("{voted}/{total_voters} validators voted yes on proposal {proposal_id}"),
        ))
    }

    async fn await_upgrade_height(&self, state: &UpgradeState) -> Result<Advance, StageError> {
        let target = upgrade_height(state)?;
        let height = self.wait_for_height(target).await?;
        Ok(Advance::to(
            ResumableStage::ChainHalted,
            format!("reached upgrade height {target} (observed {height})"),
        ))
    }

    async fn await_chain_halt(&self, state: &UpgradeState) -> Result<Advance, StageError> {
        let target = upgrade_height(state)?;
        let height = self.wait_for_chain_halt(target).await?;
        Ok(Advance::to(
            ResumableStage::SwitchingBinary,
            format!("chain halted at height {height}"),
        ))
    }

    async fn switch_binaries(&self, state: &mut UpgradeState) -> Result<Advance, StageError> {
        let already_switched = state.switched_nodes();
        let outcome = self
            .collaborators
            .switch
            .switch_binary(state, &already_switched)
            .await
            .map_err(step_failed("switch node binaries"))?;

        let now = Utc::now();
        for node in &outcome.nodes {
            state.upsert_node_switch(NodeSwitch {
                node_name: node.node_name.clone(),
                switched: node.stopped && node.started,
                stopped: node.stopped,
                started: node.started,
                old_binary: outcome.old_binary.clone(),
                new_binary: outcome.new_binary.clone(),
                timestamp: now,
            });
        }
        if !outcome.nodes.is_empty() {
            self.state_manager.save_state(state).await?;
        }

        info!(
            old_binary = %outcome.old_binary,
            new_binary = %outcome.new_binary,
            nodes_restarted = outcome.nodes_restarted,
            previously_switched = already_switched.len(),
            "Node binaries switched"
        );

        if state.node_switches.is_empty() {
            return Err(StageError::Failed(
                "binary switch did not report any nodes".to_string(),
            ));
        }

        let pending: Vec<&str> = state
            .node_switches
            .iter()
            .filter(|switch| !switch.switched)
            .map(|switch| switch.node_name.as_str())
            .collect();
        if !pending.is_empty() {
            return Err(StageError::Failed(format!(
                "nodes did not restart on {}: {}",
                outcome.new_binary,
                pending.join(", ")
            )));
        }

        Ok(Advance::to(
            ResumableStage::VerifyingResume,
            format!(
                "{} nodes running {}",
                state.node_switches.len(),
                outcome.new_binary
            ),
        ))
    }

    async fn verify_resume(&self, state: &mut UpgradeState) -> Result<Advance, StageError> {
        let height = self.wait_for_resume().await?;

        if let Some(export) = &self.collaborators.export {
            match export.export_state(state, ExportPhase::PostUpgrade).await {
                Ok(path) => {
                    info!(upgrade = %state.upgrade_name, path = %path, "Post-upgrade state exported");
                    state.post_export_path = Some(path);
                }
                Err(e) => warn!(
                    upgrade = %state.upgrade_name,
                    error = %e,
                    "Post-upgrade export failed, continuing"
                ),
            }
        }

        Ok(Advance::to(
            ResumableStage::Completed,
            format!("chain producing blocks on the new binary at height {height}"),
        ))
    }

    /// Block until the chain reaches `target`; no deadline, cancellable
    async fn wait_for_height(&self, target: u64) -> Result<u64, StageError> {
        let mut first_sample: Option<(Instant, u64)> = None;

        loop {
            if self.cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }

            if let Some(height) = self.sample_height().await? {
                if height >= target {
                    return Ok(height);
                }

                let now = Instant::now();
                let (start, start_height) = *first_sample.get_or_insert((now, height));
                let elapsed = now.duration_since(start).as_secs_f64();
                let blocks_per_second = (elapsed > 0.0 && height > start_height)
                    .then(|| (height - start_height) as f64 / elapsed);
                let eta = blocks_per_second
                    .and_then(|rate| Duration::try_from_secs_f64((target - height) as f64 / rate).ok());

                self.collaborators.progress.height_progress(&HeightProgress {
                    current: height,
                    target,
                    blocks_per_second,
                    eta,
                });
            }

            self.pause().await?;
        }
    }

    /// Block until the height stops moving at or after `target`
    async fn wait_for_chain_halt(&self, target: u64) -> Result<u64, StageError> {
        let deadline = Instant::now() + self.timings.halt_timeout;
        let limit = target.saturating_add(self.timings.max_blocks_past_height);
        let mut last_height: Option<u64> = None;
        let mut unchanged_samples = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(StageError::Failed(format!(
                    "timed out after {:?} waiting for the chain to halt at height {target}",
                    self.timings.halt_timeout
                )));
            }

            if let Some(height) = self.sample_height().await? {
                if height > limit {
                    return Err(StageError::Failed(format!(
                        "chain reached height {height}, more than {} blocks past upgrade height {target}, \
                         without halting; the upgrade proposal may have failed or been rejected",
                        self.timings.max_blocks_past_height
                    )));
                }

                if height >= target {
                    if last_height == Some(height) {
                        unchanged_samples += 1;
                    } else {
                        last_height = Some(height);
                        unchanged_samples = 1;
                    }
                    debug!(height, unchanged_samples, "Halt sample");

                    if unchanged_samples >= self.timings.halt_samples {
                        return Ok(height);
                    }
                } else {
                    last_height = None;
                    unchanged_samples = 0;
                }
            }

            self.pause().await?;
        }
    }

    /// Block until the height advances `resume_advances` times in a row
    async fn wait_for_resume(&self) -> Result<u64, StageError> {
        let deadline = Instant::now() + self.timings.resume_timeout;
        let mut last_height: Option<u64> = None;
        let mut advances = 0u32;

        loop {
            if self.cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }
            if Instant::now() >= deadline {
                return Err(StageError::Failed(format!(
                    "chain did not resume block production within {:?}",
                    self.timings.resume_timeout
                )));
            }

            if let Some(height) = self.sample_height().await? {
                match last_height {
                    Some(previous) if height > previous => advances += 1,
                    Some(_) => advances = 0,
                    None => {}
                }
                last_height = Some(height);
                debug!(height, advances, "Resume sample");

                if advances >= self.timings.resume_advances {
                    return Ok(height);
                }
            }

            self.pause().await?;
        }
    }

    async fn sample_height(&self) -> Result<Option<u64>, StageError> {
        self.rpc_call(self.collaborators.rpc.block_height()).await
    }

    /// One independently timed RPC call; failures are transient (`Ok(None)`)
    async fn rpc_call<T, F>(&self, call: F) -> Result<Option<T>, StageError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(StageError::Cancelled),
            result = tokio::time::timeout(self.timings.rpc_timeout, call) => match result {
                Ok(Ok(value)) => Ok(Some(value)),
                Ok(Err(e)) => {
                    debug!(error = %e, "RPC query failed, will retry");
                    Ok(None)
                }
                Err(_) => {
                    debug!(timeout = ?self.timings.rpc_timeout, "RPC query timed out, will retry");
                    Ok(None)
                }
            },
        }
    }

    async fn pause(&self) -> Result<(), StageError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(StageError::Cancelled),
            _ = tokio::time::sleep(self.timings.poll_interval) => Ok(()),
        }
    }
}

fn upgrade_height(state: &UpgradeState) -> Result<u64, StageError> {
    state
        .upgrade_height
        .ok_or_else(|| StageError::Failed("no upgrade height recorded".to_string()))
}
