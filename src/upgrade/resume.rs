//! Operator-facing entry point for starting, resuming and inspecting upgrades.
//!
//! Loads the saved state, reconciles it with the chain, and hands it to the
//! orchestrator. Every path that mutates the saved state or executes stages
//! runs under the per-devnet lock; status and dry-run reconciliation don't.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn, Instrument};

use super::detector::StateDetector;
use super::errors::UpgradeError;
use super::orchestrator::{ResumableOrchestrator, UpgradeOutcome};
use super::persistence::StateManager;
use super::state::{ResumableStage, UpgradeRequest, UpgradeState};
use super::transitions::StateTransitioner;
use crate::telemetry::{create_upgrade_span, generate_correlation_id};

/// Resume flags; when several are set the first in field order wins
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeOptions {
    pub clear_state: bool,
    pub show_status: bool,
    pub force_restart: bool,
    pub resume_from: Option<ResumableStage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeAction {
    NothingToResume,
    StateCleared,
    Status,
    TerminalReported,
    Executed,
    Reconciled,
}

/// Saved stage versus what the chain says
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reconciliation {
    pub saved_stage: ResumableStage,
    pub detected_stage: ResumableStage,
    /// Whether the saved state was moved to the detected stage
    pub applied: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeReport {
    pub action: ResumeAction,
    pub state: Option<UpgradeState>,
    pub reconciliation: Option<Reconciliation>,
    pub outcome: Option<UpgradeOutcome>,
    pub message: String,
}

impl ResumeReport {
    fn nothing_to_resume() -> Self {
        Self {
            action: ResumeAction::NothingToResume,
            state: None,
            reconciliation: None,
            outcome: None,
            message: "no upgrade in progress, nothing to resume".to_string(),
        }
    }

    fn terminal(state: UpgradeState) -> Self {
        let outcome = UpgradeOutcome::from_state(&state);
        Self {
            action: ResumeAction::TerminalReported,
            message: outcome.summary.clone(),
            state: Some(state),
            reconciliation: None,
            outcome: Some(outcome),
        }
    }
}

pub struct ResumeController {
    state_manager: Arc<dyn StateManager>,
    transitioner: Arc<dyn StateTransitioner>,
    detector: Arc<dyn StateDetector>,
    orchestrator: ResumableOrchestrator,
}

impl ResumeController {
    pub fn new(
        state_manager: Arc<dyn StateManager>,
        transitioner: Arc<dyn StateTransitioner>,
        detector: Arc<dyn StateDetector>,
        orchestrator: ResumableOrchestrator,
    ) -> Self {
        Self {
            state_manager,
            transitioner,
            detector,
            orchestrator,
        }
    }

    /// Begin a fresh upgrade; refuses while a non-terminal upgrade is saved
    pub async fn start(&self, request: &UpgradeRequest) -> Result<ResumeReport, UpgradeError> {
        self.with_lock(async {
            if let Some(existing) = self.state_manager.load_state().await? {
                if !existing.stage.is_terminal() {
                    return Err(UpgradeError::UpgradeInProgress {
                        upgrade_name: existing.upgrade_name,
                        stage: existing.stage.to_string(),
                    });
                }
                info!(
                    previous = %existing.upgrade_name,
                    stage = %existing.stage,
                    "Replacing finished upgrade state"
                );
            }
            self.run_fresh(request).await
        })
        .await
    }

    pub async fn resume(
        &self,
        options: &ResumeOptions,
        request: Option<&UpgradeRequest>,
    ) -> Result<ResumeReport, UpgradeError> {
        if options.clear_state {
            return self.with_lock(self.clear_state()).await;
        }

        if options.show_status {
            return self.status().await;
        }

        if options.force_restart {
            let request = request.ok_or(UpgradeError::MissingRequest {
                action: "force a restart",
            })?;
            return self
                .with_lock(async {
                    warn!(upgrade = %request.upgrade_name, "Discarding saved state for a forced restart");
                    self.state_manager.delete_state().await?;
                    self.run_fresh(request).await
                })
                .await;
        }

        self.with_lock(self.resume_saved(options.resume_from)).await
    }

    /// Read-only view of the saved upgrade
    pub async fn status(&self) -> Result<ResumeReport, UpgradeError> {
        let Some(state) = self.state_manager.load_state().await? else {
            return Ok(ResumeReport::nothing_to_resume());
        };

        let mut message = format!(
            "upgrade '{}' to {} is at stage {}",
            state.upgrade_name, state.target_version, state.stage
        );
        let outcome = state.stage.is_terminal().then(|| UpgradeOutcome::from_state(&state));
        if let Some(outcome) = &outcome {
            message = format!("{message}; {}", outcome.summary);
        }

        Ok(ResumeReport {
            action: ResumeAction::Status,
            state: Some(state),
            reconciliation: None,
            outcome,
            message,
        })
    }

    /// Compare the saved stage with the chain; with `apply`, persist a legal correction
    pub async fn reconcile(&self, apply: bool) -> Result<ResumeReport, UpgradeError> {
        if apply {
            self.with_lock(self.reconcile_saved(true)).await
        } else {
            self.reconcile_saved(false).await
        }
    }

    async fn reconcile_saved(&self, apply: bool) -> Result<ResumeReport, UpgradeError> {
        let Some(mut state) = self.state_manager.load_state().await? else {
            return Ok(ResumeReport::nothing_to_resume());
        };
        if state.stage.is_terminal() {
            return Ok(ResumeReport::terminal(state));
        }

        let reconciliation = if apply {
            self.reconcile_state(&mut state).await?
        } else {
            let detected = self.detector.detect_current_stage(&state).await;
            Reconciliation {
                saved_stage: state.stage,
                detected_stage: detected,
                applied: false,
            }
        };

        let message = if reconciliation.saved_stage == reconciliation.detected_stage {
            format!("saved stage {} matches the chain", reconciliation.saved_stage)
        } else if reconciliation.applied {
            format!(
                "moved saved stage {} to detected stage {}",
                reconciliation.saved_stage, reconciliation.detected_stage
            )
        } else {
            format!(
                "chain suggests stage {} but the saved stage {} was left as is",
                reconciliation.detected_stage, reconciliation.saved_stage
            )
        };

        Ok(ResumeReport {
            action: ResumeAction::Reconciled,
            state: Some(state),
            reconciliation: Some(reconciliation),
            outcome: None,
            message,
        })
    }

    async fn clear_state(&self) -> Result<ResumeReport, UpgradeError> {
        self.state_manager.delete_state().await?;
        info!(path = %self.state_manager.state_path().display(), "Upgrade state cleared");
        Ok(ResumeReport {
            action: ResumeAction::StateCleared,
            state: None,
            reconciliation: None,
            outcome: None,
            message: "upgrade state cleared".to_string(),
        })
    }

    async fn resume_saved(
        &self,
        resume_from: Option<ResumableStage>,
    ) -> Result<ResumeReport, UpgradeError> {
        let Some(mut state) = self.state_manager.load_state().await? else {
            return Ok(ResumeReport::nothing_to_resume());
        };
        self.state_manager.validate_state(&state)?;

        if state.stage.is_terminal() {
            return Ok(ResumeReport::terminal(state));
        }

        let reconciliation = match resume_from {
            Some(target) => {
                self.apply_override(&mut state, target).await?;
                None
            }
            None => Some(self.reconcile_state(&mut state).await?),
        };

        info!(
            upgrade = %state.upgrade_name,
            stage = %state.stage,
            "Resuming upgrade"
        );
        self.execute(state, reconciliation).await
    }

    async fn apply_override(
        &self,
        state: &mut UpgradeState,
        target: ResumableStage,
    ) -> Result<(), UpgradeError> {
        if state.stage == target {
            info!(stage = %target, "Already at requested stage");
            return Ok(());
        }

        if state.skip_governance && target.is_governance_only() {
            return Err(UpgradeError::InvalidTransition {
                from: state.stage,
                to: target,
            });
        }

        self.transitioner
            .transition_to(state, target, &format!("manual resume from {target}"))?;
        self.state_manager.save_state(state).await
    }

    async fn reconcile_state(&self, state: &mut UpgradeState) -> Result<Reconciliation, UpgradeError> {
        let saved_stage = state.stage;
        let detected_stage = self.detector.detect_current_stage(state).await;

        let applied = if detected_stage == saved_stage {
            false
        } else if self.transitioner.can_transition(saved_stage, detected_stage) {
            self.transitioner.transition_to(
                state,
                detected_stage,
                &format!("reconciled with chain state (detected {detected_stage})"),
            )?;
            self.state_manager.save_state(state).await?;
            true
        } else {
            warn!(
                upgrade = %state.upgrade_name,
                saved = %saved_stage,
                detected = %detected_stage,
                "Detected stage is not reachable from the saved stage, keeping saved stage"
            );
            false
        };

        Ok(Reconciliation {
            saved_stage,
            detected_stage,
            applied,
        })
    }

    async fn run_fresh(&self, request: &UpgradeRequest) -> Result<ResumeReport, UpgradeError> {
        let mut state = UpgradeState::new(request);
        self.state_manager.save_state(&mut state).await?;
        info!(
            upgrade = %state.upgrade_name,
            version = %state.target_version,
            skip_governance = state.skip_governance,
            "Starting upgrade"
        );
        self.execute(state, None).await
    }

    async fn execute(
        &self,
        mut state: UpgradeState,
        reconciliation: Option<Reconciliation>,
    ) -> Result<ResumeReport, UpgradeError> {
        let correlation_id = generate_correlation_id();
        let span = create_upgrade_span(&state.upgrade_name, &correlation_id);

        let outcome = self.orchestrator.execute(&mut state).instrument(span).await?;

        Ok(ResumeReport {
            action: ResumeAction::Executed,
            message: outcome.summary.clone(),
            state: Some(state),
            reconciliation,
            outcome: Some(outcome),
        })
    }

    /// Run `work` while holding the devnet lock; the lock is released on every path
    async fn with_lock<T, F>(&self, work: F) -> Result<T, UpgradeError>
    where
        F: Future<Output = Result<T, UpgradeError>>,
    {
        self.state_manager.acquire_lock().await?;
        let result = work.await;
        if let Err(e) = self.state_manager.release_lock().await {
            warn!(error = %e, "Failed to release upgrade lock");
        }
        result
    }
}
