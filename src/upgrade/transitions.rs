// Stage transitions - every stage change goes through here so the audit trail
// and the legal-edge graph cannot drift apart

use chrono::Utc;
use tracing::{info, warn};

use super::errors::UpgradeError;
use super::state::{ResumableStage, StageTransitionRecord, UpgradeState};

/// Enforces the stage graph on an `UpgradeState`
pub trait StateTransitioner: Send + Sync {
    /// Move `state` to `target`, recording `reason` in the stage history.
    /// Leaves `state` untouched when the edge does not exist.
    fn transition_to(
        &self,
        state: &mut UpgradeState,
        target: ResumableStage,
        reason: &str,
    ) -> Result<(), UpgradeError>;

    fn can_transition(&self, from: ResumableStage, to: ResumableStage) -> bool;

    fn valid_transitions(&self, from: ResumableStage) -> Vec<ResumableStage>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StageTransitioner;

impl StageTransitioner {
    pub fn new() -> Self {
        Self
    }
}

impl StateTransitioner for StageTransitioner {
    fn transition_to(
        &self,
        state: &mut UpgradeState,
        target: ResumableStage,
        reason: &str,
    ) -> Result<(), UpgradeError> {
        let from = state.stage;
        if !from.can_transition_to(target) {
            warn!(
                upgrade = %state.upgrade_name,
                from = %from,
                to = %target,
                "Rejected illegal stage transition"
            );
            return Err(UpgradeError::InvalidTransition { from, to: target });
        }

        let now = Utc::now();
        state.stage_history.push(StageTransitionRecord {
            from,
            to: target,
            timestamp: now,
            reason: reason.to_string(),
        });
        state.stage = target;
        state.updated_at = now;

        if target == ResumableStage::Failed && state.error.is_empty() {
            state.error = reason.to_string();
        }

        info!(
            upgrade = %state.upgrade_name,
            from = %from,
            to = %target,
            reason = %reason,
            "Upgrade stage transition"
        );

        Ok(())
    }

    fn can_transition(&self, from: ResumableStage, to: ResumableStage) -> bool {
        from.can_transition_to(to)
    }

    fn valid_transitions(&self, from: ResumableStage) -> Vec<ResumableStage> {
        from.valid_transitions().to_vec()
    }
}
