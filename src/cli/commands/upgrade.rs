use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cli::UpgradeAction;
use crate::config::DevnetBuilderConfig;
use crate::external::{FileDevnetRecorder, HookSteps, HttpChainRpc, ProcessCommandExecutor};
use crate::shutdown::{CancelSignal, ShutdownCoordinator};
use crate::upgrade::{
    ChainStateDetector, ExportStep, FileStateManager, LogProgress, ResumableOrchestrator,
    ResumeAction, ResumeController, ResumeOptions, ResumeReport, StageTransitioner, StateManager,
    StateTransitioner, UpgradeCollaborators, UpgradeState, UpgradeTimings,
};

pub struct UpgradeCommand {
    pub action: UpgradeAction,
    pub home: PathBuf,
    pub json: bool,
}

impl UpgradeCommand {
    pub fn new(action: UpgradeAction, home: PathBuf) -> Self {
        Self {
            action,
            home,
            json: false,
        }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Returns `false` when the upgrade ended unsuccessfully
    pub async fn execute(&self, config: &DevnetBuilderConfig) -> Result<bool> {
        std::fs::create_dir_all(&self.home)
            .with_context(|| format!("cannot create devnet home {}", self.home.display()))?;

        let shutdown = ShutdownCoordinator::new();
        shutdown.install_signal_handlers()?;
        let controller = build_controller(config, &self.home, shutdown.signal())?;

        let report = match &self.action {
            UpgradeAction::Start { request } => {
                let request = request
                    .to_request()?
                    .context("upgrade start needs --name and --version")?;
                if !self.json {
                    println!(
                        "🚀 Starting upgrade '{}' to {}",
                        request.upgrade_name, request.target_version
                    );
                }
                controller.start(&request).await?
            }
            UpgradeAction::Resume {
                force_restart,
                clear_state,
                show_status,
                resume_from,
                request,
            } => {
                let options = ResumeOptions {
                    clear_state: *clear_state,
                    show_status: *show_status,
                    force_restart: *force_restart,
                    resume_from: *resume_from,
                };
                let request = request.to_request()?;
                controller.resume(&options, request.as_ref()).await?
            }
            UpgradeAction::Reconcile { apply } => controller.reconcile(*apply).await?,
        };

        print_report(&report, self.json)?;
        Ok(report.outcome.as_ref().map_or(true, |outcome| outcome.success))
    }
}

fn build_controller(
    config: &DevnetBuilderConfig,
    home: &Path,
    cancel: CancelSignal,
) -> Result<ResumeController> {
    let timings = UpgradeTimings::from(&config.upgrade);
    let rpc = Arc::new(HttpChainRpc::new(
        &config.chain.rpc_url,
        &config.chain.api_url,
        timings.rpc_timeout,
    )?);

    let executor = Arc::new(ProcessCommandExecutor::new(Duration::from_secs(
        config.hooks.timeout_secs,
    )));
    let hooks = Arc::new(HookSteps::new(executor, config.hooks.clone(), home));
    let export = hooks
        .has_export()
        .then(|| hooks.clone() as Arc<dyn ExportStep>);

    let collaborators = UpgradeCollaborators {
        rpc: rpc.clone(),
        propose: hooks.clone(),
        vote: hooks.clone(),
        switch: hooks,
        export,
        recorder: Arc::new(FileDevnetRecorder::new(home)),
        progress: Arc::new(LogProgress),
    };

    let state_manager: Arc<dyn StateManager> = Arc::new(FileStateManager::new(home));
    let transitioner: Arc<dyn StateTransitioner> = Arc::new(StageTransitioner::new());
    let detector = Arc::new(
        ChainStateDetector::new(
            rpc,
            Duration::from_secs(config.upgrade.status_sample_window_secs),
            timings.rpc_timeout,
        )
        .with_cancel(cancel.clone()),
    );
    let orchestrator = ResumableOrchestrator::new(
        state_manager.clone(),
        transitioner.clone(),
        collaborators,
        timings,
        cancel,
    );

    Ok(ResumeController::new(
        state_manager,
        transitioner,
        detector,
        orchestrator,
    ))
}

fn print_report(report: &ResumeReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    match report.action {
        ResumeAction::NothingToResume => println!("ℹ️  {}", report.message),
        ResumeAction::StateCleared => println!("🧹 {}", report.message),
        ResumeAction::Status => {
            println!("📋 {}", report.message);
            if let Some(state) = &report.state {
                print_state(state);
            }
        }
        ResumeAction::Reconciled => println!("🔍 {}", report.message),
        ResumeAction::TerminalReported | ResumeAction::Executed => {
            if let Some(reconciliation) = &report.reconciliation {
                if reconciliation.applied {
                    println!(
                        "🔍 Resumed from {} (saved stage was {})",
                        reconciliation.detected_stage, reconciliation.saved_stage
                    );
                }
            }
            let success = report.outcome.as_ref().is_some_and(|outcome| outcome.success);
            let icon = if success { "✅" } else { "❌" };
            println!("{icon} {}", report.message);
        }
    }
    Ok(())
}

fn print_state(state: &UpgradeState) {
    println!("   Stage:        {}", state.stage);
    println!("   Target:       {} ({})", state.target_version, state.target_artifact());
    println!("   Mode:         {}", state.mode);
    if let Some(proposal_id) = state.proposal_id {
        println!("   Proposal:     #{proposal_id}");
    }
    if let Some(height) = state.upgrade_height {
        println!("   Height:       {height}");
    }
    if !state.skip_governance {
        println!("   Votes:        {}", state.voted_addresses().len());
    }
    println!(
        "   Nodes:        {}/{} switched",
        state.switched_nodes().len(),
        state.node_switches.len()
    );
    if !state.error.is_empty() {
        println!("   Error:        {}", state.error);
    }
    println!("   Updated:      {}", state.updated_at.to_rfc3339());
    for record in &state.stage_history {
        println!(
            "   {} {} → {}: {}",
            record.timestamp.format("%H:%M:%S"),
            record.from,
            record.to,
            record.reason
        );
    }
}
