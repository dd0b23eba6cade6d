use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::upgrade::{ExecutionMode, ResumableStage, UpgradeRequest};

pub mod commands;

#[derive(Parser)]
#[command(name = "devnet-builder")]
#[command(about = "Build and operate local blockchain devnets")]
#[command(long_about = "devnet-builder runs local multi-validator devnets. The upgrade commands drive a \
                       chain software upgrade end to end and can resume an interrupted upgrade from \
                       the last completed stage.")]
pub struct Cli {
    /// Devnet home directory (overrides devnet.home from the config)
    #[arg(long, global = true)]
    pub home: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Software upgrade of the devnet's chain binary
    Upgrade {
        #[command(subcommand)]
        action: UpgradeAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum UpgradeAction {
    /// Start a new upgrade
    Start {
        #[command(flatten)]
        request: UpgradeArgs,
    },
    /// Resume an interrupted upgrade from its last completed stage
    Resume {
        /// Discard saved progress and start over (needs --name and --version)
        #[arg(long)]
        force_restart: bool,
        /// Delete the saved upgrade state, including a corrupted one
        #[arg(long)]
        clear_state: bool,
        /// Show the saved upgrade without executing anything
        #[arg(long)]
        show_status: bool,
        /// Move to this stage before resuming, skipping chain detection
        #[arg(long, value_name = "STAGE")]
        resume_from: Option<ResumableStage>,
        #[command(flatten)]
        request: UpgradeArgs,
    },
    /// Compare the saved stage against the chain without executing
    Reconcile {
        /// Persist the detected stage when it is a legal move
        #[arg(long)]
        apply: bool,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    #[default]
    Local,
    Docker,
}

impl From<ModeArg> for ExecutionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Local => ExecutionMode::Local,
            ModeArg::Docker => ExecutionMode::Docker,
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct UpgradeArgs {
    /// Upgrade plan name, as registered in the new binary
    #[arg(long)]
    pub name: Option<String>,
    /// Version the chain is upgraded to
    #[arg(long = "version", value_name = "VERSION")]
    pub target_version: Option<String>,
    /// New binary (local mode)
    #[arg(long)]
    pub binary: Option<String>,
    /// New container image (docker mode)
    #[arg(long)]
    pub image: Option<String>,
    #[arg(long, value_enum, default_value_t = ModeArg::Local)]
    pub mode: ModeArg,
    /// Replace binaries directly without a governance proposal
    #[arg(long)]
    pub skip_governance: bool,
}

impl UpgradeArgs {
    /// `None` when no upgrade was described at all
    pub fn to_request(&self) -> anyhow::Result<Option<UpgradeRequest>> {
        let (name, version) = match (&self.name, &self.target_version) {
            (None, None) => return Ok(None),
            (Some(name), Some(version)) => (name.clone(), version.clone()),
            _ => anyhow::bail!("an upgrade needs both --name and --version"),
        };

        let mode = ExecutionMode::from(self.mode);
        match mode {
            ExecutionMode::Local if self.binary.is_none() => {
                anyhow::bail!("--binary is required in local mode")
            }
            ExecutionMode::Docker if self.image.is_none() => {
                anyhow::bail!("--image is required in docker mode")
            }
            _ => {}
        }

        Ok(Some(UpgradeRequest {
            upgrade_name: name,
            target_version: version,
            target_binary: self.binary.clone(),
            target_image: self.image.clone(),
            mode,
            skip_governance: self.skip_governance,
        }))
    }
}
