//! Upgrade steps backed by operator-configured shell commands.
//!
//! Each hook receives the upgrade context as environment variables and must
//! print a single JSON document describing what it did.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::command::CommandExecutor;
use crate::config::HooksConfig;
use crate::upgrade::{
    ExportPhase, ExportStep, ProposalOutcome, ProposeStep, SwitchBinaryStep, SwitchOutcome,
    UpgradeState, VoteOutcome, VoteStep,
};

#[derive(Debug, Deserialize)]
struct ExportOutput {
    path: String,
}

pub struct HookSteps {
    executor: Arc<dyn CommandExecutor>,
    hooks: HooksConfig,
    devnet_home: PathBuf,
}

impl HookSteps {
    pub fn new(executor: Arc<dyn CommandExecutor>, hooks: HooksConfig, devnet_home: &Path) -> Self {
        Self {
            executor,
            hooks,
            devnet_home: devnet_home.to_path_buf(),
        }
    }

    pub fn has_export(&self) -> bool {
        self.hooks.export.is_some()
    }

    fn state_env(&self, state: &UpgradeState) -> Vec<(String, String)> {
        let mut env = vec![
            ("UPGRADE_NAME".to_string(), state.upgrade_name.clone()),
            ("UPGRADE_VERSION".to_string(), state.target_version.clone()),
            (
                "UPGRADE_BINARY".to_string(),
                state.target_binary.clone().unwrap_or_default(),
            ),
            (
                "UPGRADE_IMAGE".to_string(),
                state.target_image.clone().unwrap_or_default(),
            ),
            ("UPGRADE_MODE".to_string(), state.mode.to_string()),
        ];
        if let Some(proposal_id) = state.proposal_id {
            env.push(("PROPOSAL_ID".to_string(), proposal_id.to_string()));
        }
        if let Some(height) = state.upgrade_height {
            env.push(("UPGRADE_HEIGHT".to_string(), height.to_string()));
        }
        env
    }

    async fn run_hook<T: DeserializeOwned>(
        &self,
        name: &str,
        command: Option<&String>,
        mut env: Vec<(String, String)>,
    ) -> Result<T> {
        let command = command.ok_or_else(|| anyhow!("no `hooks.{name}` command is configured"))?;
        env.push((
            "DEVNET_HOME".to_string(),
            self.devnet_home.display().to_string(),
        ));

        info!(hook = name, command = %command, "Running upgrade hook");
        let output = self
            .executor
            .execute(&self.hooks.shell, &["-c".to_string(), command.clone()], &env)
            .await
            .with_context(|| format!("{name} hook could not be run"))?;

        if !output.success() {
            bail!(
                "{name} hook exited with status {}: {}",
                output.status_code,
                output.stderr.trim()
            );
        }

        debug!(hook = name, stdout = %output.stdout.trim(), "Hook finished");
        serde_json::from_str(output.stdout.trim())
            .with_context(|| format!("{name} hook printed invalid JSON"))
    }
}

#[async_trait]
impl ProposeStep for HookSteps {
    async fn submit_proposal(&self, state: &UpgradeState) -> Result<ProposalOutcome> {
        self.run_hook("propose", self.hooks.propose.as_ref(), self.state_env(state))
            .await
    }
}

#[async_trait]
impl VoteStep for HookSteps {
    async fn cast_votes(&self, proposal_id: u64, skip_addresses: &[String]) -> Result<VoteOutcome> {
        let env = vec![
            ("PROPOSAL_ID".to_string(), proposal_id.to_string()),
            ("SKIP_ADDRESSES".to_string(), skip_addresses.join(",")),
        ];
        self.run_hook("vote", self.hooks.vote.as_ref(), env).await
    }
}

#[async_trait]
impl SwitchBinaryStep for HookSteps {
    async fn switch_binary(&self, state: &UpgradeState, skip_nodes: &[String]) -> Result<SwitchOutcome> {
        let mut env = self.state_env(state);
        env.push(("SKIP_NODES".to_string(), skip_nodes.join(",")));
        self.run_hook("switch_binary", self.hooks.switch_binary.as_ref(), env)
            .await
    }
}

#[async_trait]
impl ExportStep for HookSteps {
    async fn export_state(&self, state: &UpgradeState, phase: ExportPhase) -> Result<String> {
        let mut env = self.state_env(state);
        env.push(("EXPORT_PHASE".to_string(), phase.to_string()));
        let output: ExportOutput = self
            .run_hook("export", self.hooks.export.as_ref(), env)
            .await?;
        Ok(output.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::command::{CommandError, CommandOutput, MockCommandExecutor};
    use crate::upgrade::mocks::governance_request;

    fn hooks() -> HooksConfig {
        HooksConfig {
            shell: "bash".to_string(),
            propose: Some("./propose.sh".to_string()),
            vote: Some("./vote.sh".to_string()),
            switch_binary: Some("./switch.sh".to_string()),
            export: None,
            ..HooksConfig::default()
        }
    }

    fn stdout(json: &str) -> CommandOutput {
        CommandOutput {
            status_code: 0,
            stdout: format!("{json}\n"),
            stderr: String::new(),
        }
    }

    fn has_env(env: &[(String, String)], key: &str, value: &str) -> bool {
        env.iter().any(|(k, v)| k == key && v == value)
    }

    #[tokio::test]
    async fn test_propose_hook_gets_context_and_parses_outcome() {
        let mut executor = MockCommandExecutor::new();
        executor
            .expect_execute()
            .withf(|program, args, env| {
                program == "bash"
                    && args == ["-c".to_string(), "./propose.sh".to_string()]
                    && has_env(env, "UPGRADE_NAME", "v2-upgrade")
                    && has_env(env, "UPGRADE_BINARY", "/opt/bin/stabled-v2")
                    && has_env(env, "UPGRADE_MODE", "local")
                    && has_env(env, "DEVNET_HOME", "/srv/devnet")
            })
            .times(1)
            .returning(|_, _, _| Ok(stdout(r#"{"proposalID": 7, "upgradeHeight": 1500}"#)));

        let steps = HookSteps::new(Arc::new(executor), hooks(), Path::new("/srv/devnet"));
        let state = UpgradeState::new(&governance_request());

        let outcome = steps.submit_proposal(&state).await.unwrap();
        assert_eq!(
            outcome,
            ProposalOutcome {
                proposal_id: 7,
                upgrade_height: 1500
            }
        );
    }

    #[tokio::test]
    async fn test_vote_hook_receives_skip_list() {
        let mut executor = MockCommandExecutor::new();
        executor
            .expect_execute()
            .withf(|_, _, env| {
                has_env(env, "PROPOSAL_ID", "7") && has_env(env, "SKIP_ADDRESSES", "val0,val1")
            })
            .returning(|_, _, _| {
                Ok(stdout(
                    r#"{"votesCast": 1, "totalVoters": 3, "txHashes": ["AB"],
                        "votes": [{"address": "val2", "moniker": "v2", "txHash": "AB"}]}"#,
                ))
            });

        let steps = HookSteps::new(Arc::new(executor), hooks(), Path::new("/srv/devnet"));
        let outcome = steps
            .cast_votes(7, &["val0".to_string(), "val1".to_string()])
            .await
            .unwrap();

        assert_eq!(outcome.total_voters, 3);
        assert_eq!(outcome.votes[0].address, "val2");
    }

    #[tokio::test]
    async fn test_failing_hook_is_an_error() {
        let mut executor = MockCommandExecutor::new();
        executor.expect_execute().returning(|_, _, _| {
            Ok(CommandOutput {
                status_code: 2,
                stdout: String::new(),
                stderr: "node1: container not found\n".to_string(),
            })
        });

        let steps = HookSteps::new(Arc::new(executor), hooks(), Path::new("/srv/devnet"));
        let state = UpgradeState::new(&governance_request());
        let err = steps.switch_binary(&state, &[]).await.unwrap_err();

        let message = format!("{err:#}");
        assert!(message.contains("status 2"));
        assert!(message.contains("container not found"));
    }

    #[tokio::test]
    async fn test_invalid_json_and_missing_binary_are_errors() {
        let mut executor = MockCommandExecutor::new();
        executor
            .expect_execute()
            .returning(|_, _, _| Ok(stdout("proposal submitted!")));
        let steps = HookSteps::new(Arc::new(executor), hooks(), Path::new("/srv/devnet"));
        let state = UpgradeState::new(&governance_request());
        let err = steps.submit_proposal(&state).await.unwrap_err();
        assert!(format!("{err:#}").contains("invalid JSON"));

        let mut executor = MockCommandExecutor::new();
        executor.expect_execute().returning(|_, _, _| {
            Err(CommandError::CommandNotFound {
                command: "bash".to_string(),
            })
        });
        let steps = HookSteps::new(Arc::new(executor), hooks(), Path::new("/srv/devnet"));
        assert!(steps.submit_proposal(&state).await.is_err());
    }

    #[tokio::test]
    async fn test_export_requires_configured_hook() {
        let executor = MockCommandExecutor::new();
        let steps = HookSteps::new(Arc::new(executor), hooks(), Path::new("/srv/devnet"));
        assert!(!steps.has_export());

        let state = UpgradeState::new(&governance_request());
        let err = steps
            .export_state(&state, ExportPhase::PreUpgrade)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("hooks.export"));
    }

    #[tokio::test]
    async fn test_export_hook_returns_path() {
        let mut executor = MockCommandExecutor::new();
        executor
            .expect_execute()
            .withf(|_, _, env| has_env(env, "EXPORT_PHASE", "post_upgrade"))
            .returning(|_, _, _| Ok(stdout(r#"{"path": "/srv/devnet/exports/post.json"}"#)));

        let config = HooksConfig {
            export: Some("./export.sh".to_string()),
            ..hooks()
        };
        let steps = HookSteps::new(Arc::new(executor), config, Path::new("/srv/devnet"));
        let state = UpgradeState::new(&governance_request());

        let path = steps
            .export_state(&state, ExportPhase::PostUpgrade)
            .await
            .unwrap();
        assert_eq!(path, "/srv/devnet/exports/post.json");
    }
}
