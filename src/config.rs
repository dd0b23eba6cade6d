use anyhow::Result;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "devnet-builder.toml";
pub const RC_FILE_NAME: &str = ".devnet-builder-rc";

/// Main configuration structure for devnet-builder
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DevnetBuilderConfig {
    /// Which devnet to operate on
    pub devnet: DevnetConfig,
    /// Chain endpoints
    pub chain: ChainConfig,
    /// Upgrade polling and deadlines
    pub upgrade: UpgradeConfig,
    /// Commands that perform the upgrade steps
    pub hooks: HooksConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DevnetConfig {
    /// Devnet home directory; holds the upgrade state, lock and metadata
    pub home: PathBuf,
}

impl Default for DevnetConfig {
    fn default() -> Self {
        Self {
            home: PathBuf::from(".devnet"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ChainConfig {
    /// CometBFT RPC endpoint
    pub rpc_url: String,
    /// Cosmos REST (LCD) endpoint
    pub api_url: String,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:26657".to_string(),
            api_url: "http://localhost:1317".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct UpgradeConfig {
    pub poll_interval_secs: u64,
    /// Timeout for each individual RPC call
    pub rpc_timeout_secs: u64,
    /// Deadline for the chain to halt at the upgrade height
    pub halt_timeout_secs: u64,
    /// Consecutive identical heights that count as halted
    pub halt_samples: u32,
    /// Blocks past the upgrade height before the halt wait gives up
    pub max_blocks_past_height: u64,
    /// Deadline for block production to resume on the new binary
    pub resume_timeout_secs: u64,
    /// Consecutive height advances that count as resumed
    pub resume_advances: u32,
    /// Gap between the two samples of a chain status check
    pub status_sample_window_secs: u64,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            rpc_timeout_secs: 5,
            halt_timeout_secs: 600,   // 10 minutes
            halt_samples: 3,
            max_blocks_past_height: 10,
            resume_timeout_secs: 300, // 5 minutes
            resume_advances: 2,
            status_sample_window_secs: 3,
        }
    }
}

/// Shell commands run for each upgrade step; stdout must be JSON
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Shell used to run the hook commands
    pub shell: String,
    /// Kill a hook that runs longer than this
    pub timeout_secs: u64,
    pub propose: Option<String>,
    pub vote: Option<String>,
    pub switch_binary: Option<String>,
    /// Export hook; exports are skipped when unset
    pub export: Option<String>,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            timeout_secs: 600,
            propose: None,
            vote: None,
            switch_binary: None,
            export: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,
    /// Emit JSON log lines instead of compact text
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl DevnetBuilderConfig {
    /// Load configuration from the current directory
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("."))
    }

    /// Load configuration with precedence:
    /// 1. Default values
    /// 2. Configuration files in `dir` (devnet-builder.toml, .devnet-builder-rc)
    /// 3. Environment variables (prefixed with DEVNET_BUILDER_, `__` between sections)
    pub fn load_from(dir: &Path) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        let toml_path = dir.join(CONFIG_FILE_NAME);
        if toml_path.exists() {
            builder = builder.add_source(File::from(toml_path).format(FileFormat::Toml));
        }

        let rc_path = dir.join(RC_FILE_NAME);
        if rc_path.exists() {
            builder = builder.add_source(File::from(rc_path).format(FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix("DEVNET_BUILDER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<DevnetBuilderConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        // Load .env file first
        let _ = DevnetBuilderConfig::load_env_file();
        DevnetBuilderConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static DevnetBuilderConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_when_no_files() {
        let dir = TempDir::new().unwrap();
        let loaded = DevnetBuilderConfig::load_from(dir.path()).unwrap();

        assert_eq!(loaded.upgrade, UpgradeConfig::default());
        assert_eq!(loaded.chain.rpc_url, "http://localhost:26657");
        assert_eq!(loaded.hooks.shell, "sh");
        assert!(loaded.hooks.export.is_none());
    }

    #[test]
    fn test_partial_file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"
[devnet]
home = "/srv/devnet"

[upgrade]
halt_timeout_secs = 60

[hooks]
vote = "./scripts/vote.sh"
"#,
        )
        .unwrap();

        let loaded = DevnetBuilderConfig::load_from(dir.path()).unwrap();
        assert_eq!(loaded.devnet.home, PathBuf::from("/srv/devnet"));
        assert_eq!(loaded.upgrade.halt_timeout_secs, 60);
        assert_eq!(loaded.upgrade.poll_interval_secs, 2);
        assert_eq!(loaded.hooks.vote.as_deref(), Some("./scripts/vote.sh"));
    }

    #[test]
    fn test_rc_file_takes_precedence_over_toml() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[chain]\nrpc_url = \"http://from-toml:26657\"\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join(RC_FILE_NAME),
            "[chain]\nrpc_url = \"http://from-rc:26657\"\n",
        )
        .unwrap();

        let loaded = DevnetBuilderConfig::load_from(dir.path()).unwrap();
        assert_eq!(loaded.chain.rpc_url, "http://from-rc:26657");
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let mut original = DevnetBuilderConfig::default();
        original.hooks.switch_binary = Some("make switch".to_string());
        original.observability.json_logs = true;
        original
            .save_to_file(dir.path().join(CONFIG_FILE_NAME))
            .unwrap();

        let loaded = DevnetBuilderConfig::load_from(dir.path()).unwrap();
        assert_eq!(loaded, original);
    }
}
