use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::upgrade::{DevnetRecorder, UpgradeState};

pub const METADATA_FILE_NAME: &str = "metadata.json";

/// Records the running version in `<devnet home>/metadata.json`, keeping other keys
pub struct FileDevnetRecorder {
    metadata_path: PathBuf,
}

impl FileDevnetRecorder {
    pub fn new(devnet_home: impl AsRef<Path>) -> Self {
        Self {
            metadata_path: devnet_home.as_ref().join(METADATA_FILE_NAME),
        }
    }
}

#[async_trait]
impl DevnetRecorder for FileDevnetRecorder {
    async fn record_version(&self, state: &UpgradeState) -> Result<()> {
        let mut metadata = match tokio::fs::read_to_string(&self.metadata_path).await {
            Ok(content) => serde_json::from_str::<Map<String, Value>>(&content)
                .with_context(|| format!("{} is not a JSON object", self.metadata_path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => return Err(e).context("failed to read devnet metadata"),
        };

        metadata.insert(
            "currentVersion".to_string(),
            Value::String(state.target_version.clone()),
        );
        if let Some(binary) = &state.target_binary {
            metadata.insert("currentBinary".to_string(), Value::String(binary.clone()));
        }
        if let Some(image) = &state.target_image {
            metadata.insert("currentImage".to_string(), Value::String(image.clone()));
        }

        let content = serde_json::to_string_pretty(&metadata)?;
        tokio::fs::write(&self.metadata_path, content)
            .await
            .context("failed to write devnet metadata")?;

        info!(
            path = %self.metadata_path.display(),
            version = %state.target_version,
            "Recorded upgraded version"
        );
        Ok(())
    }
}
