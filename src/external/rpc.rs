//! HTTP chain queries against CometBFT RPC and the Cosmos REST gateway

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::upgrade::ChainRpc;

#[derive(Debug, Deserialize)]
struct StatusResponse {
    result: StatusResult,
}

#[derive(Debug, Deserialize)]
struct StatusResult {
    sync_info: SyncInfo,
}

#[derive(Debug, Deserialize)]
struct SyncInfo {
    latest_block_height: String,
}

#[derive(Debug, Deserialize)]
struct ProposalResponse {
    proposal: ProposalBody,
}

#[derive(Debug, Deserialize)]
struct ProposalBody {
    status: String,
}

fn parse_block_height(body: &str) -> Result<u64> {
    let status: StatusResponse = serde_json::from_str(body).context("malformed /status response")?;
    let raw = status.result.sync_info.latest_block_height;
    raw.parse()
        .with_context(|| format!("latest_block_height is not a number: {raw:?}"))
}

fn parse_proposal_status(body: &str) -> Result<String> {
    let response: ProposalResponse = serde_json::from_str(body).context("malformed proposal response")?;
    Ok(response.proposal.status)
}

/// `ChainRpc` over HTTP
#[derive(Debug, Clone)]
pub struct HttpChainRpc {
    client: reqwest::Client,
    rpc_url: String,
    api_url: String,
}

impl HttpChainRpc {
    pub fn new(rpc_url: &str, api_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            rpc_url: rpc_url.trim_end_matches('/').to_string(),
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_text(&self, url: &str) -> Result<String> {
        debug!(url, "Chain query");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("{url} returned an error status"))?;
        Ok(response.text().await?)
    }
}

#[async_trait]
impl ChainRpc for HttpChainRpc {
    async fn block_height(&self) -> Result<u64> {
        let body = self.get_text(&format!("{}/status", self.rpc_url)).await?;
        parse_block_height(&body)
    }

    async fn proposal_status(&self, proposal_id: u64) -> Result<String> {
        let url = format!("{}/cosmos/gov/v1/proposals/{proposal_id}", self.api_url);
        let body = self.get_text(&url).await?;
        parse_proposal_status(&body)
    }
}
