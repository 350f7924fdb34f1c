use async_trait::async_trait;
use std::time::Duration;

use super::config::ClusterConfig;
use super::plan::{ShardResult, Statement};

/// Transport the plan executor uses to reach shards
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Run a statement against this node's own engine
    async fn execute_local(&self, statement: &Statement) -> Result<ShardResult, ClusterError>;

    /// Run a statement on the node at `addr`
    async fn execute_remote(
        &self,
        addr: &str,
        statement: &Statement,
    ) -> Result<ShardResult, ClusterError>;

    /// This node's advertised address
    fn local_addr(&self) -> &str;

    /// Every node holding shards, this one included
    fn peers(&self) -> Vec<String>;
}

/// reqwest-backed client for communicating with peer nodes
#[derive(Debug, Clone)]
pub struct HttpClusterClient {
    http_client: reqwest::Client,
    local_addr: String,
    engine_addr: String,
    peers: Vec<String>,
}

impl HttpClusterClient {
    pub fn new(config: &ClusterConfig, timeout: Duration) -> Result<Self, ClusterError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClusterError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            local_addr: config.advertise_addr.clone(),
            engine_addr: config.local_engine_addr().to_string(),
            peers: config.all_addrs(),
        })
    }

    async fn post(&self, addr: &str, statement: &Statement) -> Result<ShardResult, ClusterError> {
        let url = format!("http://{}/internal/v1/execute", addr);

        let response = self
            .http_client
            .post(&url)
            .json(statement)
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ClusterError::RemoteError(format!("{}: {}", status, error_text)));
        }

        let result: ShardResult = response
            .json()
            .await
            .map_err(|e| ClusterError::Deserialization(e.to_string()))?;

        match result.error {
            Some(error) => Err(ClusterError::RemoteError(error)),
            None => Ok(result),
        }
    }
}

#[async_trait]
impl ClusterClient for HttpClusterClient {
    async fn execute_local(&self, statement: &Statement) -> Result<ShardResult, ClusterError> {
        self.post(&self.engine_addr, statement).await
    }

    async fn execute_remote(
        &self,
        addr: &str,
        statement: &Statement,
    ) -> Result<ShardResult, ClusterError> {
        self.post(addr, statement).await
    }

    fn local_addr(&self) -> &str {
        &self.local_addr
    }

    fn peers(&self) -> Vec<String> {
        self.peers.clone()
    }
}

fn transport_error(e: reqwest::Error) -> ClusterError {
    if e.is_timeout() {
        ClusterError::Timeout
    } else {
        ClusterError::Network(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote error: {0}")]
    RemoteError(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Shard call timed out")]
    Timeout,
}
