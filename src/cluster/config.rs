use serde::{Deserialize, Serialize};

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// This node's ID
    pub node_id: String,
    /// This node's advertised address
    pub advertise_addr: String,
    /// Storage engine serving this node's shards; defaults to the advertised address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_addr: Option<String>,
    /// List of peer nodes (excluding self)
    pub peers: Vec<PeerNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerNode {
    pub id: String,
    pub addr: String,
}

impl ClusterConfig {
    /// Create a single-node (non-distributed) config
    pub fn single_node() -> Self {
        Self {
            node_id: "node-1".to_string(),
            advertise_addr: "127.0.0.1:8086".to_string(),
            engine_addr: None,
            peers: vec![],
        }
    }

    /// Create a cluster config from environment variables
    /// POLYQL_NODE_ID=node-1
    /// POLYQL_ADVERTISE_ADDR=10.0.0.1:8086
    /// POLYQL_ENGINE_ADDR=127.0.0.1:9000
    /// POLYQL_PEERS=node-2@10.0.0.2:8086,10.0.0.3:8086
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::single_node();
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let node_id = var("POLYQL_NODE_ID").unwrap_or(defaults.node_id);
        let advertise_addr = var("POLYQL_ADVERTISE_ADDR").unwrap_or(defaults.advertise_addr);
        let engine_addr = var("POLYQL_ENGINE_ADDR");
        let peers = var("POLYQL_PEERS")
            .map(|s| parse_peers(&s))
            .unwrap_or_default();

        Self {
            node_id,
            advertise_addr,
            engine_addr,
            peers,
        }
    }

    /// Check if this is a distributed cluster
    pub fn is_distributed(&self) -> bool {
        !self.peers.is_empty()
    }

    /// Get all node addresses (including self)
    pub fn all_addrs(&self) -> Vec<String> {
        let mut addrs = vec![self.advertise_addr.clone()];
        addrs.extend(self.peer_addrs());
        addrs
    }

    /// Get peer addresses only (excluding self)
    pub fn peer_addrs(&self) -> Vec<String> {
        self.peers.iter().map(|p| p.addr.clone()).collect()
    }

    pub fn local_engine_addr(&self) -> &str {
        self.engine_addr.as_deref().unwrap_or(&self.advertise_addr)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::single_node()
    }
}

/// `id@host:port` or bare `host:port` entries, comma separated
fn parse_peers(s: &str) -> Vec<PeerNode> {
    s.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .enumerate()
        .map(|(i, entry)| match entry.split_once('@') {
            Some((id, addr)) => PeerNode {
                id: id.trim().to_string(),
                addr: addr.trim().to_string(),
            },
            None => PeerNode {
                id: format!("peer-{}", i + 1),
                addr: entry.to_string(),
            },
        })
        .collect()
}
