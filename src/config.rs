use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::ring::{Ring, Token};

/// Set to `1` to provision one token per node instead of vnodes. Mirrors
/// the deployment toggle that decides which maintenance commands a rollout
/// exercises.
pub const SINGLE_TOKEN_ENV: &str = "CUTTLE_SINGLE_TOKEN";

static SINGLE_TOKEN: Lazy<bool> =
    Lazy::new(|| std::env::var(SINGLE_TOKEN_ENV).ok().as_deref() == Some("1"));

/// Whether clusters default to single-token placement (read once per
/// process).
pub fn single_token_default() -> bool {
    *SINGLE_TOKEN
}

/// Cluster-level knobs, consumed by the controller when provisioning nodes.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Path to the node binary to spawn.
    pub node_binary: PathBuf,
    /// Data directories per node.
    pub datadir_count: usize,
    /// Tokens per node when vnodes are enabled.
    pub num_tokens: usize,
    /// One token per node; changes which maintenance commands apply.
    pub single_token: bool,
    /// Named options passed through to every node.
    pub options: HashMap<String, String>,
    /// Worker threads for each node's runtime.
    pub worker_threads: usize,
    /// How long to wait for a node to accept client connections.
    pub startup_timeout: Duration,
    /// Advertised release version for newly provisioned nodes.
    pub version: String,
}

impl ClusterConfig {
    pub fn new(node_binary: impl Into<PathBuf>) -> Self {
        Self {
            node_binary: node_binary.into(),
            datadir_count: 3,
            num_tokens: 16,
            single_token: single_token_default(),
            options: HashMap::new(),
            worker_threads: 2,
            startup_timeout: Duration::from_secs(60),
            version: "1.0".to_string(),
        }
    }

    pub fn set_datadir_count(&mut self, count: usize) -> &mut Self {
        self.datadir_count = count;
        self
    }

    /// Set a named configuration option propagated to every node.
    pub fn set_option(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Tokens per node under the current placement mode.
    pub fn tokens_per_node(&self) -> usize {
        if self.single_token {
            1
        } else {
            self.num_tokens
        }
    }
}

/// Per-node configuration, written as JSON and read back by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    /// Advertised release version; a rolling upgrade rewrites this.
    pub version: String,
    pub native_addr: SocketAddr,
    pub mgmt_addr: SocketAddr,
    /// Root of this node's on-disk layout (data dirs, commitlog, logs).
    pub node_dir: PathBuf,
    pub datadir_count: usize,
    pub tokens: Vec<Token>,
    /// Stream replica ranges from peers before serving clients.
    pub bootstrap: bool,
    /// Management endpoints of peers to stream from while bootstrapping.
    pub seeds: Vec<SocketAddr>,
    /// Full topology at start time, this node included.
    pub ring: Ring,
    pub options: HashMap<String, String>,
    pub worker_threads: usize,
}

impl NodeConfig {
    pub fn load(path: &std::path::Path) -> crate::error::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn store(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn datadir(&self, index: usize) -> PathBuf {
        self.node_dir.join(format!("data{index}"))
    }

    pub fn commitlog_dir(&self) -> PathBuf {
        self.node_dir.join("commitlog")
    }

    pub fn log_file(&self) -> PathBuf {
        self.node_dir.join("logs").join("system.log")
    }

    pub fn config_file(&self) -> PathBuf {
        self.node_dir.join("conf").join("node.json")
    }
}
