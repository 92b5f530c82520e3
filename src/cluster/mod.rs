//! Cluster controller: provisions a set of node processes, starts and stops
//! them, pushes topology changes, and fans maintenance commands out. The
//! controller is the control plane; nodes never gossip, and bootstrap and
//! decommission are orchestrated from here.

mod node;

pub use node::NodeHandle;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::client::Session;
use crate::config::{ClusterConfig, NodeConfig};
use crate::error::{CuttleError, Result};
use crate::ring::{allocate_tokens, Ring, RingMember};

pub struct Cluster {
    config: ClusterConfig,
    base_dir: PathBuf,
    nodes: Vec<NodeHandle>,
    ring: Ring,
    allow_log_errors: bool,
}

impl Cluster {
    /// A cluster rooted at `base_dir`. Nothing is provisioned until
    /// `populate` is called.
    pub fn new(config: ClusterConfig, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            base_dir: base_dir.into(),
            nodes: Vec::new(),
            ring: Ring::default(),
            allow_log_errors: false,
        }
    }

    /// Tolerate ERROR lines in node logs at shutdown. Bootstrap scenarios
    /// legitimately log transient streaming errors.
    pub fn allow_log_errors(&mut self, allow: bool) {
        self.allow_log_errors = allow;
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Result<&NodeHandle> {
        self.nodes
            .iter()
            .find(|n| n.name() == name)
            .ok_or_else(|| CuttleError::NodeNotFound(name.to_string()))
    }

    pub fn node_mut(&mut self, name: &str) -> Result<&mut NodeHandle> {
        self.nodes
            .iter_mut()
            .find(|n| n.name() == name)
            .ok_or_else(|| CuttleError::NodeNotFound(name.to_string()))
    }

    /// Provision `count` nodes: directories, ports, tokens and config
    /// files. Call before `start`.
    pub fn populate(&mut self, count: usize) -> Result<&mut Self> {
        if !self.nodes.is_empty() {
            return Err(CuttleError::Process("cluster already populated".to_string()));
        }
        let tokens_per_node = self.config.tokens_per_node();
        let mut configs = Vec::with_capacity(count);
        for index in 0..count {
            let name = format!("node{}", index + 1);
            configs.push(self.blank_node_config(
                name,
                allocate_tokens(index, count, tokens_per_node),
                false,
            ));
        }
        let ring = Ring::new(configs.iter().map(ring_member).collect());
        for mut config in configs {
            config.ring = ring.clone();
            config.seeds = seed_addrs(&ring, &config.name);
            self.nodes.push(NodeHandle::new(
                config,
                self.config.node_binary.clone(),
                self.config.startup_timeout,
            ));
        }
        self.ring = ring;
        tracing::info!(count, "cluster provisioned");
        Ok(self)
    }

    /// Start every provisioned node and block until each accepts client
    /// connections.
    pub async fn start(&mut self) -> Result<()> {
        for node in &mut self.nodes {
            node.start()?;
        }
        for node in &self.nodes {
            node.wait_for_native_proto().await?;
        }
        tracing::info!("cluster is up");
        Ok(())
    }

    /// A ring-aware session over the current topology.
    pub async fn session(&self) -> Result<Session> {
        Session::connect(self.ring.clone()).await
    }

    /// Flush memtables on every node.
    pub async fn flush(&self) -> Result<()> {
        self.admin_all("flush", &[]).await
    }

    /// Run a major compaction on every node.
    pub async fn compact(&self) -> Result<()> {
        self.admin_all("compact", &[]).await
    }

    /// Drop no-longer-owned rows on every node.
    pub async fn cleanup(&self) -> Result<()> {
        self.admin_all("cleanup", &[]).await
    }

    async fn admin_all(&self, command: &str, args: &[&str]) -> Result<()> {
        for node in &self.nodes {
            node.admin(command, args).await?;
        }
        Ok(())
    }

    /// Add one node to the running cluster. The new node streams its
    /// replica ranges from the existing nodes before it starts serving;
    /// this call returns once it reports NORMAL.
    pub async fn bootstrap_node(&mut self) -> Result<&NodeHandle> {
        let name = format!("node{}", self.nodes.len() + 1);
        let tokens = self
            .ring
            .allocate_midpoint_tokens(self.config.tokens_per_node());
        let mut config = self.blank_node_config(name.clone(), tokens, true);
        let new_ring = self.ring.with_member(ring_member(&config));
        config.ring = new_ring.clone();
        config.seeds = seed_addrs(&self.ring, &config.name);

        // Existing nodes learn the new topology first, so later cleanup
        // operations compute ownership against the post-bootstrap ring.
        for node in &self.nodes {
            node.mgmt().set_ring(&new_ring).await?;
        }
        // Keep the on-disk configs in step so a restarted node rejoins
        // with the current topology.
        for node in &mut self.nodes {
            node.config_mut().ring = new_ring.clone();
        }

        let mut handle = NodeHandle::new(
            config,
            self.config.node_binary.clone(),
            self.config.startup_timeout,
        );
        handle.start()?;
        handle.wait_for_native_proto().await?;
        tracing::info!(node = %name, "bootstrap complete");

        self.nodes.push(handle);
        self.ring = new_ring;
        Ok(self.nodes.last().expect("node just pushed"))
    }

    /// Decommission a node: survivors learn the shrunken ring, the node
    /// streams its rows to their new owners and exits, and the handle is
    /// dropped from the cluster.
    pub async fn decommission(&mut self, name: &str) -> Result<()> {
        let new_ring = self.ring.without(name);
        if new_ring.members.len() == self.ring.members.len() {
            return Err(CuttleError::NodeNotFound(name.to_string()));
        }
        for node in &self.nodes {
            if node.name() != name {
                node.mgmt().set_ring(&new_ring).await?;
            }
        }
        for node in &mut self.nodes {
            if node.name() != name {
                node.config_mut().ring = new_ring.clone();
            }
        }
        let node = self.node(name)?;
        node.admin("decommission", &[]).await?;
        let node = self.node_mut(name)?;
        node.wait_exit(Duration::from_secs(60)).await?;

        self.nodes.retain(|n| n.name() != name);
        self.ring = new_ring;
        tracing::info!(node = %name, "decommissioned");
        Ok(())
    }

    /// Kill every node, then fail if any log contains unexpected ERROR
    /// lines.
    pub async fn stop(&mut self) -> Result<()> {
        for node in &mut self.nodes {
            node.stop().await?;
        }
        if !self.allow_log_errors {
            for node in &self.nodes {
                let errors = node.error_log_lines()?;
                if !errors.is_empty() {
                    for line in errors.iter().take(5) {
                        tracing::error!(node = node.name(), "{line}");
                    }
                    return Err(CuttleError::LogErrors {
                        node: node.name().to_string(),
                        count: errors.len(),
                    });
                }
            }
        }
        Ok(())
    }

    fn blank_node_config(&self, name: String, tokens: Vec<u64>, bootstrap: bool) -> NodeConfig {
        NodeConfig {
            node_dir: self.base_dir.join(&name),
            name,
            version: self.config.version.clone(),
            native_addr: local_addr(crate::check::alloc_port()),
            mgmt_addr: local_addr(crate::check::alloc_port()),
            datadir_count: self.config.datadir_count,
            tokens,
            bootstrap,
            seeds: Vec::new(),
            ring: Ring::default(),
            options: self.config.options.clone(),
            worker_threads: self.config.worker_threads,
        }
    }
}

fn local_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn ring_member(config: &NodeConfig) -> RingMember {
    RingMember {
        name: config.name.clone(),
        native_addr: config.native_addr,
        mgmt_addr: config.mgmt_addr,
        tokens: config.tokens.clone(),
    }
}

fn seed_addrs(ring: &Ring, own_name: &str) -> Vec<SocketAddr> {
    ring.members
        .iter()
        .filter(|m| m.name != own_name)
        .map(|m| m.mgmt_addr)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_populate_assigns_distinct_ports_and_tokens() {
        let config = ClusterConfig::new("/bin/false");
        let scratch = crate::check::temp_dir(Some("cuttle_cluster"), false);
        let mut cluster = Cluster::new(config, scratch.path());
        cluster.populate(3).unwrap();

        assert_eq!(cluster.nodes().len(), 3);
        assert_eq!(cluster.ring().members.len(), 3);

        let mut addrs: Vec<SocketAddr> = cluster
            .nodes()
            .iter()
            .flat_map(|n| [n.native_addr(), n.mgmt_addr()])
            .collect();
        addrs.sort();
        addrs.dedup();
        assert_eq!(addrs.len(), 6, "every port is unique");

        // Each node's config carries the full ring and the other nodes as
        // seeds.
        for node in cluster.nodes() {
            assert_eq!(node.config().ring.members.len(), 3);
            assert_eq!(node.config().seeds.len(), 2);
        }
    }

    #[test]
    fn test_populate_twice_is_rejected() {
        let config = ClusterConfig::new("/bin/false");
        let scratch = crate::check::temp_dir(Some("cuttle_cluster"), false);
        let mut cluster = Cluster::new(config, scratch.path());
        cluster.populate(1).unwrap();
        assert!(cluster.populate(1).is_err());
    }
}
