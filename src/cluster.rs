//! Cluster Control Surface
//!
//! Provisions loopback nodes in one process and answers questions about
//! who leads them. Used by operators trying out a cluster and by tests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::RaftliteConfig;
use crate::error::{Error, Result};
use crate::server::RaftliteNode;
use crate::state::NodeRole;
use crate::wal::Index;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A set of nodes running in this process
pub struct LocalCluster {
    base_dir: PathBuf,
    nodes: BTreeMap<String, RaftliteNode>,
}

impl LocalCluster {
    /// Node data lives in subdirectories of `base_dir`
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            nodes: BTreeMap::new(),
        }
    }

    /// Loopback configuration for node `id`
    pub fn node_config(&self, id: &str, bootstrap: bool) -> RaftliteConfig {
        RaftliteConfig::local(id, self.base_dir.join(id), bootstrap)
    }

    /// Start a node from `config`
    pub async fn provision_with(&mut self, config: RaftliteConfig) -> Result<&RaftliteNode> {
        let id = config.node.id.clone();
        if self.nodes.contains_key(&id) {
            return Err(Error::Config(format!("node {} already provisioned", id)));
        }
        let node = RaftliteNode::start(config).await?;
        tracing::info!("Provisioned node {} at {}", id, node.address());
        Ok(self.nodes.entry(id).or_insert(node))
    }

    /// Start a node that is not yet part of any cluster
    pub async fn provision(&mut self, id: &str) -> Result<&RaftliteNode> {
        let config = self.node_config(id, false);
        self.provision_with(config).await
    }

    /// Start a node that bootstraps a cluster and wait for it to lead
    pub async fn provision_leader(&mut self, id: &str, timeout: Duration) -> Result<&RaftliteNode> {
        let config = self.node_config(id, true);
        let node = self.provision_with(config).await?;
        node.raft().await_leader(timeout).await?;
        Ok(node)
    }

    /// Have node `id` join the cluster through node `via`
    pub async fn join(&self, id: &str, via: &str) -> Result<Index> {
        let node = self.get(id)?;
        let target = self.get(via)?.address().to_string();
        node.join_cluster(&[target]).await
    }

    /// Kill a node without any graceful shutdown and forget it
    pub fn deprovision(&mut self, id: &str) -> Result<()> {
        let node = self
            .nodes
            .remove(id)
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))?;
        node.kill();
        tracing::info!("Deprovisioned node {}", id);
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&RaftliteNode> {
        self.nodes.get(id)
    }

    fn get(&self, id: &str) -> Result<&RaftliteNode> {
        self.node(id).ok_or_else(|| Error::NodeNotFound(id.to_string()))
    }

    pub fn ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The node that considers itself leader in the highest term
    pub fn leader(&self) -> Result<&RaftliteNode> {
        self.nodes
            .values()
            .map(|node| (node, node.status()))
            .filter(|(_, status)| status.role == NodeRole::Leader)
            .max_by_key(|(_, status)| status.term)
            .map(|(node, _)| node)
            .ok_or(Error::NoLeader)
    }

    /// Wait until some node leads
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<&RaftliteNode> {
        self.wait_for_leader_other_than(None, timeout).await
    }

    /// Wait until a node other than `old` leads
    pub async fn wait_for_new_leader(&self, old: &str, timeout: Duration) -> Result<&RaftliteNode> {
        self.wait_for_leader_other_than(Some(old), timeout).await
    }

    async fn wait_for_leader_other_than(
        &self,
        old: Option<&str>,
        timeout: Duration,
    ) -> Result<&RaftliteNode> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(leader) = self.leader() {
                if Some(leader.id()) != old {
                    return Ok(leader);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!("no new leader within {:?}", timeout)));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Shut every node down gracefully
    pub async fn shutdown(self) {
        for (_, node) in self.nodes {
            node.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_provision_and_join() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = LocalCluster::new(dir.path().to_path_buf());

        cluster
            .provision_leader("n1", Duration::from_secs(5))
            .await
            .unwrap();
        cluster.provision("n2").await.unwrap();
        cluster.join("n2", "n1").await.unwrap();

        let leader = cluster.wait_for_leader(Duration::from_secs(5)).await.unwrap();
        assert_eq!(leader.id(), "n1");
        assert_eq!(leader.status().voters.len(), 2);

        let n2 = cluster.node("n2").unwrap();
        assert_eq!(
            n2.raft().await_leader(Duration::from_secs(5)).await.unwrap(),
            "n1"
        );

        // Joining again at the same address changes nothing.
        cluster.join("n2", "n1").await.unwrap();
        assert_eq!(cluster.leader().unwrap().status().voters.len(), 2);

        assert!(cluster.provision("n2").await.is_err());
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_deprovision_unknown_node() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = LocalCluster::new(dir.path().to_path_buf());
        assert!(matches!(cluster.deprovision("nope"), Err(Error::NodeNotFound(_))));
        assert!(matches!(cluster.leader(), Err(Error::NoLeader)));
    }
}
