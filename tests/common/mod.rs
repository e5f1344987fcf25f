//! Shared harness for cluster integration tests.
//!
//! Spawns real nodes with TCP networking on localhost. Timings are shrunk so
//! elections and failovers resolve in tens of milliseconds; each test uses
//! its own port range so test binaries can run in parallel.

#![allow(dead_code)]

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use tokio::time::{sleep, Instant};

use quorum_kv::config::{NodeConfig, TimingConfig};
use quorum_kv::runtime::{spawn_node, NodeHandle};
use quorum_kv::types::{NodeId, Role};

/// Protocol timing scaled down for tests.
pub fn fast_timing() -> TimingConfig {
    TimingConfig {
        heartbeat_interval: Duration::from_millis(50),
        election_timeout_min: Duration::from_millis(150),
        election_timeout_max: Duration::from_millis(300),
        operation_deadline: Duration::from_secs(2),
        offline_after: Duration::from_millis(250),
    }
}

/// Test harness for managing a cluster of real nodes with TCP networking.
pub struct TestCluster {
    handles: Vec<Option<NodeHandle>>,
    configs: Vec<NodeConfig>,
}

impl TestCluster {
    /// Spawns N nodes on localhost with sequential ports starting from
    /// base_port, using [`fast_timing`].
    pub async fn spawn(n: usize, base_port: u16) -> Result<Self> {
        Self::spawn_with_timing(n, base_port, fast_timing()).await
    }

    /// Spawns N nodes with explicit protocol timing.
    pub async fn spawn_with_timing(n: usize, base_port: u16, timing: TimingConfig) -> Result<Self> {
        let mut peers = HashMap::new();
        for i in 0..n {
            let id = (i + 1) as NodeId;
            let port = base_port + i as u16;
            peers.insert(id, format!("127.0.0.1:{}", port));
        }

        let mut handles = Vec::new();
        let mut configs = Vec::new();
        for i in 0..n {
            let id = (i + 1) as NodeId;
            let config = NodeConfig {
                id,
                listen_addr: peers[&id].clone(),
                peers: peers.clone(),
                timing: timing.clone(),
            };
            let handle = spawn_node(config.clone()).await?;
            handles.push(Some(handle));
            configs.push(config);
        }

        // Give nodes time to start listening
        sleep(Duration::from_millis(100)).await;

        Ok(Self { handles, configs })
    }

    /// Gets a node handle by 1-indexed ID. Panics if the node was stopped.
    pub fn node(&self, id: usize) -> &NodeHandle {
        self.handles[id - 1].as_ref().expect("node was stopped")
    }

    /// Stops one node; its pending operations fail and its port closes.
    pub async fn stop(&mut self, id: usize) {
        if let Some(handle) = self.handles[id - 1].take() {
            let _ = handle.shutdown().await;
        }
        sleep(Duration::from_millis(50)).await;
    }

    /// Restarts a stopped node with its original config. The node comes back
    /// empty and must be caught up by the leader.
    pub async fn restart(&mut self, id: usize) -> Result<()> {
        let handle = spawn_node(self.configs[id - 1].clone()).await?;
        self.handles[id - 1] = Some(handle);
        sleep(Duration::from_millis(50)).await;
        Ok(())
    }

    /// IDs of the members currently reporting themselves leader.
    pub async fn current_leaders(&self) -> Vec<usize> {
        let mut leaders = Vec::new();
        for (i, handle) in self.handles.iter().enumerate() {
            if let Some(handle) = handle {
                if let Ok(status) = handle.status().await {
                    if status.role == Role::Leader {
                        leaders.push(i + 1);
                    }
                }
            }
        }
        leaders
    }

    /// Waits for exactly one leader to be elected.
    ///
    /// Returns the leader's ID (1-indexed).
    pub async fn wait_for_single_leader(&self, timeout: Duration) -> Result<usize> {
        let start = Instant::now();
        loop {
            if start.elapsed() > timeout {
                anyhow::bail!("timeout waiting for leader election");
            }
            let leaders = self.current_leaders().await;
            if leaders.len() == 1 {
                return Ok(leaders[0]);
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    /// Waits for a specific node to become leader.
    pub async fn wait_for_node_to_become_leader(
        &self,
        node_id: usize,
        timeout: Duration,
    ) -> Result<()> {
        let start = Instant::now();
        loop {
            if start.elapsed() > timeout {
                anyhow::bail!("timeout waiting for node {} to become leader", node_id);
            }
            if let Ok(status) = self.node(node_id).status().await {
                if status.role == Role::Leader {
                    return Ok(());
                }
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    /// Waits for all running nodes to agree on the same leader.
    pub async fn wait_for_leader_consensus(
        &self,
        expected_leader: NodeId,
        timeout: Duration,
    ) -> Result<()> {
        let start = Instant::now();
        loop {
            if start.elapsed() > timeout {
                anyhow::bail!("timeout waiting for leader consensus");
            }

            let mut all_agree = true;
            for handle in self.handles.iter().flatten() {
                match handle.status().await {
                    Ok(status) if status.leader == Some(expected_leader) => {}
                    _ => {
                        all_agree = false;
                        break;
                    }
                }
            }
            if all_agree {
                return Ok(());
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    /// Shuts down all running nodes.
    pub async fn shutdown(self) -> Result<()> {
        for handle in self.handles.into_iter().flatten() {
            let _ = handle.shutdown().await;
        }
        // Give nodes time to shut down
        sleep(Duration::from_millis(100)).await;
        Ok(())
    }
}
