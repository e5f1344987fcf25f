//! Node and timing configuration.
//!
//! [`NodeConfig`] identifies one member and how to reach the rest of the
//! cluster. [`TimingConfig`] holds every duration the protocol depends on:
//! heartbeat cadence, the randomized election window, how long a client
//! operation may wait for its concern, and when a silent member is reported
//! offline. Tests shrink these to keep failure scenarios fast.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;

use crate::types::NodeId;

/// Identity and membership for one node.
///
/// Every member carries the same `peers` map, including its own entry; the
/// listen address must match what the map says about `id`.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's unique ID (must appear in `peers`).
    pub id: NodeId,
    /// Address to bind for incoming replication traffic, e.g. "127.0.0.1:7101".
    pub listen_addr: String,
    /// Map of node ID to network address for all cluster members (including self).
    pub peers: HashMap<NodeId, String>,
    /// Protocol timing, [`TimingConfig::default`] for production-shaped values.
    pub timing: TimingConfig,
}

/// Every duration the replication protocol runs on.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// How often the leader sends `AppendEntries` to every peer, empty or not.
    /// Must stay well below `election_timeout_min` or followers will start
    /// elections under a healthy leader.
    /// Default: 300ms
    pub heartbeat_interval: Duration,

    /// Lower bound of the randomized election timeout window.
    /// Default: 1s
    pub election_timeout_min: Duration,

    /// Upper bound of the randomized election timeout window. Each re-arm
    /// draws a fresh value from `[min, max]` so simultaneous candidacies
    /// stay unlikely.
    /// Default: 2s
    pub election_timeout_max: Duration,

    /// How long a client operation may wait for its write concern, read
    /// commit bound, or causal token before failing.
    /// Default: 3s
    pub operation_deadline: Duration,

    /// A member silent for longer than this is reported offline in cluster
    /// status. Default: 1.5s (five missed heartbeats)
    pub offline_after: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(300),
            election_timeout_min: Duration::from_secs(1),
            election_timeout_max: Duration::from_secs(2),
            operation_deadline: Duration::from_secs(3),
            offline_after: Duration::from_millis(1500),
        }
    }
}

impl TimingConfig {
    /// Draws a fresh election timeout from the configured window.
    pub fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        if max <= min {
            return self.election_timeout_min;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}
