//! Shared vocabulary for the replicated store.
//!
//! Identifiers are plain `u64` aliases so they serialize compactly and
//! compare cheaply. The consistency knobs ([`WriteConcern`], [`ReadConcern`],
//! [`ReadPreference`]) are carried on every client operation; defaults match
//! the safest common choice (majority-durable writes, cheap local reads).

use std::fmt;

/// Unique identifier of a cluster member.
pub type NodeId = u64;

/// Election epoch. Strictly increases across leader changes.
pub type Term = u64;

/// Position of an entry in the replicated log. The first entry has index 1;
/// index 0 means "nothing".
pub type LogIndex = u64;

/// Causality marker handed back by every acknowledged operation.
///
/// A token is the log index the operation observed. A later operation
/// carrying the token is held until the serving node has caught up to that
/// index, which is what makes a session read its own writes.
pub type CausalToken = LogIndex;

/// How many acknowledgments a write collects before the client is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteConcern {
    /// Acknowledged once the leader has appended and persisted locally.
    /// Fast, but the entry can still be rolled back by a failover.
    One,
    /// Acknowledged once a strict majority of members hold the entry. The
    /// entry is at or below the commit watermark and survives failover.
    Majority,
    /// Acknowledged once every configured member holds the entry and it is
    /// committed. Any unreachable member stalls the write into a quorum
    /// timeout.
    All,
}

impl Default for WriteConcern {
    fn default() -> Self {
        WriteConcern::Majority
    }
}

/// Which log prefix a read is allowed to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadConcern {
    /// Newest local entry for the key, committed or not. May be stale on a
    /// lagging replica and may observe a value that is later rolled back.
    Local,
    /// Only the committed prefix, bounded by the leader's commit watermark.
    Majority,
}

impl Default for ReadConcern {
    fn default() -> Self {
        ReadConcern::Local
    }
}

/// Which members are allowed to serve a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPreference {
    /// Only the current leader may answer; other nodes reject the read.
    Leader,
    /// Any member may answer, at whatever staleness its concern allows.
    AnyReplica,
}

impl Default for ReadPreference {
    fn default() -> Self {
        ReadPreference::AnyReplica
    }
}

/// Consensus role of a node within its current term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

/// Acknowledgment returned for a completed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    /// Log index assigned to the entry.
    pub index: LogIndex,
    /// Token to thread into later operations that must observe this write.
    pub token: CausalToken,
}

/// Result of a completed read.
///
/// A missing key is `value: None`, not an error. The token records the log
/// index this read observed so a session can chain causality through reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    pub value: Option<String>,
    pub token: CausalToken,
}
