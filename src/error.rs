//! Error taxonomy for the replicated store.
//!
//! Client-facing failures live in [`StoreError`]; each variant carries
//! enough context for the caller to decide between redirecting, retrying
//! with care, or giving up. Log-level failures live in [`LogError`] and stay inside the
//! consensus layer: a stale-term append makes the node step down rather than
//! bubbling up to the client.
//!
//! A missing key is not an error anywhere in this crate. Reads answer with
//! `Option`.

use std::io;
use std::result;

use thiserror::Error;

use crate::types::{CausalToken, LogIndex, NodeId, Term};

pub type Result<T> = result::Result<T, StoreError>;

/// Failures surfaced to clients of a node.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The operation needs the leader and this node is not it. When the node
    /// knows who leads, `hint` names it so the caller can redirect.
    #[error("not the leader{}", redirect(.hint))]
    NotLeader { hint: Option<NodeId> },

    /// Leadership changed while the write was waiting for its concern. The
    /// entry may or may not survive under the new leader; the outcome is
    /// indeterminate and a blind retry could apply it twice.
    #[error("leadership lost before the write concern was satisfied")]
    LeadershipLost,

    /// The requested concern could not be satisfied within the operation
    /// deadline, for example a majority write with most members down.
    #[error("quorum not reached before the operation deadline")]
    QuorumTimeout,

    /// A causal read waited out the deadline without the serving node
    /// reaching the token's index.
    #[error("causal token {token} not yet satisfied on this node")]
    CausalityNotSatisfied { token: CausalToken },

    /// The durable log append failed; the write was not accepted.
    #[error("log persistence failed")]
    Persist(#[source] io::Error),

    /// The node's worker is gone, typically after shutdown.
    #[error("node is shut down")]
    NodeShutdown,
}

fn redirect(hint: &Option<NodeId>) -> String {
    match hint {
        Some(id) => format!(" (try node {id})"),
        None => String::new(),
    }
}

/// Failures raised by the log store. These never cross the client surface;
/// the consensus layer reacts to them (step down, reject the append) instead.
#[derive(Debug, Error)]
pub enum LogError {
    /// The entry's term is behind the latest term in the log.
    #[error("entry term {entry_term} is behind log term {log_term}")]
    StaleTerm { entry_term: Term, log_term: Term },

    /// The entry would not extend the log contiguously.
    #[error("entry index {index} does not follow last index {last}")]
    IndexGap { index: LogIndex, last: LogIndex },

    /// A truncation would cross the commit watermark. Committed entries are
    /// never rewritten.
    #[error("truncation to {index} would drop committed entries (commit watermark {commit})")]
    TruncatesCommitted { index: LogIndex, commit: LogIndex },

    /// The durable backend refused the entry.
    #[error("persist failed")]
    Persist(#[from] io::Error),
}
